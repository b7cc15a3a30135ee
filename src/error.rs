use std::io;
use thiserror::Error;

/// Errors reported by registration and handler installation.
///
/// None of these can originate from the fault path; a fault that cannot be redirected is
/// propagated as a signal instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "simulated pc {simulated_pc:#x} is already guarded by landing pad {existing:#x}, refusing {requested:#x}"
    )]
    Conflict { simulated_pc: usize, existing: usize, requested: usize },

    /// A landing pad of 0 would be indistinguishable from a successful probe.
    #[error("null landing pad for simulated pc {0:#x}")]
    NullLandingPad(usize),

    #[error("fault handler is already installed with a different configuration")]
    AlreadyInstalled,

    #[error("cannot install handler for signal {signal}: {source}")]
    Install {
        signal: libc::c_int,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
