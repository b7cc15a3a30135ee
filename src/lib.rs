//! Trap-based memory probing for instruction-set simulators.
//!
//! A simulator cannot let the host fault on behalf of a simulated instruction, because the host
//! instruction pointer tells nothing about which simulated instruction was running. Instead it
//! calls [`probe`] with the address about to be accessed and the simulated pc. The probe reads
//! one byte at a single, fixed host instruction. If that read faults, the handler installed by
//! [`init`] looks up the simulated pc in the [`registry`] and makes the probe return the
//! registered landing pad. Any other fault is passed on untouched.
//!
//! ```no_run
//! simprobe::init().unwrap();
//! simprobe::registry::register(0x1000, 0x2000).unwrap();
//! match simprobe::probe(0x8000_0000, 0x1000) {
//!     simprobe::ProbeResult::Success => { /* perform the access */ }
//!     simprobe::ProbeResult::Redirect(pad) => { /* raise the simulated trap at `pad` */ }
//! }
//! ```

#[macro_use]
extern crate log;

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("memory probes are only implemented for x86_64 Linux hosts");

#[cfg(feature = "target-x86_64")]
compile_error!("memory probes are only usable when simulating a non-x86_64 target on x86_64");

#[cfg(not(any(feature = "target-riscv64", feature = "target-aarch64", feature = "target-x86_64")))]
compile_error!("select the simulated target with one of the `target-*` features");

#[cfg(all(feature = "target-riscv64", feature = "target-aarch64"))]
compile_error!("only one simulated target may be selected");

pub mod config;
mod error;
pub mod probe;
pub mod registry;
pub mod signal;

pub use config::Config;
pub use error::{Error, Result};
pub use probe::{probe, probe_ptr, probe_raw, ProbeResult};
pub use registry::{LandingPadEntry, RegionId, Registry};
pub use signal::{init, install, is_installed};

/// Instruction set being simulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulatedArch {
    Riscv64,
    Aarch64,
}

#[cfg(feature = "target-riscv64")]
pub const SIMULATED_ARCH: SimulatedArch = SimulatedArch::Riscv64;

#[cfg(all(feature = "target-aarch64", not(feature = "target-riscv64")))]
pub const SIMULATED_ARCH: SimulatedArch = SimulatedArch::Aarch64;
