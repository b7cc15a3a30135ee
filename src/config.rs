#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

fn return_true() -> bool {
    true
}

/// Options applied when the fault handler is installed.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Also intercept SIGBUS. Some kernels report faults on truncated file mappings this way.
    #[cfg_attr(feature = "serde", serde(default = "return_true"))]
    pub handle_sigbus: bool,

    /// Only signals raised by the kernel for a real fault are considered. A SIGSEGV sent with
    /// `kill` while the thread happens to sit on the probe instruction is passed on.
    #[cfg_attr(feature = "serde", serde(default = "return_true"))]
    pub kernel_signals_only: bool,

    /// Request `SA_ONSTACK`, so the handler runs on the alternate signal stack if the thread
    /// has one.
    #[cfg_attr(feature = "serde", serde(default = "return_true"))]
    pub use_alt_stack: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            handle_sigbus: return_true(),
            kernel_signals_only: return_true(),
            use_alt_stack: return_true(),
        }
    }
}
