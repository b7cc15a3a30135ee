//! SIGSEGV/SIGBUS handling for probes.
//!
//! The handler owns a fault only if the faulting instruction is the probe's read. Every other
//! fault, and a probe fault with no landing pad registered, goes to whatever disposition was in
//! place before we were installed.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{self, Registry};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

const REG_RIP: usize = libc::REG_RIP as usize;
const REG_RAX: usize = libc::REG_RAX as usize;
/// The probe's second argument, the simulated pc, under the System V calling convention.
const REG_RSI: usize = libc::REG_RSI as usize;

/// What the handler needs to know about a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultContext {
    /// Host instruction pointer at the fault.
    pub ip: usize,
    /// Value of the register that carries the simulated pc into the probe. Only meaningful when
    /// `ip` is the protected location.
    pub simulated_pc: usize,
    /// Whether the kernel raised the signal for an actual fault, as opposed to `kill` et al.
    pub kernel_generated: bool,
}

impl FaultContext {
    /// Extract the fault context from the arguments of an `SA_SIGINFO` handler.
    ///
    /// # Safety
    /// `info` and `ctx` must be the pointers the kernel passed to the handler.
    pub unsafe fn from_raw(info: *const libc::siginfo_t, ctx: *const libc::ucontext_t) -> Self {
        let gregs = &(*ctx).uc_mcontext.gregs;
        FaultContext {
            ip: gregs[REG_RIP] as usize,
            simulated_pc: gregs[REG_RSI] as usize,
            // SI_USER, SI_QUEUE, SI_TKILL and friends are all non-positive.
            kernel_generated: (*info).si_code > 0,
        }
    }
}

/// Classification of a single fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// A probe faulted and its simulated instruction is guarded. Resume at the landing pad.
    Probe { simulated_pc: usize, landing_pad: usize },
    /// A probe faulted but nothing guards its simulated instruction. This is a simulator bug.
    UnregisteredProbe { simulated_pc: usize },
    /// Not ours.
    Foreign,
}

/// Decides whether a fault belongs to the probe mechanism.
pub struct Recognizer<'a> {
    protected_ip: usize,
    registry: &'a Registry,
    kernel_signals_only: bool,
}

impl<'a> Recognizer<'a> {
    pub fn new(protected_ip: usize, registry: &'a Registry) -> Self {
        Recognizer { protected_ip, registry, kernel_signals_only: true }
    }

    pub fn kernel_signals_only(mut self, value: bool) -> Self {
        self.kernel_signals_only = value;
        self
    }

    /// Pure apart from the registry read. The registry is only consulted when the fault is at
    /// the protected location.
    #[inline]
    pub fn classify(&self, fault: &FaultContext) -> Fault {
        if fault.ip != self.protected_ip {
            return Fault::Foreign;
        }
        if self.kernel_signals_only && !fault.kernel_generated {
            return Fault::Foreign;
        }
        match self.registry.lookup(fault.simulated_pc) {
            Some(landing_pad) => Fault::Probe { simulated_pc: fault.simulated_pc, landing_pad },
            None => Fault::UnregisteredProbe { simulated_pc: fault.simulated_pc },
        }
    }
}

/// Installed handler state. Written once before the handler is activated, read-only after.
struct Handler {
    config: Config,
    protected_ip: usize,
    continuation: usize,
    prev_segv: libc::sigaction,
    prev_bus: Option<libc::sigaction>,
}

// `sigaction` contains raw pointers, but we only ever hand the copies back to the kernel.
unsafe impl Send for Handler {}
unsafe impl Sync for Handler {}

static HANDLER: OnceCell<Handler> = OnceCell::new();
static ACTIVE: AtomicBool = AtomicBool::new(false);
static INSTALL_LOCK: Mutex<()> = parking_lot::const_mutex(());

unsafe fn query(signal: libc::c_int) -> Result<libc::sigaction> {
    let mut old: libc::sigaction = mem::zeroed();
    if libc::sigaction(signal, ptr::null(), &mut old) != 0 {
        return Err(Error::Install { signal, source: io::Error::last_os_error() });
    }
    Ok(old)
}

impl Handler {
    /// Capture the current dispositions. Nothing is installed yet.
    unsafe fn capture(config: Config) -> Result<Self> {
        Ok(Handler {
            config,
            protected_ip: crate::probe::protected_location(),
            continuation: crate::probe::continuation(),
            prev_segv: query(libc::SIGSEGV)?,
            prev_bus: if config.handle_sigbus { Some(query(libc::SIGBUS)?) } else { None },
        })
    }

    unsafe fn activate(&self) -> Result<()> {
        let mut act: libc::sigaction = mem::zeroed();
        act.sa_sigaction = handle_fault as usize;
        // SA_NODEFER: if the handler itself faults, the nested fault is foreign and falls
        // through to the previous disposition instead of hanging on a blocked signal.
        act.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        if self.config.use_alt_stack {
            act.sa_flags |= libc::SA_ONSTACK;
        }
        libc::sigemptyset(&mut act.sa_mask);

        let mut signals = vec![libc::SIGSEGV];
        if self.prev_bus.is_some() {
            signals.push(libc::SIGBUS);
        }
        for signal in signals {
            if libc::sigaction(signal, &act, ptr::null_mut()) != 0 {
                return Err(Error::Install { signal, source: io::Error::last_os_error() });
            }
        }
        Ok(())
    }

    fn previous(&self, signal: libc::c_int) -> Option<&libc::sigaction> {
        match signal {
            libc::SIGSEGV => Some(&self.prev_segv),
            libc::SIGBUS => self.prev_bus.as_ref(),
            _ => None,
        }
    }
}

/// Install the fault handler with the default configuration.
pub fn init() -> Result<()> {
    install(Config::default())
}

/// Install the fault handler. Must happen before the first probe that may fault.
///
/// Installing again with the same configuration is a no-op.
pub fn install(config: Config) -> Result<()> {
    let _guard = INSTALL_LOCK.lock();

    // A previous attempt may have captured the dispositions but failed to activate.
    let handler = HANDLER.get_or_try_init(|| unsafe { Handler::capture(config) })?;
    if handler.config != config {
        return Err(Error::AlreadyInstalled);
    }
    if ACTIVE.load(Ordering::Acquire) {
        return Ok(());
    }

    unsafe { handler.activate()? };
    ACTIVE.store(true, Ordering::Release);
    info!(
        target: "probe",
        "memory probe handler installed, protected location {:#x}, sigbus {}",
        handler.protected_ip, config.handle_sigbus
    );
    Ok(())
}

pub fn is_installed() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

unsafe extern "C" fn handle_fault(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let handler = match HANDLER.get() {
        Some(handler) => handler,
        // Cannot happen: the cell is filled before activation. Restore the default and let the
        // fault recur.
        None => {
            libc::signal(signal, libc::SIG_DFL);
            return;
        }
    };

    let uc = &mut *(ctx as *mut libc::ucontext_t);
    let fault = FaultContext::from_raw(info, uc);
    let recognizer = Recognizer::new(handler.protected_ip, registry::global())
        .kernel_signals_only(handler.config.kernel_signals_only);

    if let Fault::Probe { landing_pad, .. } = recognizer.classify(&fault) {
        // The probe has not touched the stack, so returning from the continuation goes
        // straight back to the caller with the landing pad as result.
        uc.uc_mcontext.gregs[REG_RAX] = landing_pad as i64;
        uc.uc_mcontext.gregs[REG_RIP] = handler.continuation as i64;
        return;
    }

    match handler.previous(signal) {
        Some(previous) => chain(signal, previous, fault.kernel_generated, info, ctx),
        None => {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
}

/// How a fault we do not own is handed to the disposition we replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Propagation {
    /// Reinstall the old disposition and return. The faulting instruction runs again and the
    /// kernel delivers the fault as if we had never been installed.
    Restore,
    /// Reinstall the old default disposition and send the signal again. Nothing would fault
    /// again for a signal that was sent rather than raised by a fault.
    Reraise,
    /// A sent signal the old disposition ignores.
    Ignore,
    /// Call the old handler the way the kernel would have.
    Call { siginfo: bool, reset: bool },
}

fn propagation(previous: &libc::sigaction, kernel_generated: bool) -> Propagation {
    match previous.sa_sigaction {
        libc::SIG_DFL | libc::SIG_IGN if kernel_generated => Propagation::Restore,
        libc::SIG_DFL => Propagation::Reraise,
        libc::SIG_IGN => Propagation::Ignore,
        _ => Propagation::Call {
            siginfo: previous.sa_flags & libc::SA_SIGINFO != 0,
            reset: previous.sa_flags & libc::SA_RESETHAND != 0,
        },
    }
}

/// Signals the kernel would have blocked while running the old handler, on top of the
/// current mask.
fn chained_mask(previous: &libc::sigaction, signal: libc::c_int) -> libc::sigset_t {
    let mut mask = previous.sa_mask;
    if previous.sa_flags & libc::SA_NODEFER == 0 {
        unsafe { libc::sigaddset(&mut mask, signal) };
    }
    mask
}

/// Put the old disposition back. We no longer see faults after this.
unsafe fn restore(signal: libc::c_int, action: &libc::sigaction) {
    libc::sigaction(signal, action, ptr::null_mut());
    ACTIVE.store(false, Ordering::Release);
}

/// Pass a fault on to the disposition we replaced.
unsafe fn chain(
    signal: libc::c_int,
    previous: &libc::sigaction,
    kernel_generated: bool,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    match propagation(previous, kernel_generated) {
        Propagation::Restore => restore(signal, previous),
        Propagation::Reraise => {
            restore(signal, previous);
            // Not blocked thanks to SA_NODEFER, so this terminates before returning.
            libc::raise(signal);
        }
        Propagation::Ignore => (),
        Propagation::Call { siginfo, reset } => {
            if reset {
                let mut default: libc::sigaction = mem::zeroed();
                default.sa_sigaction = libc::SIG_DFL;
                restore(signal, &default);
            }

            let mask = chained_mask(previous, signal);
            let mut saved: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut saved);
            if siginfo {
                let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    mem::transmute(previous.sa_sigaction);
                f(signal, info, ctx);
            } else {
                let f: extern "C" fn(libc::c_int) = mem::transmute(previous.sa_sigaction);
                f(signal);
            }
            libc::pthread_sigmask(libc::SIG_SETMASK, &saved, ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTECTED: usize = 0x7000_1000;

    fn fault(ip: usize, simulated_pc: usize) -> FaultContext {
        FaultContext { ip, simulated_pc, kernel_generated: true }
    }

    #[test]
    fn test_probe_fault_is_redirected() {
        let registry = Registry::new();
        registry.register(0x1000, 0x2000).unwrap();
        let recognizer = Recognizer::new(PROTECTED, &registry);
        assert_eq!(
            recognizer.classify(&fault(PROTECTED, 0x1000)),
            Fault::Probe { simulated_pc: 0x1000, landing_pad: 0x2000 }
        );
    }

    #[test]
    fn test_unregistered_probe_fault() {
        let registry = Registry::new();
        registry.register(0x1000, 0x2000).unwrap();
        let recognizer = Recognizer::new(PROTECTED, &registry);
        assert_eq!(
            recognizer.classify(&fault(PROTECTED, 0x9999)),
            Fault::UnregisteredProbe { simulated_pc: 0x9999 }
        );
    }

    #[test]
    fn test_foreign_fault_ignores_registry() {
        let registry = Registry::new();
        registry.register(0x1000, 0x2000).unwrap();
        let recognizer = Recognizer::new(PROTECTED, &registry);

        // The register happens to hold a guarded simulated pc, but the instruction is not ours.
        for &ip in &[PROTECTED - 1, PROTECTED + 1, PROTECTED + 2, 0] {
            assert_eq!(recognizer.classify(&fault(ip, 0x1000)), Fault::Foreign);
        }
    }

    #[test]
    fn test_user_signals() {
        let registry = Registry::new();
        registry.register(0x1000, 0x2000).unwrap();
        let sent = FaultContext { ip: PROTECTED, simulated_pc: 0x1000, kernel_generated: false };

        let recognizer = Recognizer::new(PROTECTED, &registry);
        assert_eq!(recognizer.classify(&sent), Fault::Foreign);

        let recognizer = Recognizer::new(PROTECTED, &registry).kernel_signals_only(false);
        assert_eq!(
            recognizer.classify(&sent),
            Fault::Probe { simulated_pc: 0x1000, landing_pad: 0x2000 }
        );
    }

    #[test]
    fn test_install_is_idempotent() {
        init().unwrap();
        init().unwrap();
        assert!(is_installed());
        let other = Config { handle_sigbus: false, ..Config::default() };
        assert!(matches!(install(other), Err(Error::AlreadyInstalled)));
    }

    fn action(handler: libc::sighandler_t, flags: libc::c_int) -> libc::sigaction {
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handler;
        action.sa_flags = flags;
        action
    }

    #[test]
    fn test_propagation_of_default_disposition() {
        let default = action(libc::SIG_DFL, 0);
        assert_eq!(propagation(&default, true), Propagation::Restore);
        // A sent signal must still kill the process.
        assert_eq!(propagation(&default, false), Propagation::Reraise);
    }

    #[test]
    fn test_propagation_of_ignored_disposition() {
        let ignore = action(libc::SIG_IGN, 0);
        assert_eq!(propagation(&ignore, true), Propagation::Restore);
        assert_eq!(propagation(&ignore, false), Propagation::Ignore);
    }

    #[test]
    fn test_propagation_to_handler() {
        let handler = action(0x1234, libc::SA_SIGINFO);
        assert_eq!(propagation(&handler, true), Propagation::Call { siginfo: true, reset: false });
        let handler = action(0x1234, libc::SA_RESETHAND);
        assert_eq!(propagation(&handler, false), Propagation::Call { siginfo: false, reset: true });
    }

    #[test]
    fn test_chained_mask() {
        let mut previous = action(0x1234, libc::SA_SIGINFO);
        unsafe {
            libc::sigemptyset(&mut previous.sa_mask);
            libc::sigaddset(&mut previous.sa_mask, libc::SIGUSR1);
        }

        let mask = chained_mask(&previous, libc::SIGSEGV);
        unsafe {
            assert_eq!(libc::sigismember(&mask, libc::SIGUSR1), 1);
            assert_eq!(libc::sigismember(&mask, libc::SIGSEGV), 1);
            assert_eq!(libc::sigismember(&mask, libc::SIGUSR2), 0);
        }

        previous.sa_flags |= libc::SA_NODEFER;
        let mask = chained_mask(&previous, libc::SIGSEGV);
        unsafe {
            assert_eq!(libc::sigismember(&mask, libc::SIGUSR1), 1);
            assert_eq!(libc::sigismember(&mask, libc::SIGSEGV), 0);
        }
    }
}
