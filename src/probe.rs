//! The probe routine itself lives in `probe.s`. This module wraps it and exposes the two code
//! addresses the fault handler needs.

use std::ptr;

extern "C" {
    fn memory_probe(address: usize, simulated_pc: usize) -> usize;
    static memory_probe_fault_ip: u8;
    static memory_probe_continuation: u8;
}

/// Outcome of a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// The byte was readable.
    Success,
    /// The read faulted; resume simulated control flow at this landing pad.
    Redirect(usize),
}

impl ProbeResult {
    /// Interpret the value returned by the probe routine.
    #[inline]
    pub fn from_raw(raw: usize) -> Self {
        if raw == 0 { ProbeResult::Success } else { ProbeResult::Redirect(raw) }
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        match self {
            ProbeResult::Success => 0,
            ProbeResult::Redirect(landing_pad) => landing_pad,
        }
    }

    #[inline]
    pub fn landing_pad(self) -> Option<usize> {
        match self {
            ProbeResult::Success => None,
            ProbeResult::Redirect(landing_pad) => Some(landing_pad),
        }
    }
}

/// Address of the single host instruction that performs the probe read. The fault handler
/// compares the faulting instruction pointer against this and nothing else.
#[inline]
pub fn protected_location() -> usize {
    unsafe { ptr::addr_of!(memory_probe_fault_ip) as usize }
}

/// Address the fault handler resumes at after writing the landing pad into the return register.
#[inline]
pub fn continuation() -> usize {
    unsafe { ptr::addr_of!(memory_probe_continuation) as usize }
}

/// Read one byte at `address` on behalf of the simulated instruction at `simulated_pc`, and
/// return 0 if it is readable.
///
/// If the read faults and a landing pad is registered for `simulated_pc`, that landing pad is
/// returned instead. Otherwise the fault is passed on as if no handler was installed, which
/// normally kills the process: it means the simulator probed an access it did not guard.
/// Nothing besides the single byte at `address` is read, and nothing is written.
#[inline]
pub fn probe_raw(address: usize, simulated_pc: usize) -> usize {
    unsafe { memory_probe(address, simulated_pc) }
}

/// Like [`probe_raw`], but decodes the result.
#[inline]
pub fn probe(address: usize, simulated_pc: usize) -> ProbeResult {
    ProbeResult::from_raw(probe_raw(address, simulated_pc))
}

#[inline]
pub fn probe_ptr<T>(ptr: *const T, simulated_pc: usize) -> ProbeResult {
    probe(ptr as usize, simulated_pc)
}
