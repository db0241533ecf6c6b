//! Exception records and stop-event classification (§4.5).

use crate::arch::GpRegs;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Breakpoint,
    Watchpoint,
    Signal,
}

/// Delivered to the registered exception sink. The register snapshot
/// reflects state at the moment of stop, not at the moment of dispatch
/// (§5 ordering guarantees) — it's captured once, immediately on
/// classification, and carried through any re-arm bookkeeping unchanged.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub kind: ExceptionKind,
    pub tid: i32,
    pub pc: u64,
    pub mem_addr: Option<u64>,
    pub regs: GpRegs,
    pub seq: u64,
    pub timestamp: SystemTime,
}

/// What a SIGTRAP stop turned out to mean, before it's turned into an
/// `ExceptionRecord` (or silently absorbed into the single-step state
/// machine, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    /// PC lands on (or just past, depending on arch) a known hardware
    /// breakpoint's address.
    HardwareBreakpoint(usize),
    /// A known software breakpoint's trap instruction fired.
    SoftwareBreakpoint(u64),
    /// The single watchpoint slot's data access condition was met.
    Watchpoint,
    /// A single-step completed; the thread's `single_step_mode` (if not
    /// `None`) says what to do next.
    SingleStep,
    /// SIGTRAP with no identifiable cause — e.g. a stray trace trap.
    Unknown,
}

/// Linux `siginfo_t.si_code` values for SIGTRAP, from `bits/siginfo-consts.h`.
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;
const TRAP_HWBKPT: i32 = 4;

/// Reads the stopped thread's siginfo to distinguish why it took SIGTRAP.
/// Hardware breakpoints/watchpoints both report `TRAP_HWBKPT` on Linux; the
/// caller disambiguates between the two using the arch layer's DR6 (x86_64)
/// or the known breakpoint/watchpoint address tables (aarch64, which has no
/// userspace-visible hit register).
pub fn classify_trap(pid: Pid) -> TrapReason {
    match ptrace::getsiginfo(pid) {
        Ok(info) => match info.si_code {
            TRAP_BRKPT => TrapReason::Unknown, // resolved by address lookup at the call site
            TRAP_HWBKPT => TrapReason::Unknown, // resolved by DR6/address lookup at the call site
            TRAP_TRACE => TrapReason::SingleStep,
            _ => TrapReason::Unknown,
        },
        Err(_) => TrapReason::Unknown,
    }
}

/// Small wall-clock helper kept separate from `SystemTime::now()` call
/// sites so the handful of places that need "now" are easy to find; not a
/// behavior difference, just an indirection point.
pub fn now() -> SystemTime {
    SystemTime::now()
}
