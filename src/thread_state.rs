//! Per-attached-task bookkeeping (§3 "Thread state").

use crate::arch::GpRegs;
use nix::sys::wait::WaitStatus;

/// Where a thread is in the single-step re-arm dance (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleStepMode {
    None,
    WatchpointReArm,
    HardwareBPReArm,
    HardwareBPContinue,
    SoftwareBP,
    SoftwareBPContinue,
}

impl Default for SingleStepMode {
    fn default() -> Self {
        SingleStepMode::None
    }
}

#[derive(Debug, Default)]
pub struct ThreadState {
    pub tid: i32,
    pub single_step_mode: SingleStepMode,
    pub single_step_counter: u32,
    /// -1 when no re-arm is in flight, else the HW/WP slot index being re-armed.
    pub current_breakpoint_index: i32,
    pub last_regs: Option<GpRegs>,
    pub is_attached: bool,
    pub is_stopped: bool,
    pub stopped_by_user: bool,
    pub pending_signal: i32,
    /// DR7 (or WCR) value to restore after a watchpoint is temporarily
    /// disabled on this thread for re-arm.
    pub saved_watchpoint_control: u64,
    /// -1 when nothing is disabled, else the WP slot temporarily disabled on
    /// this thread.
    pub disabled_watchpoint_index: i32,
    /// Address of the software breakpoint currently being stepped over on
    /// this thread, if any (software entries are address-keyed, unlike the
    /// index-keyed hardware table `current_breakpoint_index` covers).
    pub pending_sw_bp_address: Option<u64>,
    /// A real exception event observed while this thread was being
    /// stopped-for-a-different-reason during a stop-all sweep; replayed on
    /// the next dispatch pass instead of being discarded (§4.2 no-loss
    /// invariant).
    pub buffered_event: Option<WaitStatus>,
}

impl ThreadState {
    pub fn new(tid: i32) -> Self {
        ThreadState {
            tid,
            current_breakpoint_index: -1,
            disabled_watchpoint_index: -1,
            ..Default::default()
        }
    }

    pub fn begin_rearm(&mut self, mode: SingleStepMode, bp_index: i32) {
        self.single_step_mode = mode;
        self.single_step_counter = self.single_step_counter.wrapping_add(1);
        self.current_breakpoint_index = bp_index;
    }

    pub fn clear_rearm(&mut self) {
        self.single_step_mode = SingleStepMode::None;
        self.current_breakpoint_index = -1;
        self.pending_sw_bp_address = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_thread_has_no_active_indices() {
        let t = ThreadState::new(42);
        assert_eq!(t.current_breakpoint_index, -1);
        assert_eq!(t.disabled_watchpoint_index, -1);
        assert_eq!(t.single_step_mode, SingleStepMode::None);
    }

    #[test]
    fn rearm_round_trip() {
        let mut t = ThreadState::new(1);
        t.begin_rearm(SingleStepMode::HardwareBPReArm, 2);
        assert_eq!(t.single_step_mode, SingleStepMode::HardwareBPReArm);
        assert_eq!(t.current_breakpoint_index, 2);
        t.clear_rearm();
        assert_eq!(t.single_step_mode, SingleStepMode::None);
        assert_eq!(t.current_breakpoint_index, -1);
    }
}
