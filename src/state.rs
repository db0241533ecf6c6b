//! The tables the debugger thread owns and writes, and that clients may
//! read under a briefly-held lock (§5). Bundled behind one mutex since
//! they're always read/written together during install/remove/dispatch —
//! splitting them into separate locks would just move the coordination
//! problem into "which order do I take three locks in".

use crate::breakpoint::{HardwareBreakpointTable, SoftwareBreakpointTable};
use crate::thread_state::ThreadState;
use crate::watchpoint::HardwareWatchpointTable;
use nix::unistd::Pid;
use std::collections::HashMap;

pub struct EngineInner {
    pub pid: Option<Pid>,
    pub threads: HashMap<i32, ThreadState>,
    pub hw_breakpoints: HardwareBreakpointTable,
    pub sw_breakpoints: SoftwareBreakpointTable,
    pub watchpoints: HardwareWatchpointTable,
    pub next_seq: u64,
}

impl EngineInner {
    pub fn new(max_software_breakpoints: usize, watchpoint_slots: usize) -> Self {
        EngineInner {
            pid: None,
            threads: HashMap::new(),
            hw_breakpoints: HardwareBreakpointTable::new(crate::arch::HW_BP_SLOTS),
            sw_breakpoints: SoftwareBreakpointTable::new(max_software_breakpoints),
            watchpoints: HardwareWatchpointTable::new(watchpoint_slots),
            next_seq: 0,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn attached_tids(&self) -> Vec<i32> {
        self.threads
            .iter()
            .filter(|(_, s)| s.is_attached)
            .map(|(tid, _)| *tid)
            .collect()
    }
}
