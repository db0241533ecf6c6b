//! Fixed-slot hardware watchpoint pool. Capacity defaults to 1 (§4.3's
//! deliberate conservatism) but is a constructor parameter, not a hard
//! compile-time constant, per `spec.md`'s Open Question about whether the
//! limit is a kernel requirement or a stability workaround — see
//! `DESIGN.md` for the resolution.

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointKind {
    Execute,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
pub struct HardwareWatchpointSlot {
    pub used: bool,
    pub address: u64,
    pub size: u8,
    pub kind: WatchpointKind,
}

impl Default for HardwareWatchpointSlot {
    fn default() -> Self {
        HardwareWatchpointSlot {
            used: false,
            address: 0,
            size: 0,
            kind: WatchpointKind::Write,
        }
    }
}

/// Per-slot coordination record for removal vs. in-flight event handling
/// (§3 "Synchronization handles").
#[derive(Debug, Default)]
pub struct SlotSync {
    pub removing: std::sync::atomic::AtomicBool,
    pub active_handlers: std::sync::atomic::AtomicUsize,
}

pub struct HardwareWatchpointTable {
    slots: Vec<HardwareWatchpointSlot>,
    sync: Vec<SlotSync>,
}

impl HardwareWatchpointTable {
    pub fn new(capacity: usize) -> Self {
        HardwareWatchpointTable {
            slots: vec![HardwareWatchpointSlot::default(); capacity],
            sync: (0..capacity).map(|_| SlotSync::default()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn find(&self, address: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.used && s.address == address)
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.used)
    }

    pub fn slot(&self, index: usize) -> &HardwareWatchpointSlot {
        &self.slots[index]
    }

    pub fn sync(&self, index: usize) -> &SlotSync {
        &self.sync[index]
    }

    pub fn allocate(
        &mut self,
        address: u64,
        size: u8,
        kind: WatchpointKind,
    ) -> EngineResult<usize> {
        if self.find(address).is_some() {
            return Err(EngineError::DuplicateAddress(address));
        }
        let index = self.first_free().ok_or(EngineError::NoFreeSlot)?;
        self.slots[index] = HardwareWatchpointSlot {
            used: true,
            address,
            size,
            kind,
        };
        Ok(index)
    }

    pub fn release(&mut self, index: usize) {
        self.slots[index] = HardwareWatchpointSlot::default();
    }

    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &HardwareWatchpointSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rejects_duplicate_address() {
        let mut t = HardwareWatchpointTable::new(1);
        t.allocate(0x1000, 4, WatchpointKind::Write).unwrap();
        let err = t.allocate(0x1000, 4, WatchpointKind::Write).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAddress(0x1000)));
    }

    #[test]
    fn allocate_fails_when_full() {
        let mut t = HardwareWatchpointTable::new(1);
        t.allocate(0x1000, 4, WatchpointKind::Write).unwrap();
        let err = t.allocate(0x2000, 4, WatchpointKind::Write).unwrap_err();
        assert!(matches!(err, EngineError::NoFreeSlot));
    }

    #[test]
    fn release_frees_slot_for_reuse() {
        let mut t = HardwareWatchpointTable::new(1);
        let idx = t.allocate(0x1000, 4, WatchpointKind::Write).unwrap();
        t.release(idx);
        assert!(t.allocate(0x2000, 8, WatchpointKind::ReadWrite).is_ok());
    }
}
