use crate::core::DeviceId;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ok,
    /// Already held by another queue of this instance.
    Busy(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Ok,
    NotHeld,
}

/// Advisory device ownership between sibling queues of one scheduler
/// instance. Foreign users are excluded by probing, never by this table.
///
/// Invariant: a device id maps to at most one queue id at any instant.
#[derive(Debug, Default)]
pub struct DeviceLedger {
    held: Mutex<HashMap<DeviceId, u32>>,
}

impl DeviceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, device: DeviceId, queue_id: u32) -> AcquireOutcome {
        let mut held = self.held.lock().unwrap();
        match held.get(&device) {
            Some(&owner) if owner != queue_id => AcquireOutcome::Busy(owner),
            _ => {
                held.insert(device, queue_id);
                AcquireOutcome::Ok
            }
        }
    }

    /// Release succeeds only for the holding queue; a stale release from a
    /// queue that lost a race is reported, not applied.
    pub fn release(&self, device: DeviceId, queue_id: u32) -> ReleaseOutcome {
        let mut held = self.held.lock().unwrap();
        match held.get(&device) {
            Some(&owner) if owner == queue_id => {
                held.remove(&device);
                ReleaseOutcome::Ok
            }
            _ => ReleaseOutcome::NotHeld,
        }
    }

    pub fn is_held(&self, device: DeviceId) -> Option<u32> {
        self.held.lock().unwrap().get(&device).copied()
    }

    pub fn held_set(&self) -> HashMap<DeviceId, u32> {
        self.held.lock().unwrap().clone()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release() {
        let ledger = DeviceLedger::new();
        assert_eq!(ledger.acquire(0, 1), AcquireOutcome::Ok);
        assert_eq!(ledger.is_held(0), Some(1));
        assert_eq!(ledger.release(0, 1), ReleaseOutcome::Ok);
        assert_eq!(ledger.is_held(0), None);
    }

    #[test]
    fn second_queue_sees_busy() {
        let ledger = DeviceLedger::new();
        assert_eq!(ledger.acquire(3, 1), AcquireOutcome::Ok);
        assert_eq!(ledger.acquire(3, 2), AcquireOutcome::Busy(1));
        // Holder is unchanged by the failed attempt.
        assert_eq!(ledger.is_held(3), Some(1));
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let ledger = DeviceLedger::new();
        ledger.acquire(0, 1);
        assert_eq!(ledger.release(0, 2), ReleaseOutcome::NotHeld);
        assert_eq!(ledger.is_held(0), Some(1));
        assert_eq!(ledger.release(5, 1), ReleaseOutcome::NotHeld);
    }

    #[test]
    fn held_set_reflects_all_owners() {
        let ledger = DeviceLedger::new();
        ledger.acquire(0, 1);
        ledger.acquire(1, 1);
        ledger.acquire(2, 9);
        let held = ledger.held_set();
        assert_eq!(held.len(), 3);
        assert_eq!(held[&0], 1);
        assert_eq!(held[&2], 9);
    }

    #[test]
    fn reacquire_by_holder_is_idempotent() {
        let ledger = DeviceLedger::new();
        ledger.acquire(0, 1);
        assert_eq!(ledger.acquire(0, 1), AcquireOutcome::Ok);
        assert_eq!(ledger.held_count(), 1);
    }
}
