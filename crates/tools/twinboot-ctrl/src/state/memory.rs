use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    BootState, GuardInner, HistoryEntry, SessionGuard, Slot, StateError, StateResult, StateStore,
    VerityRecord,
};

/// Contents of a [`MemoryStateStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub boot_state: Option<BootState>,
    pub verity: BTreeMap<Slot, VerityRecord>,
    pub history: Vec<HistoryEntry>,
}

/// In-memory state store for tests and dry runs.
///
/// Writes can be made to fail to exercise persistence errors.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
    locked: Arc<AtomicBool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given contents.
    pub fn with_state(state: MemoryState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Make all subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> StateResult<MemoryState> {
        Ok(self.contents()?.clone())
    }

    fn contents(&self) -> StateResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            StateError::io(
                "unable to access state",
                io::Error::other("state store poisoned by a panicking writer"),
            )
        })
    }

    fn check_writable(&self) -> StateResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StateError::io(
                "unable to write state",
                io::Error::other("write rejected by store"),
            ));
        }
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn read_boot_state(&self) -> StateResult<Option<BootState>> {
        Ok(self.contents()?.boot_state)
    }

    fn write_boot_state(&self, state: &BootState) -> StateResult<()> {
        self.check_writable()?;
        self.contents()?.boot_state = Some(*state);
        Ok(())
    }

    fn read_verity(&self, slot: Slot) -> StateResult<Option<VerityRecord>> {
        Ok(self.contents()?.verity.get(&slot).cloned())
    }

    fn write_verity(&self, record: &VerityRecord) -> StateResult<()> {
        self.check_writable()?;
        self.contents()?.verity.insert(record.slot, record.clone());
        Ok(())
    }

    fn clear_verity(&self, slot: Slot) -> StateResult<()> {
        self.check_writable()?;
        self.contents()?.verity.remove(&slot);
        Ok(())
    }

    fn append_history(&self, entry: &HistoryEntry) -> StateResult<()> {
        self.check_writable()?;
        self.contents()?.history.push(entry.clone());
        Ok(())
    }

    fn read_history(&self) -> StateResult<Vec<HistoryEntry>> {
        Ok(self.contents()?.history.clone())
    }

    fn lock_session(&self) -> StateResult<SessionGuard> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::Locked);
        }
        Ok(SessionGuard(GuardInner::Flag(self.locked.clone())))
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;

    use super::*;
    use crate::state::UpdateOutcome;

    #[test]
    fn test_failing_writes_leave_state() {
        let store = MemoryStateStore::new();
        let state = BootState {
            active_slot: Slot::A,
            boot_count: 3,
        };
        store.write_boot_state(&state).unwrap();
        store.set_fail_writes(true);
        assert!(store
            .write_boot_state(&BootState {
                active_slot: Slot::B,
                boot_count: 3,
            })
            .is_err());
        assert_eq!(store.read_boot_state().unwrap(), Some(state));
    }

    #[test]
    fn test_poisoned_store_reports_error() {
        let store = MemoryStateStore::new();
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _contents = store.state.lock().unwrap();
            panic!("writer panicked");
        }));
        assert!(matches!(store.read_boot_state(), Err(StateError::Io { .. })));
        let entry = HistoryEntry {
            timestamp: 0,
            outcome: UpdateOutcome::Success,
            active_slot: Slot::A,
        };
        assert!(store.append_history(&entry).is_err());
        assert!(store.snapshot().is_err());
    }

    #[test]
    fn test_session_lock_released_on_drop() {
        let store = MemoryStateStore::new();
        let guard = store.lock_session().unwrap();
        assert!(matches!(store.lock_session(), Err(StateError::Locked)));
        drop(guard);
        assert!(store.lock_session().is_ok());
    }
}
