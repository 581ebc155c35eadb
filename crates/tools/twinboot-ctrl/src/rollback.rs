//! Manual rollback to the previously active slot.

use serde::Serialize;
use tracing::info;

use crate::boot_entries::BootEntryWriter;
use crate::errors::{session_error, CtrlError, CtrlResult};
use crate::orchestrator::UpdateState;
use crate::slots::SlotManager;
use crate::state::{Slot, UpdateOutcome};

/// Result of a rollback.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub state: UpdateState,
    pub previous_slot: Slot,
    pub active_slot: Slot,
}

/// Restores the other slot as active without a fresh image.
///
/// The other slot is not re-verified on disk, but it must have an integrity record.
pub struct RollbackController<'a> {
    slots: SlotManager<'a>,
    entries: &'a BootEntryWriter,
}

impl<'a> RollbackController<'a> {
    pub fn new(slots: SlotManager<'a>, entries: &'a BootEntryWriter) -> Self {
        Self { slots, entries }
    }

    pub fn rollback(&self) -> CtrlResult<RollbackReport> {
        let _session = self.slots.store().lock_session().map_err(session_error)?;
        let previous = self.slots.get_active()?;
        let target = previous.other();
        if self.slots.verity(target)?.is_none() {
            return Err(CtrlError::NoRollbackTarget(target));
        }
        self.slots.commit_as(target, UpdateOutcome::Rollback)?;
        self.entries.refresh(&self.slots)?;
        info!("rolled back from slot {previous} to slot {target}");
        Ok(RollbackReport {
            state: UpdateState::RolledBack,
            previous_slot: previous,
            active_slot: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::state::{BootState, MemoryState, MemoryStateStore, StateStore};

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn entries(dir: &tempfile::TempDir) -> BootEntryWriter {
        BootEntryWriter::from_config(
            &BootConfig {
                entries_dir: dir.path().join("entries"),
                loader_conf: dir.path().join("loader.conf"),
                ..BootConfig::default()
            },
            3,
        )
    }

    #[test]
    fn test_rollback_twice_swaps_back() {
        let dir = tempfile::tempdir().unwrap();
        let entries = entries(&dir);
        let store = MemoryStateStore::new();
        let slots = SlotManager::new(&store, 3);
        slots.initialize(Slot::A, HASH_A, false).unwrap();
        slots.record_verity(Slot::B, HASH_B).unwrap();
        let controller = RollbackController::new(slots, &entries);

        assert_eq!(controller.rollback().unwrap().active_slot, Slot::B);
        assert_eq!(entries.read_default().unwrap(), Some(Slot::B));
        assert_eq!(controller.rollback().unwrap().active_slot, Slot::A);
        assert_eq!(entries.read_default().unwrap(), Some(Slot::A));
        let history = slots.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|entry| entry.outcome == UpdateOutcome::Rollback));
    }

    #[test]
    fn test_unknown_target_mutates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let entries = entries(&dir);
        let store = MemoryStateStore::with_state(MemoryState {
            boot_state: Some(BootState {
                active_slot: Slot::B,
                boot_count: 0,
            }),
            ..MemoryState::default()
        });
        let before = store.snapshot().unwrap();
        let controller = RollbackController::new(SlotManager::new(&store, 3), &entries);
        assert!(matches!(
            controller.rollback(),
            Err(CtrlError::NoRollbackTarget(Slot::A))
        ));
        assert_eq!(store.snapshot().unwrap(), before);
        assert!(!dir.path().join("loader.conf").exists());
    }

    #[test]
    fn test_rollback_rejected_during_session() {
        let dir = tempfile::tempdir().unwrap();
        let entries = entries(&dir);
        let store = MemoryStateStore::new();
        let slots = SlotManager::new(&store, 3);
        slots.initialize(Slot::A, HASH_A, false).unwrap();
        slots.record_verity(Slot::B, HASH_B).unwrap();
        let _session = store.lock_session().unwrap();
        assert!(matches!(
            RollbackController::new(slots, &entries).rollback(),
            Err(CtrlError::Busy)
        ));
        assert_eq!(slots.get_active().unwrap(), Slot::A);
    }
}
