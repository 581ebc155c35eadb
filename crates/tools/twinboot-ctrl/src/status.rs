use serde::Serialize;
use tracing::warn;

use crate::boot_entries::BootEntryWriter;
use crate::errors::CtrlResult;
use crate::slots::SlotManager;
use crate::state::{HistoryEntry, Slot};

/// Snapshot of the slot state for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active_slot: Slot,
    pub inactive_slot: Slot,
    pub boot_count: u32,
    pub max_boot_count: u32,
    pub slots: Vec<SlotStatus>,
    /// Slot the boot loader's default entry points at.
    pub default_entry: Option<Slot>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: Slot,
    pub active: bool,
    /// Recorded root hash, absent if the slot is unknown.
    pub root_hash: Option<String>,
    pub recorded_at: Option<u64>,
}

pub fn status(
    slots: &SlotManager<'_>,
    entries: &BootEntryWriter,
    history_limit: usize,
) -> CtrlResult<StatusReport> {
    let state = slots.boot_state()?;
    let mut slot_status = Vec::new();
    for slot in Slot::ALL {
        let record = slots.verity(slot)?;
        slot_status.push(SlotStatus {
            slot,
            active: slot == state.active_slot,
            recorded_at: record.as_ref().map(|record| record.created_at),
            root_hash: record.map(|record| record.root_hash),
        });
    }
    let default_entry = entries.read_default().unwrap_or_else(|error| {
        warn!("unable to read boot loader default: {error}");
        None
    });
    Ok(StatusReport {
        active_slot: state.active_slot,
        inactive_slot: state.active_slot.other(),
        boot_count: state.boot_count,
        max_boot_count: slots.max_boot_count(),
        slots: slot_status,
        default_entry,
        history: slots.history(history_limit)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::state::MemoryStateStore;

    #[test]
    fn test_status_of_fresh_system() {
        let dir = tempfile::tempdir().unwrap();
        let entries = BootEntryWriter::from_config(
            &BootConfig {
                entries_dir: dir.path().join("entries"),
                loader_conf: dir.path().join("loader.conf"),
                ..BootConfig::default()
            },
            3,
        );
        let store = MemoryStateStore::new();
        let slots = SlotManager::new(&store, 3);
        slots.initialize(Slot::B, &"c".repeat(64), false).unwrap();
        slots.record_boot_attempt().unwrap();

        let report = status(&slots, &entries, 10).unwrap();
        assert_eq!(report.active_slot, Slot::B);
        assert_eq!(report.inactive_slot, Slot::A);
        assert_eq!((report.boot_count, report.max_boot_count), (2, 3));
        assert_eq!(report.slots[0].root_hash, None);
        assert_eq!(report.slots[1].root_hash, Some("c".repeat(64)));
        assert!(report.slots[1].active);
        assert_eq!(report.default_entry, None);
        assert!(report.history.is_empty());
    }
}
