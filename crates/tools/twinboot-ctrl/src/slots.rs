//! Slot bookkeeping on top of the persistent state store.
//!
//! Every mutation computes the complete new record and writes it in one step. There
//! are no field-wise updates of the boot state.

use tracing::{info, warn};
use twinboot_verity::HashDigest;

use crate::errors::{CtrlError, CtrlResult};
use crate::state::{
    unix_now, BootState, HistoryEntry, Slot, StateError, StateStore, UpdateOutcome, VerityRecord,
};

/// Default number of boot attempts granted to a freshly committed slot.
pub const DEFAULT_MAX_BOOT_COUNT: u32 = 3;

/// Slot bookkeeping operations.
#[derive(Clone, Copy)]
pub struct SlotManager<'s> {
    store: &'s dyn StateStore,
    max_boot_count: u32,
}

impl<'s> SlotManager<'s> {
    pub fn new(store: &'s dyn StateStore, max_boot_count: u32) -> Self {
        Self {
            store,
            max_boot_count,
        }
    }

    pub fn store(&self) -> &'s dyn StateStore {
        self.store
    }

    pub fn max_boot_count(&self) -> u32 {
        self.max_boot_count
    }

    /// Current boot state.
    pub fn boot_state(&self) -> CtrlResult<BootState> {
        self.store
            .read_boot_state()?
            .ok_or(CtrlError::Persistence(StateError::NotInitialized))
    }

    pub fn get_active(&self) -> CtrlResult<Slot> {
        Ok(self.boot_state()?.active_slot)
    }

    pub fn get_inactive(&self) -> CtrlResult<Slot> {
        Ok(self.get_active()?.other())
    }

    /// Integrity record of the slot, `None` if the slot is unknown.
    pub fn verity(&self, slot: Slot) -> CtrlResult<Option<VerityRecord>> {
        Ok(self
            .store
            .read_verity(slot)?
            .filter(|record| record.root_hash().is_some()))
    }

    /// Insert or replace the integrity record of a slot.
    pub fn record_verity(&self, slot: Slot, root_hash: &str) -> CtrlResult<VerityRecord> {
        let root_hash = root_hash.trim();
        if root_hash.is_empty() {
            return Err(CtrlError::IntegrityRecord {
                slot,
                reason: "root hash is empty".to_owned(),
            });
        }
        let digest = root_hash
            .parse::<HashDigest>()
            .map_err(|error| CtrlError::IntegrityRecord {
                slot,
                reason: error.to_string(),
            })?;
        let record = VerityRecord {
            slot,
            root_hash: digest.to_hex(),
            created_at: unix_now(),
        };
        self.store.write_verity(&record)?;
        info!("recorded root hash {digest} for slot {slot}");
        Ok(record)
    }

    /// Mark the slot as unknown.
    pub fn clear_verity(&self, slot: Slot) -> CtrlResult<()> {
        self.store.clear_verity(slot)?;
        info!("cleared integrity record of slot {slot}");
        Ok(())
    }

    /// Make the given slot active with a full boot budget.
    ///
    /// If the boot state cannot be written, the previously active slot stays active.
    /// The history entry is appended afterwards on a best-effort basis; failing to
    /// append it is logged and does not undo the commit.
    pub fn commit(&self, target: Slot) -> CtrlResult<BootState> {
        self.commit_as(target, UpdateOutcome::Success)
    }

    pub(crate) fn commit_as(&self, target: Slot, outcome: UpdateOutcome) -> CtrlResult<BootState> {
        if self.verity(target)?.is_none() {
            return Err(CtrlError::IntegrityRecord {
                slot: target,
                reason: "refusing to activate a slot without integrity record".to_owned(),
            });
        }
        let state = BootState {
            active_slot: target,
            boot_count: self.max_boot_count,
        };
        self.store.write_boot_state(&state)?;
        info!("committed slot {target} ({outcome})");
        self.append_history(outcome, target);
        Ok(state)
    }

    fn append_history(&self, outcome: UpdateOutcome, active_slot: Slot) {
        let entry = HistoryEntry {
            timestamp: unix_now(),
            outcome,
            active_slot,
        };
        // The history is diagnostic only, the committed state stands regardless.
        if let Err(error) = self.store.append_history(&entry) {
            warn!("unable to append history entry: {error}");
        }
    }

    pub fn get_boot_count(&self) -> CtrlResult<u32> {
        Ok(self.boot_state()?.boot_count)
    }

    /// Reset the boot counter of the active slot to the maximum.
    pub fn reset_boot_count(&self) -> CtrlResult<BootState> {
        let state = BootState {
            boot_count: self.max_boot_count,
            ..self.boot_state()?
        };
        self.store.write_boot_state(&state)?;
        Ok(state)
    }

    /// Consume one boot attempt of the active slot.
    pub fn record_boot_attempt(&self) -> CtrlResult<BootState> {
        let current = self.boot_state()?;
        let state = BootState {
            boot_count: current.boot_count.saturating_sub(1),
            ..current
        };
        self.store.write_boot_state(&state)?;
        if state.boot_count == 0 {
            warn!("slot {} has exhausted its boot attempts", state.active_slot);
        }
        Ok(state)
    }

    /// Signal that the running system judged itself healthy.
    pub fn confirm_health(&self) -> CtrlResult<BootState> {
        let state = self.reset_boot_count()?;
        info!("confirmed slot {} as healthy", state.active_slot);
        Ok(state)
    }

    /// Provision the boot state and the integrity record of the initially active slot.
    pub fn initialize(&self, active: Slot, root_hash: &str, force: bool) -> CtrlResult<BootState> {
        if !force && self.store.read_boot_state()?.is_some() {
            return Err(StateError::AlreadyInitialized.into());
        }
        self.record_verity(active, root_hash)?;
        let state = BootState {
            active_slot: active,
            boot_count: self.max_boot_count,
        };
        self.store.write_boot_state(&state)?;
        info!("initialized boot state with active slot {active}");
        Ok(state)
    }

    /// The last `limit` history entries, oldest first.
    pub fn history(&self, limit: usize) -> CtrlResult<Vec<HistoryEntry>> {
        let mut entries = self.store.read_history()?;
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        Ok(entries)
    }
}
