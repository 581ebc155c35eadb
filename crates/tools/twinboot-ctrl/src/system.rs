//! The updater as configured for this machine.

use std::path::PathBuf;

use tracing::info;
use twinboot_cli::CancelFlag;
use twinboot_verity::Sha256TreeBuilder;

use crate::boot_entries::BootEntryWriter;
use crate::config::CtrlConfig;
use crate::device::PartitionDevices;
use crate::errors::{session_error, CtrlResult};
use crate::orchestrator::Orchestrator;
use crate::rollback::RollbackController;
use crate::slots::SlotManager;
use crate::state::{BootState, DirStateStore, HistoryEntry, Slot, StateStore};
use crate::status::{status, StatusReport};

pub struct System {
    pub config: CtrlConfig,
    store: DirStateStore,
    devices: PartitionDevices,
    entries: BootEntryWriter,
    tree_builder: Sha256TreeBuilder,
}

impl System {
    pub fn initialize(config: CtrlConfig) -> Self {
        let store = DirStateStore::new(&config.state_dir);
        let devices = PartitionDevices::from_config(&config.slots);
        let entries = BootEntryWriter::from_config(&config.boot, config.max_boot_count);
        Self {
            config,
            store,
            devices,
            entries,
            tree_builder: Sha256TreeBuilder,
        }
    }

    pub fn slots(&self) -> SlotManager<'_> {
        SlotManager::new(&self.store, self.config.max_boot_count)
    }

    pub fn entries(&self) -> &BootEntryWriter {
        &self.entries
    }

    /// Directory for staged images.
    pub fn staging_dir(&self) -> PathBuf {
        self.store.root().join("staging")
    }

    pub fn orchestrator(&self, cancel: Option<CancelFlag>) -> Orchestrator<'_> {
        let orchestrator = Orchestrator::new(
            self.slots(),
            &self.tree_builder,
            &self.devices,
            &self.entries,
            self.staging_dir(),
        )
        .with_default_params(self.config.verity.params());
        match cancel {
            Some(cancel) => orchestrator.with_cancel(cancel),
            None => orchestrator,
        }
    }

    pub fn rollback_controller(&self) -> RollbackController<'_> {
        RollbackController::new(self.slots(), &self.entries)
    }

    pub fn status(&self) -> CtrlResult<StatusReport> {
        status(&self.slots(), &self.entries, self.config.history_limit)
    }

    /// Provision the boot state and write the initial boot entries.
    pub fn provision(&self, active: Slot, root_hash: &str, force: bool) -> CtrlResult<BootState> {
        let _session = self.store.lock_session().map_err(session_error)?;
        let slots = self.slots();
        let state = slots.initialize(active, root_hash, force)?;
        self.entries.refresh(&slots)?;
        Ok(state)
    }

    /// Reset the boot counter of the healthy active slot and its entry's budget.
    pub fn confirm_health(&self) -> CtrlResult<BootState> {
        let _session = self.store.lock_session().map_err(session_error)?;
        let slots = self.slots();
        let state = slots.confirm_health()?;
        self.entries.refresh(&slots)?;
        Ok(state)
    }

    /// Consume one boot attempt and reflect it in the active entry.
    pub fn record_boot_attempt(&self) -> CtrlResult<BootState> {
        let _session = self.store.lock_session().map_err(session_error)?;
        let slots = self.slots();
        let state = slots.record_boot_attempt()?;
        self.entries.refresh(&slots)?;
        info!(
            "slot {} has {} boot attempts left",
            state.active_slot, state.boot_count
        );
        Ok(state)
    }

    pub fn history(&self, limit: usize) -> CtrlResult<Vec<HistoryEntry>> {
        self.slots().history(limit)
    }
}
