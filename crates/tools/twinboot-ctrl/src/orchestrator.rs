//! Update protocol.
//!
//! An update runs through the following states:
//!
//! ```text
//! Idle → Fetching → ChecksumVerified → IntegrityVerified → Writing → WrittenVerified → Committed
//! ```
//!
//! Any of these may end in `Failed`, reported as [`UpdateFailure`].
//!
//! The image is only ever written to the inactive slot. The slot's boot entry is marked
//! as having no tries left and its integrity record is cleared before the first byte is
//! written and recorded again only after the written
//! bytes have been read back and their tree recomputed. The slot becomes active in a
//! single write of the boot state, after which the boot entries are regenerated.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info, warn};
use twinboot_cli::CancelFlag;
use twinboot_verity::{
    sha256_reader, HashDigest, IntegrityTreeBuilder, VerityError, VerityParams, VerityTree,
};

use crate::boot_entries::BootEntryWriter;
use crate::device::BlockDeviceWriter;
use crate::errors::{error_chain, session_error, CtrlError};
use crate::slots::SlotManager;
use crate::source::{clean_staging, fetch_artifact, ArtifactSource, UpdateArtifact};
use crate::state::Slot;

/// State of an update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    Idle,
    Fetching,
    ChecksumVerified,
    IntegrityVerified,
    Writing,
    WrittenVerified,
    Committed,
    Failed,
    RolledBack,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateState::Idle => "idle",
            UpdateState::Fetching => "fetching",
            UpdateState::ChecksumVerified => "checksum-verified",
            UpdateState::IntegrityVerified => "integrity-verified",
            UpdateState::Writing => "writing",
            UpdateState::WrittenVerified => "written-verified",
            UpdateState::Committed => "committed",
            UpdateState::Failed => "failed",
            UpdateState::RolledBack => "rolled-back",
        })
    }
}

/// What a failed attempt left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureImpact {
    /// Neither slot, record, nor boot entry was modified.
    NothingTouched,
    /// The inactive slot's contents are indeterminate and its record is cleared.
    InactiveSlotUnknown,
    /// The persisted state is committed but the boot entries do not reflect it.
    SplitBrain,
}

impl FailureImpact {
    /// Whether another attempt may be started without operator intervention.
    pub fn retry_permitted(self) -> bool {
        !matches!(self, FailureImpact::SplitBrain)
    }
}

impl fmt::Display for FailureImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureImpact::NothingTouched => "nothing was touched",
            FailureImpact::InactiveSlotUnknown => {
                "the inactive slot is in an unknown state, safe to retry"
            }
            FailureImpact::SplitBrain => {
                "committed but boot entries are inconsistent, manual rollback required"
            }
        })
    }
}

/// Failed update attempt.
#[derive(Debug, thiserror::Error)]
#[error("update failed in state {failed_in} after {last_completed}, {impact}")]
pub struct UpdateFailure {
    #[source]
    pub error: CtrlError,
    /// Terminal state of the attempt, always [`UpdateState::Failed`].
    pub state: UpdateState,
    /// State the attempt was trying to reach.
    pub failed_in: UpdateState,
    /// Last state reached successfully.
    pub last_completed: UpdateState,
    pub impact: FailureImpact,
}

/// Result of a successful update.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub state: UpdateState,
    pub previous_slot: Slot,
    pub active_slot: Slot,
    pub root_hash: HashDigest,
    pub image_size: u64,
}

/// Result of verifying an artifact without installing it.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub state: UpdateState,
    pub image: String,
    pub image_size: u64,
    pub sha256: HashDigest,
    pub root_hash: HashDigest,
    pub data_blocks: u64,
}

/// Progress of one attempt.
struct Progress {
    last_completed: UpdateState,
    impact: FailureImpact,
}

impl Progress {
    fn new() -> Self {
        Self {
            last_completed: UpdateState::Idle,
            impact: FailureImpact::NothingTouched,
        }
    }

    fn reached(&mut self, state: UpdateState) {
        info!("update state: {state}");
        self.last_completed = state;
    }

    fn fail(&self, failed_in: UpdateState, error: impl Into<CtrlError>) -> UpdateFailure {
        let error = error.into();
        error!(
            "update failed in state {failed_in} after {}: {}",
            self.last_completed,
            error_chain(&error)
        );
        UpdateFailure {
            error,
            state: UpdateState::Failed,
            failed_in,
            last_completed: self.last_completed,
            impact: self.impact,
        }
    }
}

/// Drives update attempts.
pub struct Orchestrator<'a> {
    slots: SlotManager<'a>,
    tree_builder: &'a dyn IntegrityTreeBuilder,
    devices: &'a dyn BlockDeviceWriter,
    entries: &'a BootEntryWriter,
    staging_dir: PathBuf,
    default_params: VerityParams,
    cancel: Option<CancelFlag>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        slots: SlotManager<'a>,
        tree_builder: &'a dyn IntegrityTreeBuilder,
        devices: &'a dyn BlockDeviceWriter,
        entries: &'a BootEntryWriter,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            slots,
            tree_builder,
            devices,
            entries,
            staging_dir: staging_dir.into(),
            default_params: VerityParams::default(),
            cancel: None,
        }
    }

    /// Tree parameters for sidecars which do not name them.
    pub fn with_default_params(mut self, params: VerityParams) -> Self {
        self.default_params = params;
        self
    }

    /// Abort the attempt when the flag is set, up to the start of the write.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Install the artifact into the inactive slot and make it active.
    pub fn update(
        &self,
        source: &dyn ArtifactSource,
        image_name: &str,
    ) -> Result<UpdateReport, UpdateFailure> {
        let mut progress = Progress::new();
        let _session = self
            .slots
            .store()
            .lock_session()
            .map_err(|error| progress.fail(UpdateState::Fetching, session_error(error)))?;
        let previous = self
            .slots
            .boot_state()
            .map_err(|error| progress.fail(UpdateState::Fetching, error))?;
        match clean_staging(&self.staging_dir) {
            Ok(0) => {}
            Ok(removed) => info!("removed {removed} leftover staged images"),
            Err(error) => warn!("unable to clean staging directory: {error}"),
        }

        let (artifact, tree) = self.fetch_and_verify(source, image_name, &mut progress)?;

        let target = previous.active_slot.other();
        self.check_cancelled(&progress, UpdateState::Writing)?;
        info!("writing image to inactive slot {target}");
        // From here on, the target slot's contents cannot be trusted until verified.
        progress.impact = FailureImpact::InactiveSlotUnknown;
        self.entries
            .disable_entry(target)
            .map_err(|error| progress.fail(UpdateState::Writing, error))?;
        self.slots
            .clear_verity(target)
            .map_err(|error| progress.fail(UpdateState::Writing, error))?;
        self.write_slot(target, &artifact)
            .map_err(|error| progress.fail(UpdateState::Writing, error))?;
        progress.reached(UpdateState::Writing);

        self.verify_written(target, &artifact, &tree)
            .map_err(|error| progress.fail(UpdateState::WrittenVerified, error))?;
        progress.reached(UpdateState::WrittenVerified);

        self.slots
            .record_verity(target, &tree.root_hash.to_hex())
            .map_err(|error| progress.fail(UpdateState::Committed, error))?;
        self.slots
            .commit(target)
            .map_err(|error| progress.fail(UpdateState::Committed, error))?;
        progress.impact = FailureImpact::SplitBrain;
        self.entries
            .refresh(&self.slots)
            .map_err(|error| progress.fail(UpdateState::Committed, error))?;
        progress.reached(UpdateState::Committed);

        Ok(UpdateReport {
            state: UpdateState::Committed,
            previous_slot: previous.active_slot,
            active_slot: target,
            root_hash: tree.root_hash,
            image_size: artifact.image_size(),
        })
    }

    /// Fetch and verify the artifact without touching any slot.
    pub fn verify_only(
        &self,
        source: &dyn ArtifactSource,
        image_name: &str,
    ) -> Result<VerifyReport, UpdateFailure> {
        let mut progress = Progress::new();
        let (artifact, tree) = self.fetch_and_verify(source, image_name, &mut progress)?;
        let sha256 = artifact.expected_sha256().map_err(|error| {
            progress.fail(UpdateState::ChecksumVerified, CtrlError::Verification(error))
        })?;
        Ok(VerifyReport {
            state: progress.last_completed,
            image: artifact.name.clone(),
            image_size: artifact.image_size(),
            sha256,
            root_hash: tree.root_hash,
            data_blocks: tree.data_blocks,
        })
    }

    /// Run the attempt up to `IntegrityVerified`.
    fn fetch_and_verify(
        &self,
        source: &dyn ArtifactSource,
        image_name: &str,
        progress: &mut Progress,
    ) -> Result<(UpdateArtifact, VerityTree), UpdateFailure> {
        self.check_cancelled(progress, UpdateState::Fetching)?;
        let artifact = fetch_artifact(source, image_name, &self.staging_dir)
            .map_err(|error| progress.fail(UpdateState::Fetching, error))?;
        progress.reached(UpdateState::Fetching);

        self.check_cancelled(progress, UpdateState::ChecksumVerified)?;
        self.verify_checksum(&artifact)
            .map_err(|error| progress.fail(UpdateState::ChecksumVerified, error))?;
        progress.reached(UpdateState::ChecksumVerified);

        self.check_cancelled(progress, UpdateState::IntegrityVerified)?;
        let tree = self
            .verify_integrity(&artifact)
            .map_err(|error| progress.fail(UpdateState::IntegrityVerified, error))?;
        progress.reached(UpdateState::IntegrityVerified);
        Ok((artifact, tree))
    }

    fn check_cancelled(&self, progress: &Progress, next: UpdateState) -> Result<(), UpdateFailure> {
        match &self.cancel {
            Some(cancel) if cancel.is_cancelled() => Err(progress.fail(next, CtrlError::Cancelled)),
            _ => Ok(()),
        }
    }

    fn verify_checksum(&self, artifact: &UpdateArtifact) -> Result<(), CtrlError> {
        let mut image = artifact.open_image().map_err(staged_image_error)?;
        let found = sha256_reader(&mut image).map_err(CtrlError::Verification)?;
        match artifact.expected_sha256() {
            Ok(expected) if expected == found => Ok(()),
            Ok(_) => Err(CtrlError::ChecksumMismatch {
                expected: artifact.expected_sha256_raw().to_owned(),
                found,
            }),
            Err(error) => {
                warn!("unable to parse checksum file: {error}");
                Err(CtrlError::ChecksumMismatch {
                    expected: artifact.expected_sha256_raw().to_owned(),
                    found,
                })
            }
        }
    }

    fn verify_integrity(&self, artifact: &UpdateArtifact) -> Result<VerityTree, CtrlError> {
        let metadata = artifact
            .verity_metadata()
            .map_err(|error| CtrlError::IntegrityMismatch {
                reason: format!("invalid integrity metadata: {error}"),
            })?;
        let params = metadata.params(&self.default_params);
        params
            .validate()
            .map_err(|error| CtrlError::IntegrityMismatch {
                reason: format!("invalid integrity metadata: {error}"),
            })?;
        let mut image = artifact.open_image().map_err(staged_image_error)?;
        let tree = self
            .tree_builder
            .build(&params, &mut image)
            .map_err(CtrlError::Verification)?;
        if let Some(data_blocks) = metadata.data_blocks {
            if data_blocks != tree.data_blocks {
                return Err(CtrlError::IntegrityMismatch {
                    reason: format!(
                        "metadata describes {data_blocks} data blocks, image has {}",
                        tree.data_blocks
                    ),
                });
            }
        }
        if tree.root_hash != metadata.root_hash {
            return Err(CtrlError::IntegrityMismatch {
                reason: format!(
                    "expected root hash {}, computed {}",
                    metadata.root_hash, tree.root_hash
                ),
            });
        }
        Ok(tree)
    }

    fn write_slot(&self, slot: Slot, artifact: &UpdateArtifact) -> Result<(), CtrlError> {
        let slot_write = |source| CtrlError::SlotWrite { slot, source };
        let mut image = artifact.open_image().map_err(slot_write)?;
        let written = self
            .devices
            .write_image(slot, &mut image)
            .map_err(slot_write)?;
        if written != artifact.image_size() {
            return Err(slot_write(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("wrote {written} of {} bytes", artifact.image_size()),
            )));
        }
        Ok(())
    }

    /// Read the slot back and recompute its tree.
    fn verify_written(
        &self,
        slot: Slot,
        artifact: &UpdateArtifact,
        expected: &VerityTree,
    ) -> Result<(), CtrlError> {
        let metadata = artifact
            .verity_metadata()
            .map_err(|error| CtrlError::SlotRead { slot, source: error })?;
        let params = metadata.params(&self.default_params);
        let mut written = self
            .devices
            .read_back(slot, artifact.image_size())
            .map_err(|error| CtrlError::SlotRead {
                slot,
                source: VerityError::Io(error),
            })?;
        let found = self
            .tree_builder
            .build(&params, &mut written)
            .map_err(|error| CtrlError::SlotRead { slot, source: error })?;
        if found.root_hash != expected.root_hash || found.image_size != expected.image_size {
            return Err(CtrlError::WriteVerification {
                slot,
                expected: expected.root_hash,
                found: found.root_hash,
            });
        }
        info!("slot {slot} holds root hash {}", found.root_hash);
        Ok(())
    }
}

fn staged_image_error(error: std::io::Error) -> CtrlError {
    CtrlError::Verification(VerityError::Io(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(UpdateState::IntegrityVerified.to_string(), "integrity-verified");
        assert_eq!(
            serde_json::to_string(&UpdateState::WrittenVerified).unwrap(),
            "\"written-verified\""
        );
    }

    #[test]
    fn test_only_split_brain_halts_retry() {
        assert!(FailureImpact::NothingTouched.retry_permitted());
        assert!(FailureImpact::InactiveSlotUnknown.retry_permitted());
        assert!(!FailureImpact::SplitBrain.retry_permitted());
    }

    #[test]
    fn test_failure_reports_progress() {
        let mut progress = Progress::new();
        progress.reached(UpdateState::Fetching);
        let failure = progress.fail(UpdateState::ChecksumVerified, CtrlError::Cancelled);
        assert_eq!(failure.state, UpdateState::Failed);
        assert_eq!(failure.last_completed, UpdateState::Fetching);
        assert_eq!(failure.impact, FailureImpact::NothingTouched);
        assert_eq!(
            failure.to_string(),
            "update failed in state checksum-verified after fetching, nothing was touched"
        );
    }
}
