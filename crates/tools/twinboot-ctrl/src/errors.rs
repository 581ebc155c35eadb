//! Errors of update, rollback, and slot operations.

use std::io;

use twinboot_verity::{HashDigest, VerityError};

use crate::boot_entries::BootEntryError;
use crate::config::ConfigError;
use crate::state::{Slot, StateError};

/// Error of an update or rollback attempt.
///
/// None of these errors is retried automatically; the caller decides whether to start
/// another attempt.
#[derive(Debug, thiserror::Error)]
pub enum CtrlError {
    #[error("unable to download {name:?}")]
    Download {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("image checksum mismatch (expected {expected:?}, found {found})")]
    ChecksumMismatch {
        expected: String,
        found: HashDigest,
    },
    #[error("integrity tree mismatch: {reason}")]
    IntegrityMismatch { reason: String },
    #[error("slot {slot} does not hold the verified image (expected {expected}, found {found})")]
    WriteVerification {
        slot: Slot,
        expected: HashDigest,
        found: HashDigest,
    },
    #[error("unable to write image to slot {slot}")]
    SlotWrite {
        slot: Slot,
        #[source]
        source: io::Error,
    },
    #[error("unable to read back slot {slot}")]
    SlotRead {
        slot: Slot,
        #[source]
        source: VerityError,
    },
    #[error("unable to verify image")]
    Verification(#[source] VerityError),
    #[error("unable to access persistent state")]
    Persistence(#[from] StateError),
    #[error("invalid integrity record for slot {slot}: {reason}")]
    IntegrityRecord { slot: Slot, reason: String },
    #[error("slot {0} has no integrity record to roll back to")]
    NoRollbackTarget(Slot),
    #[error("unable to write boot entries")]
    BootEntryWrite(#[from] BootEntryError),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("unable to reboot: {0}")]
    Reboot(String),
    #[error("another update or rollback session is in progress")]
    Busy,
    #[error("update cancelled")]
    Cancelled,
}

pub type CtrlResult<T> = Result<T, CtrlError>;

/// Map a failure to acquire the session lock.
pub(crate) fn session_error(error: StateError) -> CtrlError {
    match error {
        StateError::Locked => CtrlError::Busy,
        error => CtrlError::Persistence(error),
    }
}

/// Render an error with all its causes, one per line.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\n  caused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain() {
        let error = CtrlError::SlotWrite {
            slot: Slot::B,
            source: io::Error::other("no space left"),
        };
        assert_eq!(
            error_chain(&error),
            "unable to write image to slot B\n  caused by: no space left"
        );
    }
}
