//! Persistent state store.
//!
//! The store lives on the dedicated persistent-state partition and survives slot
//! overwrites. It holds the boot state (active slot and boot counter), one integrity
//! record per slot, and an append-only update history.

use std::fmt;
use std::fs::File;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use twinboot_verity::HashDigest;

mod dir;
mod memory;

pub use dir::DirStateStore;
pub use memory::{MemoryState, MemoryStateStore};

/// One of the two interchangeable system slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// The respective other slot.
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Uppercase name of the slot.
    pub fn name(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
        }
    }

    /// Lowercase name of the slot, used in file names.
    pub fn lower(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Invalid slot name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid slot {0:?}, expected `A` or `B`")]
pub struct InvalidSlotError(String);

impl FromStr for Slot {
    type Err = InvalidSlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Slot::A),
            "B" | "b" => Ok(Slot::B),
            other => Err(InvalidSlotError(other.to_owned())),
        }
    }
}

/// Persisted boot state, always written as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootState {
    /// Slot the boot firmware should load next.
    pub active_slot: Slot,
    /// Remaining boot attempts of the active slot.
    pub boot_count: u32,
}

/// Integrity record of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerityRecord {
    pub slot: Slot,
    /// Hex-encoded root hash. An empty hash marks the slot as unknown.
    pub root_hash: String,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

impl VerityRecord {
    /// Parsed root hash, `None` if the record is empty or malformed.
    pub fn root_hash(&self) -> Option<HashDigest> {
        self.root_hash.parse().ok()
    }
}

/// Outcome recorded in the update history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOutcome {
    Success,
    Rollback,
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateOutcome::Success => "success",
            UpdateOutcome::Rollback => "rollback",
        })
    }
}

/// Entry of the append-only update history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub outcome: UpdateOutcome,
    pub active_slot: Slot,
}

/// Errors of the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("corrupt state record {record}")]
    Corrupt {
        record: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("boot state has not been initialized")]
    NotInitialized,
    #[error("boot state is already initialized")]
    AlreadyInitialized,
    #[error("another session holds the update lock")]
    Locked,
}

impl StateError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type StateResult<T> = Result<T, StateError>;

/// Durable storage of the boot state, integrity records, and history.
///
/// Every write must be durable before it returns and must replace the record as a
/// whole, so that a crash leaves either the old or the new record.
pub trait StateStore: Send + Sync {
    fn read_boot_state(&self) -> StateResult<Option<BootState>>;

    fn write_boot_state(&self, state: &BootState) -> StateResult<()>;

    fn read_verity(&self, slot: Slot) -> StateResult<Option<VerityRecord>>;

    fn write_verity(&self, record: &VerityRecord) -> StateResult<()>;

    fn clear_verity(&self, slot: Slot) -> StateResult<()>;

    fn append_history(&self, entry: &HistoryEntry) -> StateResult<()>;

    /// History entries, oldest first.
    fn read_history(&self) -> StateResult<Vec<HistoryEntry>>;

    /// Acquire exclusive access for an update or rollback session.
    ///
    /// Fails with [`StateError::Locked`] instead of waiting.
    fn lock_session(&self) -> StateResult<SessionGuard>;
}

/// Exclusive session on a state store, released on drop.
pub struct SessionGuard(GuardInner);

enum GuardInner {
    /// Advisory lock, released when the file is closed.
    File(#[allow(dead_code)] nix::fcntl::Flock<File>),
    Flag(Arc<AtomicBool>),
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match &self.0 {
            GuardInner::File(_) => "SessionGuard(File)",
            GuardInner::Flag(_) => "SessionGuard(Flag)",
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let GuardInner::Flag(flag) = &self.0 {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Current time in seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
