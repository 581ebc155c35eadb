use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{
    BootState, GuardInner, HistoryEntry, SessionGuard, Slot, StateError, StateResult, StateStore,
    VerityRecord,
};
use crate::fsutils;

/// Name of the directory on the state partition.
const STORE_DIR: &str = "twinboot";

/// State store backed by plain files on the persistent-state partition.
///
/// ```text
/// <state-dir>/twinboot/boot-state.json   active slot and boot counter
/// <state-dir>/twinboot/verity-a.json     integrity record of slot A
/// <state-dir>/twinboot/verity-b.json     integrity record of slot B
/// <state-dir>/twinboot/history.jsonl     append-only update history
/// <state-dir>/twinboot/update.lock       session lock
/// ```
#[derive(Debug, Clone)]
pub struct DirStateStore {
    root: PathBuf,
}

impl DirStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().join(STORE_DIR),
        }
    }

    /// Directory holding the records.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn boot_state_path(&self) -> PathBuf {
        self.root.join("boot-state.json")
    }

    fn verity_path(&self, slot: Slot) -> PathBuf {
        self.root.join(format!("verity-{}.json", slot.lower()))
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    fn read_record<T: DeserializeOwned>(&self, path: &Path) -> StateResult<Option<T>> {
        let Some(contents) = fsutils::read_optional(path)
            .map_err(|error| StateError::io(format!("unable to read {path:?}"), error))?
        else {
            return Ok(None);
        };
        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|source| StateError::Corrupt {
                record: path.display().to_string(),
                source,
            })
    }

    fn write_record<T: serde::Serialize>(&self, path: &Path, record: &T) -> StateResult<()> {
        let mut contents = serde_json::to_vec_pretty(record).map_err(|source| {
            StateError::Corrupt {
                record: path.display().to_string(),
                source,
            }
        })?;
        contents.push(b'\n');
        fsutils::atomic_write(path, &contents)
            .map_err(|error| StateError::io(format!("unable to write {path:?}"), error))
    }
}

impl StateStore for DirStateStore {
    fn read_boot_state(&self) -> StateResult<Option<BootState>> {
        self.read_record(&self.boot_state_path())
    }

    fn write_boot_state(&self, state: &BootState) -> StateResult<()> {
        self.write_record(&self.boot_state_path(), state)
    }

    fn read_verity(&self, slot: Slot) -> StateResult<Option<VerityRecord>> {
        let record: Option<VerityRecord> = self.read_record(&self.verity_path(slot))?;
        if let Some(record) = &record {
            if record.slot != slot {
                warn!("integrity record of slot {slot} names slot {}", record.slot);
                return Ok(None);
            }
        }
        Ok(record)
    }

    fn write_verity(&self, record: &VerityRecord) -> StateResult<()> {
        self.write_record(&self.verity_path(record.slot), record)
    }

    fn clear_verity(&self, slot: Slot) -> StateResult<()> {
        let path = self.verity_path(slot);
        fsutils::remove_durable(&path)
            .map_err(|error| StateError::io(format!("unable to remove {path:?}"), error))
    }

    fn append_history(&self, entry: &HistoryEntry) -> StateResult<()> {
        let path = self.history_path();
        let line = serde_json::to_string(entry).map_err(|source| StateError::Corrupt {
            record: path.display().to_string(),
            source,
        })?;
        fsutils::append_line(&path, &line)
            .map_err(|error| StateError::io(format!("unable to append to {path:?}"), error))
    }

    fn read_history(&self) -> StateResult<Vec<HistoryEntry>> {
        let path = self.history_path();
        let Some(contents) = fsutils::read_optional(&path)
            .map_err(|error| StateError::io(format!("unable to read {path:?}"), error))?
        else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for line in String::from_utf8_lossy(&contents).lines() {
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from a crash mid-append is skipped.
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(error) => warn!("skipping invalid history line: {error}"),
            }
        }
        Ok(entries)
    }

    fn lock_session(&self) -> StateResult<SessionGuard> {
        fs::create_dir_all(&self.root)
            .map_err(|error| StateError::io("unable to create state directory", error))?;
        let path = self.root.join("update.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|error| StateError::io(format!("unable to open {path:?}"), error))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(SessionGuard(GuardInner::File(lock))),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(StateError::Locked),
            Err((_, errno)) => Err(StateError::io(
                format!("unable to lock {path:?}"),
                errno.into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::UpdateOutcome;

    #[test]
    fn test_records_round_trip_on_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(temp_dir.path());
        assert_eq!(store.read_boot_state().unwrap(), None);
        assert_eq!(store.read_verity(Slot::A).unwrap(), None);

        let state = BootState {
            active_slot: Slot::B,
            boot_count: 3,
        };
        store.write_boot_state(&state).unwrap();
        assert_eq!(store.read_boot_state().unwrap(), Some(state));

        let record = VerityRecord {
            slot: Slot::A,
            root_hash: "ab".repeat(32),
            created_at: 1,
        };
        store.write_verity(&record).unwrap();
        assert_eq!(store.read_verity(Slot::A).unwrap(), Some(record));
        store.clear_verity(Slot::A).unwrap();
        assert_eq!(store.read_verity(Slot::A).unwrap(), None);
    }

    #[test]
    fn test_empty_verity_file_is_unknown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(temp_dir.path());
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.root().join("verity-b.json"), "").unwrap();
        assert_eq!(store.read_verity(Slot::B).unwrap(), None);
    }

    #[test]
    fn test_corrupt_boot_state_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(temp_dir.path());
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.root().join("boot-state.json"), "{\"active_slot\":").unwrap();
        assert!(matches!(
            store.read_boot_state(),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_history_skips_torn_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(temp_dir.path());
        let entry = HistoryEntry {
            timestamp: 42,
            outcome: UpdateOutcome::Rollback,
            active_slot: Slot::A,
        };
        store.append_history(&entry).unwrap();
        fsutils::append_line(&store.history_path(), "{\"timestamp\":4").unwrap();
        assert_eq!(store.read_history().unwrap(), vec![entry]);
    }

    #[test]
    fn test_session_lock_is_exclusive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirStateStore::new(temp_dir.path());
        let guard = store.lock_session().unwrap();
        assert!(matches!(store.lock_session(), Err(StateError::Locked)));
        drop(guard);
        store.lock_session().unwrap();
    }
}
