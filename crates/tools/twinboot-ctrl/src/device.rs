//! Raw access to the slot partitions.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::SlotsConfig;
use crate::state::Slot;

/// Writes images to slots and reads them back.
pub trait BlockDeviceWriter: Send + Sync {
    /// Write the full image to the slot and flush it to stable storage.
    ///
    /// Returns the number of bytes written.
    fn write_image(&self, slot: Slot, image: &mut dyn Read) -> io::Result<u64>;

    /// Read the first `len` bytes of the slot.
    fn read_back(&self, slot: Slot, len: u64) -> io::Result<Box<dyn Read + '_>>;
}

/// The raw partitions of both slots.
#[derive(Debug, Clone)]
pub struct PartitionDevices {
    a: PathBuf,
    b: PathBuf,
}

impl PartitionDevices {
    pub fn new(a: impl Into<PathBuf>, b: impl Into<PathBuf>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }

    pub fn from_config(config: &SlotsConfig) -> Self {
        Self::new(config.device(Slot::A), config.device(Slot::B))
    }

    pub fn device(&self, slot: Slot) -> &Path {
        match slot {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }
}

impl BlockDeviceWriter for PartitionDevices {
    fn write_image(&self, slot: Slot, image: &mut dyn Read) -> io::Result<u64> {
        let device = self.device(slot);
        debug!("writing image to {device:?}");
        // Partitions exist beforehand, never create a regular file in their place.
        let mut file = OpenOptions::new().write(true).open(device)?;
        let written = io::copy(image, &mut file)?;
        file.flush()?;
        file.sync_all()?;
        Ok(written)
    }

    fn read_back(&self, slot: Slot, len: u64) -> io::Result<Box<dyn Read + '_>> {
        let file = File::open(self.device(slot))?;
        Ok(Box::new(BufReader::new(file.take(len))))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let a = temp_dir.path().join("slot-a");
        let b = temp_dir.path().join("slot-b");
        fs::write(&a, vec![0xAA; 64]).unwrap();
        fs::write(&b, vec![0xBB; 64]).unwrap();
        let devices = PartitionDevices::new(&a, &b);

        let written = devices.write_image(Slot::B, &mut &b"image"[..]).unwrap();
        assert_eq!(written, 5);
        let mut contents = Vec::new();
        devices
            .read_back(Slot::B, written)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"image");
        assert_eq!(fs::read(&a).unwrap(), vec![0xAA; 64]);
    }

    #[test]
    fn test_missing_partition() {
        let temp_dir = tempfile::tempdir().unwrap();
        let devices = PartitionDevices::new(
            temp_dir.path().join("slot-a"),
            temp_dir.path().join("slot-b"),
        );
        assert!(devices.write_image(Slot::A, &mut &b"image"[..]).is_err());
        assert!(!temp_dir.path().join("slot-a").exists());
    }
}
