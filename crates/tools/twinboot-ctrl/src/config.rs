//! Updater configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use twinboot_verity::VerityParams;

use crate::slots::DEFAULT_MAX_BOOT_COUNT;
use crate::state::Slot;

/// Path of the configuration file.
pub const CTRL_CONFIG_PATH: &str = "/etc/twinboot/ctrl.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read configuration file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to parse configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct CtrlConfig {
    /// Mount point of the persistent-state partition.
    pub state_dir: PathBuf,
    pub max_boot_count: u32,
    /// Number of history entries reported by `system info`.
    pub history_limit: usize,
    pub slots: SlotsConfig,
    pub boot: BootConfig,
    pub verity: VerityConfig,
}

impl Default for CtrlConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/run/twinboot/mounts/state"),
            max_boot_count: DEFAULT_MAX_BOOT_COUNT,
            history_limit: 10,
            slots: SlotsConfig::default(),
            boot: BootConfig::default(),
            verity: VerityConfig::default(),
        }
    }
}

/// Raw partitions of the two slots.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SlotsConfig {
    pub a: PathBuf,
    pub b: PathBuf,
}

impl SlotsConfig {
    pub fn device(&self, slot: Slot) -> &Path {
        match slot {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            a: PathBuf::from("/dev/disk/by-partlabel/slot-a"),
            b: PathBuf::from("/dev/disk/by-partlabel/slot-b"),
        }
    }
}

/// Boot loader entries.
///
/// The `title`, `kernel`, `initrd`, `root`, and `options` templates may contain
/// `{slot}` (lowercase) and `{SLOT}` (uppercase) placeholders.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BootConfig {
    pub entries_dir: PathBuf,
    pub loader_conf: PathBuf,
    pub title: String,
    pub kernel: String,
    pub initrd: String,
    pub root: String,
    pub options: String,
    pub timeout: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            entries_dir: PathBuf::from("/boot/loader/entries"),
            loader_conf: PathBuf::from("/boot/loader/loader.conf"),
            title: "Twinboot OS".to_owned(),
            kernel: "/twinboot/{slot}/vmlinuz".to_owned(),
            initrd: "/twinboot/{slot}/initrd.img".to_owned(),
            root: "PARTLABEL=slot-{slot}".to_owned(),
            options: String::new(),
            timeout: 3,
        }
    }
}

/// Block sizes used when the sidecar does not name them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct VerityConfig {
    pub data_block_size: usize,
    pub hash_block_size: usize,
}

impl VerityConfig {
    pub fn params(&self) -> VerityParams {
        VerityParams {
            data_block_size: self.data_block_size,
            hash_block_size: self.hash_block_size,
            salt: Vec::new(),
        }
    }
}

impl Default for VerityConfig {
    fn default() -> Self {
        let params = VerityParams::default();
        Self {
            data_block_size: params.data_block_size,
            hash_block_size: params.hash_block_size,
        }
    }
}

/// Load the configuration.
///
/// Without an explicit path, a missing default file yields the default configuration.
pub fn load_config(path: Option<&Path>) -> Result<CtrlConfig, ConfigError> {
    let (path, required) = match path {
        Some(path) => (path, true),
        None => (Path::new(CTRL_CONFIG_PATH), false),
    };
    if !required && !path.exists() {
        return Ok(CtrlConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_from_toml() {
        let config = toml::from_str::<CtrlConfig>(indoc! {r#"
            state-dir = "/var/lib/state"
            max-boot-count = 5

            [slots]
            a = "/dev/mmcblk0p2"
            b = "/dev/mmcblk0p3"

            [boot]
            entries-dir = "/efi/loader/entries"
            kernel = "/{slot}/linux"
            options = "quiet console=ttyS0"

            [verity]
            hash-block-size = 1024
        "#})
        .unwrap();
        assert_eq!(config.state_dir, Path::new("/var/lib/state"));
        assert_eq!(config.max_boot_count, 5);
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.slots.device(Slot::B), Path::new("/dev/mmcblk0p3"));
        assert_eq!(config.boot.loader_conf, Path::new("/boot/loader/loader.conf"));
        assert_eq!(config.boot.kernel, "/{slot}/linux");
        assert_eq!(config.verity.data_block_size, 4096);
        assert_eq!(config.verity.params().hash_block_size, 1024);
    }

    #[test]
    fn test_unknown_field() {
        assert!(toml::from_str::<CtrlConfig>("state-directory = \"/state\"").is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("ctrl.toml");
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Read { .. })
        ));
        fs::write(&path, "history-limit = 3\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().history_limit, 3);
    }
}
