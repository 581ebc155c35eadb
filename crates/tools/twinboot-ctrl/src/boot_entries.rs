//! Boot loader entries.
//!
//! Every slot has one entry file in the loader's entries directory. The loader's global
//! configuration names the default entry. Entries are never deleted; the entry of the
//! non-default slot stays in place as fallback target.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use twinboot_verity::HashDigest;

use crate::config::BootConfig;
use crate::errors::{CtrlError, CtrlResult};
use crate::fsutils;
use crate::slots::SlotManager;
use crate::state::Slot;

/// Errors of the boot entry writer.
#[derive(Debug, thiserror::Error)]
pub enum BootEntryError {
    #[error("unable to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to read {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed boot entry {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Contents of a boot entry relevant for slot switching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub slot: Slot,
    pub root_hash: HashDigest,
    /// Boot attempts granted after a commit.
    pub tries: u32,
    pub tries_left: u32,
}

/// Renders boot loader configuration files.
pub trait BootEntryRenderer: Send + Sync {
    /// File name of the slot's entry within the entries directory.
    fn file_name(&self, slot: Slot) -> String {
        format!("twinboot-{}.conf", slot.lower())
    }

    fn render_entry(&self, entry: &BootEntry) -> String;

    fn render_loader_config(&self, default_file_name: &str) -> String;
}

/// Renderer for Boot Loader Specification style entries.
#[derive(Debug, Clone)]
pub struct LoaderEntryRenderer {
    pub title: String,
    pub kernel: String,
    pub initrd: String,
    pub root: String,
    pub options: String,
    pub timeout: u32,
}

impl LoaderEntryRenderer {
    pub fn from_config(config: &BootConfig) -> Self {
        Self {
            title: config.title.clone(),
            kernel: config.kernel.clone(),
            initrd: config.initrd.clone(),
            root: config.root.clone(),
            options: config.options.clone(),
            timeout: config.timeout,
        }
    }
}

/// Substitute `{slot}` and `{SLOT}` placeholders.
fn expand(template: &str, slot: Slot) -> String {
    template
        .replace("{slot}", slot.lower())
        .replace("{SLOT}", slot.name())
}

impl BootEntryRenderer for LoaderEntryRenderer {
    fn render_entry(&self, entry: &BootEntry) -> String {
        let slot = entry.slot;
        let hash = entry.root_hash.to_hex();
        let mut options = format!(
            "root={} ro slot={slot} verity_hash={hash} tries={} tries-left={}",
            expand(&self.root, slot),
            entry.tries,
            entry.tries_left,
        );
        let extra = expand(&self.options, slot);
        if !extra.trim().is_empty() {
            options.push(' ');
            options.push_str(extra.trim());
        }
        format!(
            "title {} ({slot})\nversion {}\nlinux {}\ninitrd {}\noptions {options}\n",
            expand(&self.title, slot),
            &hash[..12],
            expand(&self.kernel, slot),
            expand(&self.initrd, slot),
        )
    }

    fn render_loader_config(&self, default_file_name: &str) -> String {
        format!(
            "# Managed by twinboot-ctrl.\ndefault {default_file_name}\ntimeout {}\n",
            self.timeout
        )
    }
}

/// Writes the boot entries of both slots and the loader's default pointer.
pub struct BootEntryWriter {
    entries_dir: PathBuf,
    loader_conf: PathBuf,
    tries: u32,
    renderer: Box<dyn BootEntryRenderer>,
}

impl BootEntryWriter {
    pub fn new(
        entries_dir: impl Into<PathBuf>,
        loader_conf: impl Into<PathBuf>,
        tries: u32,
        renderer: Box<dyn BootEntryRenderer>,
    ) -> Self {
        Self {
            entries_dir: entries_dir.into(),
            loader_conf: loader_conf.into(),
            tries,
            renderer,
        }
    }

    pub fn from_config(config: &BootConfig, tries: u32) -> Self {
        Self::new(
            &config.entries_dir,
            &config.loader_conf,
            tries,
            Box::new(LoaderEntryRenderer::from_config(config)),
        )
    }

    /// Path of the slot's entry file.
    pub fn entry_path(&self, slot: Slot) -> PathBuf {
        self.entries_dir.join(self.renderer.file_name(slot))
    }

    /// Write the entry of a slot, making it the default if requested.
    pub fn write_entry(
        &self,
        slot: Slot,
        root_hash: &HashDigest,
        tries_left: u32,
        is_default: bool,
    ) -> Result<(), BootEntryError> {
        let path = self.entry_path(slot);
        let contents = self.renderer.render_entry(&BootEntry {
            slot,
            root_hash: *root_hash,
            tries: self.tries,
            tries_left,
        });
        write_file(&path, &contents)?;
        debug!("wrote boot entry {path:?}");
        if is_default {
            self.set_default(slot)?;
        }
        Ok(())
    }

    /// Point the loader's default at the slot's entry.
    pub fn set_default(&self, slot: Slot) -> Result<(), BootEntryError> {
        let contents = self
            .renderer
            .render_loader_config(&self.renderer.file_name(slot));
        write_file(&self.loader_conf, &contents)?;
        info!("boot loader default is now slot {slot}");
        Ok(())
    }

    /// Slot the loader's default points at, if any.
    pub fn read_default(&self) -> Result<Option<Slot>, BootEntryError> {
        let Some(contents) = read_file(&self.loader_conf)? else {
            return Ok(None);
        };
        let default = contents.lines().find_map(|line| {
            let (key, value) = line.trim().split_once(char::is_whitespace)?;
            (key == "default").then(|| value.trim().to_owned())
        });
        Ok(default.and_then(|file_name| {
            Slot::ALL
                .into_iter()
                .find(|slot| self.renderer.file_name(*slot) == file_name)
        }))
    }

    /// Leave the slot's entry in place but with no tries left.
    ///
    /// The loader then treats the slot as bad. A missing entry stays missing and an
    /// unreadable one is replaced.
    pub fn disable_entry(&self, slot: Slot) -> Result<(), BootEntryError> {
        if !self.entry_path(slot).exists() {
            return Ok(());
        }
        let root_hash = match self.read_entry(slot) {
            Ok(None) => return Ok(()),
            Ok(Some(entry)) if entry.tries_left == 0 => return Ok(()),
            Ok(Some(entry)) => entry.root_hash,
            Err(error) => {
                warn!("replacing unreadable entry of slot {slot}: {error}");
                HashDigest::new([0; 32])
            }
        };
        self.write_entry(slot, &root_hash, 0, false)?;
        info!("disabled boot entry of slot {slot}");
        Ok(())
    }

    /// Parse the slot's entry file, if it exists.
    pub fn read_entry(&self, slot: Slot) -> Result<Option<BootEntry>, BootEntryError> {
        let path = self.entry_path(slot);
        let Some(contents) = read_file(&path)? else {
            return Ok(None);
        };
        let malformed = |reason: &str| BootEntryError::Malformed {
            path: path.clone(),
            reason: reason.to_owned(),
        };
        let Some(options) = contents
            .lines()
            .find_map(|line| line.trim().strip_prefix("options "))
        else {
            return Err(malformed("missing `options` line"));
        };
        let option = |name: &str| {
            options
                .split_whitespace()
                .find_map(|part| part.strip_prefix(name)?.strip_prefix('='))
        };
        let entry_slot = option("slot")
            .and_then(|value| value.parse::<Slot>().ok())
            .ok_or_else(|| malformed("missing or invalid `slot`"))?;
        if entry_slot != slot {
            return Err(malformed("entry names the wrong slot"));
        }
        let root_hash = option("verity_hash")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| malformed("missing or invalid `verity_hash`"))?;
        let tries = option("tries")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| malformed("missing or invalid `tries`"))?;
        let tries_left = option("tries-left")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| malformed("missing or invalid `tries-left`"))?;
        Ok(Some(BootEntry {
            slot,
            root_hash,
            tries,
            tries_left,
        }))
    }

    /// Bring the entries in line with the persisted slot state.
    ///
    /// The active slot's entry is rewritten with its recorded root hash and remaining
    /// boot attempts and becomes the default. The other slot's entry is only written if
    /// it is missing or disagrees with the slot's integrity record. Without a record, the
    /// other slot's entry is kept but left with no tries.
    pub fn refresh(&self, slots: &SlotManager<'_>) -> CtrlResult<()> {
        let state = slots.boot_state()?;
        let active = state.active_slot;
        let Some(root_hash) = slots
            .verity(active)?
            .and_then(|record| record.root_hash())
        else {
            return Err(CtrlError::IntegrityRecord {
                slot: active,
                reason: "active slot has no integrity record".to_owned(),
            });
        };
        self.write_entry(active, &root_hash, state.boot_count, true)?;

        let fallback = active.other();
        match slots.verity(fallback)?.and_then(|record| record.root_hash()) {
            Some(fallback_hash) => {
                let current = self.read_entry(fallback).unwrap_or_else(|error| {
                    warn!("replacing unreadable fallback entry: {error}");
                    None
                });
                if current.map(|entry| entry.root_hash) != Some(fallback_hash) {
                    self.write_entry(fallback, &fallback_hash, self.tries, false)?;
                }
            }
            None => self.disable_entry(fallback)?,
        }
        Ok(())
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), BootEntryError> {
    fsutils::atomic_write(path, contents.as_bytes()).map_err(|source| BootEntryError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> Result<Option<String>, BootEntryError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(BootEntryError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
