//! A/B slot updater with dm-verity integrity checks and boot counters.
//!
//! Images are only ever written to the inactive slot. A slot becomes active in a single
//! atomic write of the boot state, and only after its written bytes were verified
//! against the image's integrity tree. The boot loader's entries encode each slot's
//! root hash and the remaining boot attempts, so the firmware can fall back to the
//! other slot on its own.

pub mod boot_entries;
pub mod cli;
pub mod config;
pub mod device;
pub mod errors;
pub mod fsutils;
pub mod orchestrator;
pub mod rollback;
pub mod slots;
pub mod source;
pub mod state;
pub mod status;
pub mod system;
pub mod utils;
