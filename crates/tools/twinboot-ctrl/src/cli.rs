//! Definition of the command line interface (CLI).

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use twinboot_cli::CancelFlag;

use crate::config::load_config;
use crate::errors::CtrlError;
use crate::orchestrator::UpdateFailure;
use crate::source::resolve_source;
use crate::state::Slot;
use crate::system::System;
use crate::utils::reboot;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Ctrl(#[from] CtrlError),
    #[error(transparent)]
    Update(#[from] UpdateFailure),
    #[error("unable to write output")]
    Output(#[from] serde_json::Error),
}

pub fn main() -> Result<(), CliError> {
    twinboot_cli::init_logging();

    let args = Args::parse();
    let config = load_config(args.config.as_deref()).map_err(CtrlError::from)?;
    let system = System::initialize(config);
    match &args.command {
        Command::Update(update_cmd) => match update_cmd {
            UpdateCommand::Install {
                source,
                image,
                reboot: reboot_after,
            } => {
                let (source, image) = resolve_source(source, image.as_deref());
                let report = system
                    .orchestrator(Some(CancelFlag::on_interrupt()))
                    .update(source.as_ref(), &image)
                    .inspect_err(report_failure)?;
                eprintln!(
                    "Installed {image:?} into slot {} (root hash {}).",
                    report.active_slot, report.root_hash
                );
                eprintln!(
                    "Slot {} remains available as fallback.",
                    report.previous_slot
                );
                if *reboot_after {
                    reboot()?;
                }
            }
            UpdateCommand::Verify {
                source,
                image,
                json,
            } => {
                let (source, image) = resolve_source(source, image.as_deref());
                let report = system
                    .orchestrator(Some(CancelFlag::on_interrupt()))
                    .verify_only(source.as_ref(), &image)
                    .inspect_err(report_failure)?;
                eprintln!("Image: {}", report.image);
                eprintln!("Size: {} bytes", report.image_size);
                eprintln!("SHA256: {}", report.sha256);
                eprintln!("Root Hash: {}", report.root_hash);
                print_json(&report, *json)?;
            }
        },
        Command::System(sys_cmd) => match sys_cmd {
            SystemCommand::Info { json } => {
                let status = system.status()?;
                eprintln!("Active Slot: {}", status.active_slot);
                eprintln!(
                    "Boot Count: {}/{}",
                    status.boot_count, status.max_boot_count
                );
                eprintln!(
                    "Default Entry: {}",
                    status
                        .default_entry
                        .map(|slot| slot.to_string())
                        .unwrap_or_else(|| "<unknown>".to_owned())
                );
                for slot in &status.slots {
                    eprintln!(
                        "Slot {}: {} ({})",
                        slot.slot,
                        if slot.active { "active" } else { "inactive" },
                        slot.root_hash.as_deref().unwrap_or("<unknown>")
                    );
                }
                print_json(&status, *json)?;
            }
            SystemCommand::Rollback { reboot: reboot_after } => {
                let report = system.rollback_controller().rollback()?;
                eprintln!(
                    "Rolled back from slot {} to slot {}.",
                    report.previous_slot, report.active_slot
                );
                if *reboot_after {
                    reboot()?;
                }
            }
            SystemCommand::Confirm => {
                let state = system.confirm_health()?;
                eprintln!(
                    "Slot {} confirmed, {} boot attempts available.",
                    state.active_slot, state.boot_count
                );
            }
        },
        Command::State(state_cmd) => match state_cmd {
            StateCommand::Init {
                active,
                root_hash,
                force,
            } => {
                system.provision(*active, root_hash, *force)?;
                eprintln!("Initialized state with active slot {active}.");
            }
            StateCommand::BootAttempt => {
                let state = system.record_boot_attempt()?;
                eprintln!("Boot attempts left: {}", state.boot_count);
            }
            StateCommand::History { limit, json } => {
                let limit = limit.unwrap_or(system.config.history_limit);
                let history = system.history(limit)?;
                for entry in &history {
                    eprintln!(
                        "{} {} slot={}",
                        entry.timestamp, entry.outcome, entry.active_slot
                    );
                }
                print_json(&history, *json)?;
            }
        },
    }
    Ok(())
}

fn report_failure(failure: &UpdateFailure) {
    if !failure.impact.retry_permitted() {
        eprintln!(
            "Do not retry the update. Run `twinboot-ctrl system rollback` to restore a consistent state."
        );
    }
}

/// Write JSON to stdout if requested or nobody is watching the terminal.
fn print_json<T: Serialize>(value: &T, json: bool) -> Result<(), CliError> {
    if json || !twinboot_cli::is_attended() {
        serde_json::to_writer(std::io::stdout(), value)?;
        println!();
    }
    Ok(())
}

#[derive(Debug, Parser)]
#[clap(author, about)]
pub struct Args {
    /// Path to the configuration file.
    #[clap(long, global(true))]
    pub config: Option<PathBuf>,
    /// The command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Install and verify updates.
    #[clap(subcommand)]
    Update(UpdateCommand),
    /// Inspect the system and switch slots.
    #[clap(subcommand)]
    System(SystemCommand),
    /// Manage the persistent slot state.
    #[clap(subcommand)]
    State(StateCommand),
}

#[derive(Debug, Parser)]
pub enum UpdateCommand {
    /// Install an update into the inactive slot.
    Install {
        /// Directory, URL, or path of the image.
        source: String,
        /// Name of the image within the source.
        #[clap(long)]
        image: Option<String>,
        /// Reboot after a successful update.
        #[clap(long)]
        reboot: bool,
    },
    /// Verify an update without installing it.
    Verify {
        /// Directory, URL, or path of the image.
        source: String,
        /// Name of the image within the source.
        #[clap(long)]
        image: Option<String>,
        /// Output the verification result as JSON.
        #[clap(long)]
        json: bool,
    },
}

#[derive(Debug, Parser)]
pub enum SystemCommand {
    Info {
        /// Output system information as JSON.
        #[clap(long)]
        json: bool,
    },
    /// Make the other slot active again.
    Rollback {
        /// Reboot after the rollback.
        #[clap(long)]
        reboot: bool,
    },
    /// Confirm that the running system is healthy.
    Confirm,
}

#[derive(Debug, Parser)]
pub enum StateCommand {
    /// Provision the slot state of a freshly installed system.
    Init {
        /// The slot holding the installed system.
        #[clap(long)]
        active: Slot,
        /// Root hash of the installed system.
        #[clap(long)]
        root_hash: String,
        /// Overwrite existing state.
        #[clap(long)]
        force: bool,
    },
    /// Consume one boot attempt of the active slot.
    BootAttempt,
    /// Show the update history.
    History {
        /// Number of entries to show.
        #[clap(long)]
        limit: Option<usize>,
        /// Output the history as JSON.
        #[clap(long)]
        json: bool,
    },
}
