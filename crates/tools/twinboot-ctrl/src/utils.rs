use xscript::{run, Run};

use crate::errors::{CtrlError, CtrlResult};

/// Reboot the system.
pub fn reboot() -> CtrlResult<()> {
    // Make sure that no data is lost.
    nix::unistd::sync();
    run!(["reboot"]).map_err(|error| CtrlError::Reboot(error.to_string()))?;
    Ok(())
}
