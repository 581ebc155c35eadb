//! Logging and terminal helpers for command line tools.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Re-export tracing macros.
pub use tracing::{debug, error, info, trace, warn};

/// Environment variable controlling the log filter.
pub const LOG_ENV: &str = "TWINBOOT_LOG";

/// Initialize logging to stderr.
///
/// The filter is taken from `TWINBOOT_LOG`, then `RUST_LOG`, and defaults to `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .event_format(format)
        .init();
}

/// Indicates whether a user is attending the terminal.
pub fn is_attended() -> bool {
    console::user_attended_stderr()
}

/// Flag set once the user asked to cancel the running operation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a flag which is set on Ctrl-C or termination.
    pub fn on_interrupt() -> Self {
        let flag = Self::new();
        let handler_flag = flag.clone();
        if let Err(error) = ctrlc::set_handler(move || {
            eprintln!("cancellation requested, waiting for a safe point");
            handler_flag.cancel();
        }) {
            warn!("unable to install interrupt handler: {error}");
        }
        flag
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
