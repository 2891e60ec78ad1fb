//! User-visible notices raised by the recorder
//!
//! The recorder runs detached from any window, so notices go to the log and to
//! stderr. A blocking notice is reserved for peer loss, where the following
//! teardown is expected to produce a burst of transport errors.

#[cfg(test)]
use std::sync::{Mutex, PoisonError};
use tracing::{error, warn};

pub trait Notifier: Send + Sync {
    /// Report a non-fatal problem
    fn notice(&self, message: &str);

    /// Report a condition the user must acknowledge before reading further errors.
    /// Implementations without a modal surface may return at once.
    fn blocking_notice(&self, message: &str);
}

/// Notifier that writes to the tracing log and stderr.
///
/// The console host has no modal dialog, so a blocking notice is only set apart
/// on stderr and logged at error level; it returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notice(&self, message: &str) {
        warn!("{}", message);
        eprintln!("{}", message);
    }

    fn blocking_notice(&self, message: &str) {
        error!("{}", message);
        eprintln!();
        eprintln!("!!! {}", message);
        eprintln!();
    }
}

/// Notifier that keeps every notice in memory
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    notices: Mutex<Vec<String>>,
    blocking: Mutex<Vec<String>>,
}

#[cfg(test)]
impl CollectingNotifier {
    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn blocking_notices(&self) -> Vec<String> {
        self.blocking.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
impl Notifier for CollectingNotifier {
    fn notice(&self, message: &str) {
        warn!("{}", message);
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }

    fn blocking_notice(&self, message: &str) {
        error!("{}", message);
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }
}
