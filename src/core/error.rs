//! Error types for the mouse watcher
//!
//! This module defines the error taxonomy shared by the enumerator, the
//! monitor and the CLI. Absent properties and parents are not errors; they
//! surface as `None` from the accessors.

use std::io;
use thiserror::Error;

/// Main error type for the mouse watcher
#[derive(Error, Debug)]
pub enum WatchError {
    /// The device registry could not be opened (context, enumerator or monitor creation failed)
    #[error("Device registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A handle or value that was required is absent
    #[error("{0} is not present")]
    NotPresent(&'static str),

    /// Receiving from the monitor failed; the monitor must be discarded
    #[error("Device monitor failed: {0}")]
    MonitorFailure(#[source] io::Error),

    /// `start` was called on a monitor that is already receiving
    #[error("Monitor has already been started")]
    AlreadyStarted,

    /// The monitor has not been started yet
    #[error("Monitor has not been started")]
    NotStarted,

    /// Filters can only be installed before the monitor starts
    #[error("Monitor filters must be added before start")]
    FilterAfterStart,

    /// The monitor was stopped or has failed before
    #[error("Monitor is closed")]
    MonitorClosed,

    /// The registry rejected a filter
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, WatchError>;

impl WatchError {
    /// Whether the error leaves the component that produced it unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatchError::RegistryUnavailable(_)
                | WatchError::MonitorFailure(_)
                | WatchError::MonitorClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = WatchError::RegistryUnavailable("udev_new returned null".to_string());
        assert_eq!(
            err.to_string(),
            "Device registry unavailable: udev_new returned null"
        );

        let err = WatchError::NotPresent("parent device");
        assert_eq!(err.to_string(), "parent device is not present");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(WatchError::RegistryUnavailable(String::new()).is_fatal());
        assert!(WatchError::MonitorFailure(io::Error::from(io::ErrorKind::Other)).is_fatal());
        assert!(WatchError::MonitorClosed.is_fatal());
        assert!(!WatchError::AlreadyStarted.is_fatal());
        assert!(!WatchError::NotPresent("property").is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let err: WatchError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, WatchError::Io(_)));
    }
}
