use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionState;

/// Errors reported by a [`UiDriver`](crate::driver::UiDriver) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Window not found: {0}")]
    WindowNotFound(String),

    #[error("Control not found: {0}")]
    ControlNotFound(String),

    #[error("Control is not enabled: {0}")]
    ControlNotEnabled(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Application is not running: {0}")]
    NotRunning(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Platform-specific error: {0}")]
    PlatformError(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Could not connect to the application after {attempts} attempts: {message}")]
    Connection { attempts: u32, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Password policy violation: {0}")]
    PasswordPolicyViolation(String),

    #[error("Dialog '{dialog}' did not appear within {timeout:?}")]
    DialogTimeout { dialog: String, timeout: Duration },

    #[error("Toolbar button '{label}' not found after {scans} scans")]
    ButtonLocate { label: String, scans: u32 },

    #[error("Export {} not ready after {elapsed:?}: {last_reason}", path.display())]
    ExportTimeout {
        path: PathBuf,
        elapsed: Duration,
        last_reason: String,
    },

    #[error("Export {} is corrupt: {reason}", path.display())]
    ExportCorrupt { path: PathBuf, reason: String },

    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    #[error("Application {} already has a live session", .0.display())]
    InstanceBusy(PathBuf),

    #[error("Unexpected dialog could not be classified: {0}")]
    UnexpectedDialog(String),

    #[error("{count} process(es) matching '{pattern}' survived teardown")]
    ProcessesSurvived { pattern: String, count: usize },

    #[error("{what} failed after {attempts} attempts")]
    BudgetExhausted { what: String, attempts: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Report conversion failed: {0}")]
    Conversion(String),

    #[error("Failed to persist rotated credential: {0}")]
    Persistence(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Fatal errors end the run; everything else may be recovered by a
    /// full relaunch of the application.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Connection { .. }
                | SessionError::Authentication(_)
                | SessionError::PasswordPolicyViolation(_)
                | SessionError::InvalidState { .. }
                | SessionError::InstanceBusy(_)
                | SessionError::BudgetExhausted { .. }
                | SessionError::InvalidArgument(_)
                | SessionError::Persistence(_)
        )
    }
}
