use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::credentials::{Credentials, PasswordPolicy};
use crate::dialogs::DialogTable;
use crate::retry::{millis, RetryPolicy};

pub const LOADER_PATH_VAR: &str = "LOADER_PATH";
pub const APP_PATH_VAR: &str = "APP_PATH";
pub const USER_VAR: &str = "APP_USER";
pub const PASSWORD_VAR: &str = "APP_PASSWORD";
/// `ENV=prod` starts the client through its loader.
pub const ENVIRONMENT_VAR: &str = "ENV";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Unsupported config format '{0}', expected .json, .yaml or .yml")]
    UnsupportedFormat(String),

    #[error("{0} not set in the environment variables")]
    MissingVar(&'static str),
}

/// Everything the session controller needs besides the driver, the reaper
/// and the credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub loader_path: Option<PathBuf>,
    pub app_path: PathBuf,
    /// Start through the loader instead of the client executable
    pub use_loader: bool,
    /// Process names reaped on teardown
    pub process_patterns: Vec<String>,
    /// Spreadsheet viewers the client opens after an export
    pub viewer_patterns: Vec<String>,
    pub launch_policy: RetryPolicy,
    pub rotation_policy: RetryPolicy,
    pub scan_policy: RetryPolicy,
    /// Full relaunches allowed for one mode body
    pub max_restarts: u32,
    /// Launch attempts and restarts allowed over the controller's lifetime
    pub max_total_attempts: u32,
    #[serde(with = "millis", rename = "window_timeout_ms")]
    pub window_timeout: Duration,
    /// Pause after UI actions the client answers asynchronously
    #[serde(with = "millis", rename = "settle_ms")]
    pub settle: Duration,
    #[serde(with = "millis", rename = "launch_settle_ms")]
    pub launch_settle: Duration,
    /// Time reaped processes get to exit before they are force-killed
    #[serde(with = "millis", rename = "exit_grace_ms")]
    pub exit_grace: Duration,
    /// Time after which processes still alive fail the launch attempt
    #[serde(with = "millis", rename = "exit_timeout_ms")]
    pub exit_timeout: Duration,
    /// Mode opened right after login to prove the client responds
    pub probe_mode: String,
    pub password_policy: PasswordPolicy,
    pub dialogs: DialogTable,
    pub click_margin: i32,
    pub scan_step: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loader_path: None,
            app_path: PathBuf::new(),
            use_loader: false,
            process_patterns: vec!["AppLoader".to_string(), "COLVIR".to_string()],
            viewer_patterns: vec!["EXCEL".to_string()],
            launch_policy: RetryPolicy::new(10, Duration::from_secs(2)),
            rotation_policy: RetryPolicy::new(3, Duration::from_secs(1)),
            scan_policy: RetryPolicy::new(3, Duration::from_millis(500)),
            max_restarts: 1,
            max_total_attempts: 20,
            window_timeout: Duration::from_secs(20),
            settle: Duration::from_secs(1),
            launch_settle: Duration::from_secs(2),
            exit_grace: Duration::from_secs(3),
            exit_timeout: Duration::from_secs(10),
            probe_mode: "TREPRT".to_string(),
            // The client rejects punctuation but wants three of each other class.
            password_policy: PasswordPolicy {
                length: 12,
                min_digits: 3,
                min_lower: 3,
                min_upper: 3,
                min_punct: 0,
            },
            dialogs: DialogTable::default(),
            click_margin: crate::locator::DEFAULT_CLICK_MARGIN,
            scan_step: crate::locator::DEFAULT_STEP,
        }
    }
}

impl SessionConfig {
    /// Loads a config file; the format follows the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "json" => Ok(serde_json::from_str(&content)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Overrides paths and the loader switch from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(loader) = env::var(LOADER_PATH_VAR) {
            self.loader_path = Some(PathBuf::from(loader));
        }
        if let Ok(app) = env::var(APP_PATH_VAR) {
            self.app_path = PathBuf::from(app);
        }
        if let Ok(environment) = env::var(ENVIRONMENT_VAR) {
            self.use_loader = environment.eq_ignore_ascii_case("prod");
        }
        debug!(
            app_path = %self.app_path.display(),
            use_loader = self.use_loader,
            "Applied environment overrides"
        );
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Executable started on each launch attempt.
    pub fn launch_target(&self) -> Option<&Path> {
        if self.use_loader {
            self.loader_path.as_deref()
        } else {
            Some(self.app_path.as_path())
        }
    }
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(required_var(USER_VAR)?, required_var(PASSWORD_VAR)?))
    }
}
