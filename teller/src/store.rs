//! Persistence of rotated credentials.
//!
//! The client has already accepted a rotated password by the time the
//! controller learns about it, so the store is called synchronously before
//! the session does anything else. A failed write is fatal.

use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::config::PASSWORD_VAR;
use crate::errors::SessionError;

pub trait CredentialStore: Send + Sync {
    fn store_password(&self, username: &str, password: &str) -> Result<(), SessionError>;
}

/// Rewrites one `KEY=value` line of a dotenv file, keeping a timestamped
/// copy of the previous file.
#[derive(Debug, Clone)]
pub struct EnvFileStore {
    env_path: PathBuf,
    backup_dir: PathBuf,
    key: String,
}

impl EnvFileStore {
    pub fn new(env_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            env_path: env_path.into(),
            backup_dir: backup_dir.into(),
            key: PASSWORD_VAR.to_string(),
        }
    }

    fn backup(&self) -> Result<Option<PathBuf>, SessionError> {
        if !self.env_path.exists() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.backup_dir).map_err(persistence)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = self.backup_dir.join(format!(".env.backup_{timestamp}"));
        std::fs::copy(&self.env_path, &backup_path).map_err(persistence)?;
        info!("Backup created: {}", backup_path.display());
        Ok(Some(backup_path))
    }

    fn write_atomically(&self, content: &str) -> Result<(), SessionError> {
        let dir = self
            .env_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(persistence)?;
        file.write_all(content.as_bytes()).map_err(persistence)?;
        file.persist(&self.env_path)
            .map_err(|e| persistence(e.error))?;
        Ok(())
    }
}

fn persistence(e: std::io::Error) -> SessionError {
    SessionError::Persistence(e.to_string())
}

/// Quotes a dotenv value so it reads back literally. Single quotes keep
/// `$` literal; values holding a single quote, or ending in a backslash the
/// reader would take as escaping the closing quote, go in double quotes
/// with `\`, `"` and `$` escaped.
fn quote(value: &str) -> String {
    if value.contains('\'') || value.ends_with('\\') {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$");
        format!("\"{escaped}\"")
    } else {
        format!("'{value}'")
    }
}

fn is_assignment_of(line: &str, key: &str) -> bool {
    let line = line.trim_start();
    let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
    line.strip_prefix(key)
        .map(|rest| rest.trim_start().starts_with('='))
        .unwrap_or(false)
}

/// Replaces every assignment of `key`, or appends one.
fn replace_key(content: &str, key: &str, value: &str) -> String {
    let assignment = format!("{key}={}", quote(value));
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if is_assignment_of(line, key) {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(assignment);
    }
    let mut updated = lines.join("\n");
    updated.push('\n');
    updated
}

impl CredentialStore for EnvFileStore {
    #[instrument(skip(self, password), fields(env = %self.env_path.display()))]
    fn store_password(&self, username: &str, password: &str) -> Result<(), SessionError> {
        self.backup()?;
        let current = match std::fs::read_to_string(&self.env_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(persistence(e)),
        };
        self.write_atomically(&replace_key(&current, &self.key, password))?;
        info!("Stored rotated password for {}", username);
        Ok(())
    }
}
