//! Export completion checks.
//!
//! The legacy exporter writes a spreadsheet in stages: the file appears,
//! grows while the exporter holds it open, and only at the very end gets its
//! cell formatting. [`ExportVerifier::poll`] tells those stages apart from a
//! finished file and from a file that can never become valid.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::errors::SessionError;

/// Extension written by the legacy exporter.
pub const LEGACY_EXTENSION: &str = "xls";
/// Extension of converted artifacts; same base name as the export.
pub const MODERN_EXTENSION: &str = "xlsx";
/// Rows inspected for the formatting signature.
pub const DEFAULT_INSPECT_ROWS: u32 = 20;

/// Path of the converted artifact for an export.
pub fn converted_path(export: &Path) -> PathBuf {
    export.with_extension(MODERN_EXTENSION)
}

/// One export attempt and the cadence it is polled at.
#[derive(Debug, Clone)]
pub struct ExportTask {
    /// What is being exported, for logs and errors
    pub source: String,
    pub target: PathBuf,
    pub expected_extension: String,
    pub first_poll_delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Whether to run the formatting signature check; plain-text exports
    /// carrying a spreadsheet extension have no formatting to inspect.
    pub inspect_formatting: bool,
}

impl ExportTask {
    pub fn new(source: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            expected_extension: LEGACY_EXTENSION.to_string(),
            first_poll_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30 * 60),
            inspect_formatting: true,
        }
    }

    pub fn with_cadence(mut self, first_poll_delay: Duration, poll_interval: Duration) -> Self {
        self.first_poll_delay = first_poll_delay;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.expected_extension = extension.into();
        self
    }

    pub fn without_formatting_check(mut self) -> Self {
        self.inspect_formatting = false;
        self
    }

    fn file_name(&self) -> String {
        self.target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.target.display().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    Missing,
    Empty,
    Locked,
    /// Content present but the exporter has not applied formatting yet
    Unformatted,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotReadyReason::Missing => "does not exist yet",
            NotReadyReason::Empty => "is empty yet",
            NotReadyReason::Locked => "is locked by a writer",
            NotReadyReason::Unformatted => "is not fully exported yet",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStatus {
    Ready,
    NotReady(NotReadyReason),
    Corrupt(String),
}

/// Converts a legacy spreadsheet into the modern container format.
#[async_trait]
pub trait ReportConverter: Send + Sync {
    async fn convert(&self, source: &Path, dest: &Path) -> Result<(), SessionError>;
}

/// Runs an external office converter. `{source}` and `{outdir}` in the
/// arguments are substituted; the output is expected as
/// `<outdir>/<source stem>.xlsx` and moved to the requested destination.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl Default for CommandConverter {
    fn default() -> Self {
        Self::new(
            "soffice",
            [
                "--headless",
                "--convert-to",
                MODERN_EXTENSION,
                "--outdir",
                "{outdir}",
                "{source}",
            ],
        )
    }
}

impl CommandConverter {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ReportConverter for CommandConverter {
    #[instrument(skip(self))]
    async fn convert(&self, source: &Path, dest: &Path) -> Result<(), SessionError> {
        let outdir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source.to_string_lossy())
                    .replace("{outdir}", &outdir.to_string_lossy())
            })
            .collect();

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| SessionError::Conversion(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(SessionError::Conversion(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stem = source.file_stem().ok_or_else(|| {
            SessionError::Conversion(format!("{} has no file name", source.display()))
        })?;
        let produced = outdir.join(stem).with_extension(MODERN_EXTENSION);
        if produced != dest {
            tokio::fs::rename(&produced, dest).await.map_err(|e| {
                SessionError::Conversion(format!(
                    "converter output {} not found: {e}",
                    produced.display()
                ))
            })?;
        }
        Ok(())
    }
}

/// Converts `source` to `dest` and removes the source on success.
pub async fn convert_report(
    converter: &dyn ReportConverter,
    source: &Path,
    dest: &Path,
) -> Result<(), SessionError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    converter.convert(source, dest).await?;
    tokio::fs::remove_file(source).await?;
    info!("Converted {}", dest.display());
    Ok(())
}

pub trait LockProbe: Send + Sync {
    fn is_locked(&self, path: &Path) -> bool;
}

/// Renames the file onto itself. On Windows this fails while another
/// process holds the file without delete sharing, which is how the exporter
/// keeps it open.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameLockProbe;

impl LockProbe for RenameLockProbe {
    fn is_locked(&self, path: &Path) -> bool {
        std::fs::rename(path, path).is_err()
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("not a readable spreadsheet container: {0}")]
    Container(String),
    #[error("container has no part {0}")]
    MissingPart(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Looks for explicit cell-level formatting in a modern spreadsheet.
pub trait FormattingProbe: Send + Sync {
    fn has_cell_formatting(&self, path: &Path, rows: u32) -> Result<bool, ProbeError>;
}

static ACTIVE_TAB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bactiveTab="(\d+)""#).expect("valid regex"));
static SHEET_REL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<sheet\b[^>]*?\br:id="([^"]+)""#).expect("valid regex"));
static RELATIONSHIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<Relationship\b[^>]*>"#).expect("valid regex"));
static ATTR_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bId="([^"]+)""#).expect("valid regex"));
static ATTR_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bTarget="([^"]+)""#).expect("valid regex"));
static CELL_XFS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<cellXfs\b[^>]*>(.*?)</cellXfs>"#).expect("valid regex"));
static XF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<xf\b[^>]*?(?:/>|>(.*?)</xf>)"#).expect("valid regex"));
static HORIZONTAL_ALIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<alignment\b[^>]*\bhorizontal=""#).expect("valid regex"));
static ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<row\b([^>]*?)(?:/>|>(.*?)</row>)"#).expect("valid regex"));
static ROW_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\br="(\d+)""#).expect("valid regex"));
static CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<c\b([^>]*?)/?>"#).expect("valid regex"));
static STYLE_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bs="(\d+)""#).expect("valid regex"));

/// Treats a cell as formatted when its style carries an explicit horizontal
/// alignment; that is the last thing the legacy exporter writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct XlsxAlignmentProbe;

impl XlsxAlignmentProbe {
    fn read_part(archive: &mut zip::ZipArchive<File>, name: &str) -> Result<Option<String>, ProbeError> {
        let mut part = match archive.by_name(name) {
            Ok(part) => part,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(ProbeError::Container(e.to_string())),
        };
        let mut text = String::new();
        part.read_to_string(&mut text)?;
        Ok(Some(text))
    }

    /// Worksheet part of the active sheet, falling back to the first sheet.
    fn active_sheet_part(archive: &mut zip::ZipArchive<File>) -> Result<String, ProbeError> {
        const FIRST_SHEET: &str = "xl/worksheets/sheet1.xml";

        let Some(workbook) = Self::read_part(archive, "xl/workbook.xml")? else {
            return Ok(FIRST_SHEET.to_string());
        };
        let active = ACTIVE_TAB
            .captures(&workbook)
            .and_then(|c| c[1].parse::<usize>().ok())
            .unwrap_or(0);
        let Some(rel_id) = SHEET_REL_ID
            .captures_iter(&workbook)
            .nth(active)
            .map(|c| c[1].to_string())
        else {
            return Ok(FIRST_SHEET.to_string());
        };
        let Some(rels) = Self::read_part(archive, "xl/_rels/workbook.xml.rels")? else {
            return Ok(FIRST_SHEET.to_string());
        };

        let target = RELATIONSHIP.find_iter(&rels).find_map(|rel| {
            let rel = rel.as_str();
            let id = ATTR_ID.captures(rel)?;
            if id[1] != rel_id {
                return None;
            }
            ATTR_TARGET.captures(rel).map(|t| t[1].to_string())
        });
        Ok(match target {
            Some(target) if target.starts_with('/') => target.trim_start_matches('/').to_string(),
            Some(target) => format!("xl/{target}"),
            None => FIRST_SHEET.to_string(),
        })
    }

    /// For every cell format index, whether it sets a horizontal alignment.
    fn aligned_styles(styles: &str) -> Vec<bool> {
        let Some(cell_xfs) = CELL_XFS.captures(styles) else {
            return Vec::new();
        };
        XF.captures_iter(&cell_xfs[1])
            .map(|xf| {
                xf.get(1)
                    .map(|body| HORIZONTAL_ALIGNMENT.is_match(body.as_str()))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn sheet_has_aligned_cell(sheet: &str, aligned: &[bool], rows: u32) -> bool {
        for (index, row) in ROW.captures_iter(sheet).enumerate() {
            let number = ROW_NUMBER
                .captures(&row[1])
                .and_then(|c| c[1].parse::<u32>().ok())
                .unwrap_or(index as u32 + 1);
            if number > rows {
                break;
            }
            let Some(cells) = row.get(2) else {
                continue;
            };
            let formatted = CELL.captures_iter(cells.as_str()).any(|cell| {
                STYLE_INDEX
                    .captures(&cell[1])
                    .and_then(|s| s[1].parse::<usize>().ok())
                    .and_then(|style| aligned.get(style).copied())
                    .unwrap_or(false)
            });
            if formatted {
                return true;
            }
        }
        false
    }
}

impl FormattingProbe for XlsxAlignmentProbe {
    fn has_cell_formatting(&self, path: &Path, rows: u32) -> Result<bool, ProbeError> {
        let file = File::open(path)?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| ProbeError::Container(e.to_string()))?;

        let aligned = match Self::read_part(&mut archive, "xl/styles.xml")? {
            Some(styles) => Self::aligned_styles(&styles),
            None => return Ok(false),
        };
        if !aligned.iter().any(|a| *a) {
            return Ok(false);
        }

        let sheet_name = Self::active_sheet_part(&mut archive)?;
        let sheet = Self::read_part(&mut archive, &sheet_name)?
            .ok_or(ProbeError::MissingPart(sheet_name))?;
        Ok(Self::sheet_has_aligned_cell(&sheet, &aligned, rows))
    }
}

/// Copy failures that only mean the writer is still busy with the file.
pub(crate) fn copy_failure_reason(error: &std::io::Error) -> Option<NotReadyReason> {
    // ERROR_SHARING_VIOLATION and ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if matches!(error.raw_os_error(), Some(32) | Some(33)) {
        return Some(NotReadyReason::Locked);
    }
    match error.kind() {
        std::io::ErrorKind::PermissionDenied => Some(NotReadyReason::Locked),
        std::io::ErrorKind::NotFound => Some(NotReadyReason::Missing),
        _ => None,
    }
}

/// Decides whether an export artifact is finished.
pub struct ExportVerifier {
    converter: Arc<dyn ReportConverter>,
    lock_probe: Arc<dyn LockProbe>,
    formatting: Arc<dyn FormattingProbe>,
    inspect_rows: u32,
}

impl ExportVerifier {
    pub fn new(converter: Arc<dyn ReportConverter>) -> Self {
        Self {
            converter,
            lock_probe: Arc::new(RenameLockProbe),
            formatting: Arc::new(XlsxAlignmentProbe),
            inspect_rows: DEFAULT_INSPECT_ROWS,
        }
    }

    pub fn with_lock_probe(mut self, probe: Arc<dyn LockProbe>) -> Self {
        self.lock_probe = probe;
        self
    }

    pub fn with_inspect_rows(mut self, rows: u32) -> Self {
        self.inspect_rows = rows;
        self
    }

    pub fn converter(&self) -> Arc<dyn ReportConverter> {
        self.converter.clone()
    }

    /// One check of the task's target: exists, non-empty, not locked, then
    /// the formatting signature. Stops at the first failing check.
    #[instrument(level = "debug", skip(self, task), fields(target = %task.target.display()))]
    pub async fn poll(&self, task: &ExportTask) -> Result<ExportStatus, SessionError> {
        let path = &task.target;
        let extension = path.extension().map(|e| e.to_string_lossy().to_lowercase());
        if extension.as_deref() != Some(task.expected_extension.to_lowercase().as_str()) {
            return Err(SessionError::InvalidArgument(format!(
                "{} does not have the expected .{} extension",
                path.display(),
                task.expected_extension
            )));
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ExportStatus::NotReady(NotReadyReason::Missing));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Ok(ExportStatus::Corrupt("not a regular file".to_string()));
        }
        if metadata.len() == 0 {
            return Ok(ExportStatus::NotReady(NotReadyReason::Empty));
        }
        if self.lock_probe.is_locked(path) {
            return Ok(ExportStatus::NotReady(NotReadyReason::Locked));
        }
        if !task.inspect_formatting {
            return Ok(ExportStatus::Ready);
        }
        self.check_formatting(task).await
    }

    /// Works on a disposable copy so the probe never touches the export or
    /// leaves a stale converted file next to it.
    async fn check_formatting(&self, task: &ExportTask) -> Result<ExportStatus, SessionError> {
        let path = &task.target;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let scratch = tempfile::Builder::new()
            .prefix(".export-probe")
            .tempdir_in(parent)?;
        let copy = scratch.path().join(format!("copy_{}", task.file_name()));
        if let Err(e) = tokio::fs::copy(path, &copy).await {
            let Some(reason) = copy_failure_reason(&e) else {
                return Err(e.into());
            };
            debug!("Copying {} for the probe failed: {}", task.file_name(), e);
            return Ok(ExportStatus::NotReady(reason));
        }

        let converted = if task.expected_extension.eq_ignore_ascii_case(MODERN_EXTENSION) {
            copy
        } else {
            let converted = copy.with_extension(MODERN_EXTENSION);
            if let Err(e) = self.converter.convert(&copy, &converted).await {
                warn!("Probe conversion of {} failed: {}", task.file_name(), e);
                return Ok(ExportStatus::Corrupt(e.to_string()));
            }
            converted
        };

        let probe = self.formatting.clone();
        let rows = self.inspect_rows;
        let found = tokio::task::spawn_blocking(move || probe.has_cell_formatting(&converted, rows))
            .await
            .map_err(|e| SessionError::Io(std::io::Error::other(format!("probe task failed: {e}"))))?;
        drop(scratch);

        Ok(match found {
            Ok(true) => ExportStatus::Ready,
            Ok(false) => ExportStatus::NotReady(NotReadyReason::Unformatted),
            Err(e) => ExportStatus::Corrupt(e.to_string()),
        })
    }

    /// Polls until the target is ready. Waits `first_poll_delay` before the
    /// first check and `poll_interval` between checks; gives up with
    /// [`SessionError::ExportTimeout`] once `timeout` has elapsed.
    #[instrument(skip(self, task), fields(source = %task.source))]
    pub async fn wait_until_ready(&self, task: &ExportTask) -> Result<(), SessionError> {
        let started = Instant::now();
        let name = task.file_name();
        tokio::time::sleep(task.first_poll_delay).await;

        loop {
            let reason = match self.poll(task).await? {
                ExportStatus::Ready => {
                    info!("File '{}' exists and ready", name);
                    return Ok(());
                }
                ExportStatus::Corrupt(reason) => {
                    return Err(SessionError::ExportCorrupt {
                        path: task.target.clone(),
                        reason,
                    });
                }
                ExportStatus::NotReady(reason) => reason,
            };
            info!("File '{}' {}...", name, reason);

            let elapsed = started.elapsed();
            if elapsed >= task.timeout {
                return Err(SessionError::ExportTimeout {
                    path: task.target.clone(),
                    elapsed,
                    last_reason: reason.to_string(),
                });
            }
            let remaining = task.timeout - elapsed;
            debug!(?remaining, "Export not ready, polling again");
            tokio::time::sleep(task.poll_interval.min(remaining)).await;
        }
    }
}
