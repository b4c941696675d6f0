//! The recurring report run: a contracts list and a payment schedule
//! exported from the client, the schedule converted to the modern format.
//!
//! Every run starts by looking at disk. Finished artifacts are never
//! exported again, so rerunning after a crash only redoes what is missing.

use chrono::{Duration as DateDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::credentials::Redacted;
use crate::dialogs::{ControlRole, DialogRole};
use crate::driver::{escape_keys, WindowState};
use crate::errors::SessionError;
use crate::export::{
    convert_report, converted_path, ExportStatus, ExportTask, ExportVerifier, NotReadyReason,
    LEGACY_EXTENSION,
};
use crate::retry::millis;
use crate::session::{ModeScope, SessionController};

/// Date format the client expects in report parameters and file names.
pub const SHORT_DATE_FORMAT: &str = "%d.%m.%y";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Mode hosting the contract list
    pub work_mode: String,
    pub contracts_stem: String,
    pub schedule_stem: String,
    /// Entry of the report file format box that produces a spreadsheet
    pub report_format_index: usize,
    pub contract_attempts: u32,
    /// Days covered by the schedule report
    pub horizon_days: i64,
    #[serde(with = "millis", rename = "contract_list_timeout_ms")]
    pub contract_list_timeout: Duration,
    #[serde(with = "millis", rename = "first_poll_delay_ms")]
    pub first_poll_delay: Duration,
    #[serde(with = "millis", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    #[serde(with = "millis", rename = "contracts_timeout_ms")]
    pub contracts_timeout: Duration,
    #[serde(with = "millis", rename = "schedule_timeout_ms")]
    pub schedule_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_mode: "SLOAN".to_string(),
            contracts_stem: "credits".to_string(),
            schedule_stem: "ZBRK_L_DEASHD4".to_string(),
            report_format_index: 12,
            contract_attempts: 5,
            horizon_days: 16,
            contract_list_timeout: Duration::from_secs(20),
            first_poll_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            contracts_timeout: Duration::from_secs(5 * 60),
            schedule_timeout: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn starting(start: NaiveDate, horizon_days: i64) -> Self {
        Self {
            start,
            end: start + DateDuration::days(horizon_days),
        }
    }

    pub fn short(date: NaiveDate) -> String {
        date.format(SHORT_DATE_FORMAT).to_string()
    }

    pub fn start_short(&self) -> String {
        Self::short(self.start)
    }

    pub fn end_short(&self) -> String {
        Self::short(self.end)
    }
}

/// Where one run's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportPaths {
    pub root: PathBuf,
    pub contracts: PathBuf,
    pub schedule: PathBuf,
    pub schedule_converted: PathBuf,
}

impl ReportPaths {
    pub fn new(root: impl Into<PathBuf>, config: &PipelineConfig, range: &DateRange) -> Self {
        let root = root.into();
        let date = range.start_short();
        let contracts = root.join(format!("{}_{date}.{LEGACY_EXTENSION}", config.contracts_stem));
        let schedule = root.join(format!("{}_{date}.{LEGACY_EXTENSION}", config.schedule_stem));
        Self {
            schedule_converted: converted_path(&schedule),
            root,
            contracts,
            schedule,
        }
    }

    /// `<project>/reports/<YYYY_MM>/<dd.mm.yy>` for the run date.
    pub fn dated_root(project: &Path, date: NaiveDate) -> PathBuf {
        project
            .join("reports")
            .join(date.format("%Y_%m").to_string())
            .join(DateRange::short(date))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStep {
    Skip,
    Convert,
    ExportAndConvert,
}

/// What a run still has to do, judged from the artifacts on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "plan")]
pub enum ExportPlan {
    /// Both final artifacts exist
    Done,
    /// Only the schedule conversion is missing; no client session needed
    ConvertOnly,
    Export {
        contracts: bool,
        schedule: ScheduleStep,
    },
}

impl ExportPlan {
    /// Judges the artifacts on disk. A raw export only counts once the
    /// verifier finds it ready and a converted artifact once it is non-empty,
    /// so stubs left by a crashed run are produced again.
    pub async fn assess(paths: &ReportPaths, verifier: &ExportVerifier) -> Result<Self, SessionError> {
        let contracts_task =
            ExportTask::new("contracts list", &paths.contracts).without_formatting_check();
        let contracts = is_verified(verifier, &contracts_task).await?;
        let converted = is_non_empty(&paths.schedule_converted).await?;
        let schedule = if converted {
            false
        } else {
            is_verified(verifier, &ExportTask::new("payment schedule", &paths.schedule)).await?
        };
        Ok(Self::from_artifacts(contracts, schedule, converted))
    }

    fn from_artifacts(contracts: bool, schedule: bool, converted: bool) -> Self {
        match (contracts, schedule, converted) {
            (true, _, true) => ExportPlan::Done,
            (true, true, false) => ExportPlan::ConvertOnly,
            _ => ExportPlan::Export {
                contracts: !contracts,
                schedule: if converted {
                    ScheduleStep::Skip
                } else if schedule {
                    ScheduleStep::Convert
                } else {
                    ScheduleStep::ExportAndConvert
                },
            },
        }
    }

    /// Removes whatever is on disk for the artifacts this plan produces.
    pub async fn discard_stale(&self, paths: &ReportPaths) -> Result<(), SessionError> {
        let mut stale: Vec<&PathBuf> = Vec::new();
        match self {
            ExportPlan::Done => {}
            ExportPlan::ConvertOnly => stale.push(&paths.schedule_converted),
            ExportPlan::Export { contracts, schedule } => {
                if *contracts {
                    stale.push(&paths.contracts);
                }
                match schedule {
                    ScheduleStep::Skip => {}
                    ScheduleStep::Convert => stale.push(&paths.schedule_converted),
                    ScheduleStep::ExportAndConvert => {
                        stale.push(&paths.schedule);
                        stale.push(&paths.schedule_converted);
                    }
                }
            }
        }
        for path in stale {
            match tokio::fs::remove_file(path).await {
                Ok(()) => warn!("Removed stale {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn needs_session(&self) -> bool {
        matches!(self, ExportPlan::Export { .. })
    }
}

async fn is_verified(verifier: &ExportVerifier, task: &ExportTask) -> Result<bool, SessionError> {
    match verifier.poll(task).await? {
        ExportStatus::Ready => Ok(true),
        ExportStatus::NotReady(NotReadyReason::Missing) => Ok(false),
        ExportStatus::NotReady(reason) => {
            warn!("{} {}, not counted as done", task.target.display(), reason);
            Ok(false)
        }
        ExportStatus::Corrupt(reason) => {
            warn!("{} is corrupt ({}), not counted as done", task.target.display(), reason);
            Ok(false)
        }
    }
}

async fn is_non_empty(path: &Path) -> Result<bool, SessionError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_file() && metadata.len() > 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub struct PipelineReport {
    pub plan: ExportPlan,
    /// Set when the client forced a password change during the run
    pub rotated_password: Option<String>,
}

impl fmt::Debug for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineReport")
            .field("plan", &self.plan)
            .field(
                "rotated_password",
                &self.rotated_password.as_deref().map(Redacted),
            )
            .finish()
    }
}

pub struct ReportPipeline {
    config: PipelineConfig,
    verifier: Arc<ExportVerifier>,
}

impl ReportPipeline {
    pub fn new(config: PipelineConfig, verifier: ExportVerifier) -> Self {
        Self {
            config,
            verifier: Arc::new(verifier),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[instrument(skip(self, controller), fields(root = %paths.root.display()))]
    pub async fn run(
        &self,
        controller: &mut SessionController,
        paths: &ReportPaths,
        range: &DateRange,
    ) -> Result<PipelineReport, SessionError> {
        let plan = ExportPlan::assess(paths, &self.verifier).await?;
        info!(?plan, "Planned report run");

        match plan {
            ExportPlan::Done => {
                info!("No need in exporting, all artifacts exist");
                return Ok(PipelineReport {
                    plan,
                    rotated_password: None,
                });
            }
            ExportPlan::ConvertOnly => {
                info!(
                    "{} exists but is not converted yet",
                    paths.schedule.display()
                );
                plan.discard_stale(paths).await?;
                convert_report(
                    self.verifier.converter().as_ref(),
                    &paths.schedule,
                    &paths.schedule_converted,
                )
                .await?;
                return Ok(PipelineReport {
                    plan,
                    rotated_password: None,
                });
            }
            ExportPlan::Export { .. } => {}
        }

        let job = Arc::new(ModeJob {
            config: self.config.clone(),
            verifier: self.verifier.clone(),
            paths: paths.clone(),
            range: *range,
        });
        let mode = self.config.work_mode.clone();

        let mut session = controller.open().await?;
        let outcome = session
            .run_in_mode(&mode, move |scope| {
                let job = job.clone();
                Box::pin(async move { job.run(scope).await })
            })
            .await;
        let result = session.close_with(outcome.err());

        match result.error {
            Some(error) => Err(error),
            None => Ok(PipelineReport {
                plan,
                rotated_password: result.rotated_password,
            }),
        }
    }
}

/// The part of a run that happens inside the work mode. Rerun from scratch
/// after a restart, so it re-plans from disk every time.
struct ModeJob {
    config: PipelineConfig,
    verifier: Arc<ExportVerifier>,
    paths: ReportPaths,
    range: DateRange,
}

impl ModeJob {
    async fn run(&self, scope: &mut ModeScope<'_>) -> Result<(), SessionError> {
        let plan = ExportPlan::assess(&self.paths, &self.verifier).await?;
        let ExportPlan::Export { contracts, schedule } = plan else {
            return Ok(());
        };
        plan.discard_stale(&self.paths).await?;

        open_contract_list(scope).await?;
        if contracts {
            self.export_contracts(scope).await?;
        }
        match schedule {
            ScheduleStep::Skip => {}
            ScheduleStep::Convert => self.convert_schedule().await?,
            ScheduleStep::ExportAndConvert => {
                self.export_schedule(scope).await?;
                self.convert_schedule().await?;
            }
        }
        Ok(())
    }

    async fn convert_schedule(&self) -> Result<(), SessionError> {
        if self.paths.schedule_converted.exists() {
            return Ok(());
        }
        convert_report(
            self.verifier.converter().as_ref(),
            &self.paths.schedule,
            &self.paths.schedule_converted,
        )
        .await
    }

    /// Menu export through the save and sort dialogs. The client sometimes
    /// answers with an error window instead of a file; that attempt is
    /// closed out and repeated.
    async fn export_contracts(&self, scope: &mut ModeScope<'_>) -> Result<(), SessionError> {
        let target = self.paths.contracts.clone();
        info!("{} does not exist, exporting", target.display());
        let task = ExportTask::new("contracts list", &target)
            .with_cadence(self.config.first_poll_delay, self.config.poll_interval)
            .with_timeout(self.config.contracts_timeout)
            .without_formatting_check();

        let attempts = self.config.contract_attempts.max(1);
        for attempt in 1..=attempts {
            scope.reap_viewers();
            let path = target.clone();
            let outcome = scope
                .export(&task, &self.verifier, move |scope| {
                    Box::pin(save_contracts(scope, path))
                })
                .await;
            scope.reap_viewers();
            close_error_window(scope)?;

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    "Contracts export attempt {}/{} failed: {}",
                    attempt, attempts, e
                ),
            }
        }
        Err(SessionError::BudgetExhausted {
            what: "contracts export".to_string(),
            attempts,
        })
    }

    async fn export_schedule(&self, scope: &mut ModeScope<'_>) -> Result<(), SessionError> {
        info!(
            "{} does not exist, exporting and converting",
            self.paths.schedule_converted.display()
        );

        let enabled = scope
            .wait_window(
                DialogRole::ContractList,
                WindowState::Enabled,
                Some(self.config.contract_list_timeout),
            )
            .await;
        if let Err(e) = enabled {
            warn!("Contract list unresponsive ({}), reloading", e);
            scope.reload().await?;
            open_contract_list(scope).await?;
        }

        let task = ExportTask::new("payment schedule", &self.paths.schedule)
            .with_cadence(self.config.first_poll_delay, self.config.poll_interval)
            .with_timeout(self.config.schedule_timeout);
        let request = ScheduleRequest {
            folder: self.paths.root.clone(),
            file_name: file_name(&self.paths.schedule),
            format_index: self.config.report_format_index,
            from: self.range.start_short(),
            to: self.range.end_short(),
        };
        scope
            .export(&task, &self.verifier, move |scope| {
                Box::pin(request_schedule(scope, request))
            })
            .await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn open_contract_list(scope: &ModeScope<'_>) -> Result<(), SessionError> {
    let filter = scope
        .wait_window(DialogRole::Filter, WindowState::Enabled, None)
        .await?;
    filter.click(scope.control(ControlRole::Confirm))?;
    scope
        .wait_window(DialogRole::ContractList, WindowState::Exists, None)
        .await?;
    Ok(())
}

fn close_error_window(scope: &ModeScope<'_>) -> Result<(), SessionError> {
    let error_window = scope.window(DialogRole::Error)?;
    if error_window.exists() {
        let message = error_window
            .text(scope.control(ControlRole::ErrorText))
            .unwrap_or_default();
        warn!("Client reported an error: {}", message);
        error_window.close()?;
    }
    Ok(())
}

async fn save_contracts(scope: &ModeScope<'_>, target: PathBuf) -> Result<(), SessionError> {
    let list = scope.window(DialogRole::ContractList)?;
    list.menu_select(scope.control(ControlRole::ContractsExportMenu))?;

    let save = scope
        .wait_window(DialogRole::ExportFile, WindowState::Exists, None)
        .await?;
    match tokio::fs::remove_file(&target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    save.set_text(
        scope.control(ControlRole::ExportPath),
        &target.to_string_lossy(),
    )?;
    save.click(scope.control(ControlRole::ExportSave))?;

    let sort = scope
        .wait_window(DialogRole::Sort, WindowState::Exists, None)
        .await?;
    sort.click(scope.control(ControlRole::Confirm))?;
    Ok(())
}

struct ScheduleRequest {
    folder: PathBuf,
    file_name: String,
    format_index: usize,
    from: String,
    to: String,
}

async fn request_schedule(scope: &ModeScope<'_>, request: ScheduleRequest) -> Result<(), SessionError> {
    scope.window(DialogRole::ContractList)?.set_focus()?;
    scope
        .locate_button(
            DialogRole::ContractList,
            ControlRole::Toolbar,
            ControlRole::GetReportHint,
        )
        .await?;

    let reports = scope
        .wait_window(DialogRole::ReportSelect, WindowState::Exists, None)
        .await?;
    reports.click(scope.control(ControlRole::Preview))?;
    reports.click(scope.control(ControlRole::ExportToFile))?;

    let file = scope
        .wait_window(DialogRole::ReportFile, WindowState::Exists, None)
        .await?;
    file.type_keys(
        Some(scope.control(ControlRole::ReportFolder)),
        &escape_keys(&request.folder.to_string_lossy()),
    )?;
    file.type_keys(
        Some(scope.control(ControlRole::ReportName)),
        &escape_keys(&request.file_name),
    )?;
    if let Err(e) = file.select_item(scope.control(ControlRole::ReportFormat), request.format_index) {
        // Some client builds preselect the only format they offer.
        warn!("Report format {} not selectable: {}", request.format_index, e);
    }
    file.click(scope.control(ControlRole::Confirm))?;

    let params = scope
        .wait_window(DialogRole::ReportParams, WindowState::Exists, None)
        .await?;
    params.set_text(scope.control(ControlRole::PeriodFrom), &request.from)?;
    params.set_text(scope.control(ControlRole::PeriodTo), &request.to)?;
    params.click(scope.control(ControlRole::Confirm))?;
    info!("Requested schedule {} for {}..{}", request.file_name, request.from, request.to);
    Ok(())
}
