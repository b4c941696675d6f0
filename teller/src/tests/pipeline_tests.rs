use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use super::export_tests::write_workbook;
use super::fakes::*;
use super::{fast_config, init_tracing};
use crate::credentials::Credentials;
use crate::errors::SessionError;
use crate::export::ExportVerifier;
use crate::pipeline::{DateRange, ExportPlan, PipelineConfig, ReportPaths, ReportPipeline, ScheduleStep};
use crate::session::{SessionController, SessionState};

const HINT: &str = "Получить отчет(F5)";

fn quick_config() -> PipelineConfig {
    PipelineConfig {
        first_poll_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(5),
        contracts_timeout: Duration::from_millis(100),
        schedule_timeout: Duration::from_secs(5),
        contract_list_timeout: Duration::from_millis(50),
        ..PipelineConfig::default()
    }
}

fn verifier() -> ExportVerifier {
    ExportVerifier::new(Arc::new(CopyConverter)).with_lock_probe(Arc::new(FixedLockProbe(false)))
}

fn pipeline() -> ReportPipeline {
    ReportPipeline::new(quick_config(), verifier())
}

fn range() -> DateRange {
    DateRange::starting(NaiveDate::from_ymd_opt(2025, 2, 3).unwrap(), 16)
}

fn controller(name: &str, driver: &Arc<FakeDriver>, reaper: &Arc<FakeReaper>) -> SessionController {
    SessionController::new(
        driver.clone(),
        reaper.clone(),
        fast_config(name),
        Credentials::new("operator", "Initial123pw"),
    )
}

/// The contract list's save dialogs. The sort dialog's OK writes the file
/// named in the save dialog, unless `fail_first` attempts are still due to
/// end in an error window.
fn script_contracts(driver: &FakeDriver, mut fail_first: u32) {
    driver.on(
        Trigger::Menu {
            window: CONTRACTS.to_string(),
        },
        |s| s.open(EXPORT_FILE),
    );
    driver.on(click(EXPORT_FILE, "&Save"), |s| s.open(SORT));
    driver.on(click(SORT, "OK"), move |s| {
        s.close(SORT);
        s.close(EXPORT_FILE);
        if fail_first > 0 {
            fail_first -= 1;
            s.open(ERROR);
            s.put_text(ERROR, "Edit", "Ошибка выгрузки");
            return;
        }
        let target = s.text(EXPORT_FILE, "Edit4");
        std::fs::write(target, "id\tclient\n1\tACME\n").unwrap();
    });
}

/// Toolbar report button, report selection and the report file dialogs.
/// The parameters dialog's OK writes a finished spreadsheet where the file
/// dialog pointed.
fn script_schedule(driver: &FakeDriver) {
    driver.set_status(|p| {
        if (37..60).contains(&p.x) {
            HINT.to_string()
        } else {
            String::new()
        }
    });
    driver.on(Trigger::ClickAt, |s| s.open(REPORTS));
    driver.on(click(REPORTS, "Экспорт в файл..."), |s| {
        s.close(REPORTS);
        s.open(REPORT_FILE);
    });
    driver.on(click(REPORT_FILE, "OK"), |s| {
        s.close(REPORT_FILE);
        s.open(REPORT_PARAMS);
    });
    driver.on(click(REPORT_PARAMS, "OK"), |s| {
        s.close(REPORT_PARAMS);
        let folder = s.text(REPORT_FILE, "Edit2");
        let name = s.text(REPORT_FILE, "Edit4");
        write_workbook(&Path::new(&folder).join(name), Some(2));
    });
}

fn paths_in(dir: &Path) -> ReportPaths {
    ReportPaths::new(dir, &quick_config(), &range())
}

#[tokio::test]
async fn finished_run_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.contracts, b"done").unwrap();
    std::fs::write(&paths.schedule_converted, b"done").unwrap();

    let driver = Arc::new(FakeDriver::client());
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_done", &driver, &reaper);

    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(report.plan, ExportPlan::Done);
    assert!(driver.actions().is_empty());
    assert_eq!(reaper.total(), 0);
    assert_eq!(controller.state(), &SessionState::Closed);
}

#[tokio::test]
async fn pending_conversion_runs_without_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.contracts, b"done").unwrap();
    write_workbook(&paths.schedule, Some(1));

    let driver = Arc::new(FakeDriver::client());
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_convert", &driver, &reaper);

    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(report.plan, ExportPlan::ConvertOnly);
    assert!(paths.schedule_converted.exists());
    assert!(!paths.schedule.exists());
    assert_eq!(driver.launches(), 0);
    assert!(driver.actions().is_empty());
}

#[tokio::test]
async fn full_run_exports_both_reports_and_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());

    let driver = Arc::new(FakeDriver::client());
    script_contracts(&driver, 0);
    script_schedule(&driver);
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_full", &driver, &reaper);

    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(
        report.plan,
        ExportPlan::Export {
            contracts: true,
            schedule: ScheduleStep::ExportAndConvert
        }
    );
    assert!(report.rotated_password.is_none());
    assert!(paths.contracts.exists());
    assert!(paths.schedule_converted.exists());
    assert!(!paths.schedule.exists());
    assert_eq!(controller.state(), &SessionState::Closed);

    let actions = driver.actions();
    assert!(actions.contains(&format!("type_keys {MODE}/Edit2 ~")));
    assert!(actions.contains(&format!("click {FILTER}/OK")));
    assert!(actions.contains(&format!("set_text {REPORT_PARAMS}/Edit2")));
    assert!(actions.contains(&"click_at 43,10".to_string()));
    assert_eq!(driver.screen(|s| s.text(REPORT_PARAMS, "Edit2")), "03.02.25");
    assert_eq!(driver.screen(|s| s.text(REPORT_PARAMS, "Edit4")), "19.02.25");
    assert!(reaper.reaped("EXCEL") >= 2);

    // Everything is on disk now; a second run never reaches the client.
    let before = driver.actions().len();
    let reaped = reaper.total();
    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(report.plan, ExportPlan::Done);
    assert_eq!(driver.actions().len(), before);
    assert_eq!(reaper.total(), reaped);
}

#[tokio::test]
async fn contracts_export_is_repeated_after_an_error_window() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.schedule_converted, b"done").unwrap();

    let driver = Arc::new(FakeDriver::client());
    script_contracts(&driver, 1);
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_retry", &driver, &reaper);

    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(
        report.plan,
        ExportPlan::Export {
            contracts: true,
            schedule: ScheduleStep::Skip
        }
    );
    assert!(paths.contracts.exists());
    assert_eq!(driver.count(&format!("menu {CONTRACTS}")), 2);
    assert_eq!(driver.count(&format!("close {ERROR}")), 1);
    assert_eq!(driver.count("click_at"), 0);
}

#[tokio::test]
async fn contracts_export_gives_up_after_its_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.schedule_converted, b"done").unwrap();

    let driver = Arc::new(FakeDriver::client());
    script_contracts(&driver, u32::MAX);
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_give_up", &driver, &reaper);

    let err = pipeline()
        .run(&mut controller, &paths, &range())
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::BudgetExhausted { attempts: 5, .. }),
        "{err:?}"
    );
    assert_eq!(driver.count(&format!("menu {CONTRACTS}")), 5);
    assert_eq!(controller.state(), &SessionState::Faulted);
    assert!(!paths.contracts.exists());
}

#[tokio::test]
async fn plan_only_counts_verified_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let verifier = verifier();

    std::fs::write(&paths.contracts, b"").unwrap();
    write_workbook(&paths.schedule, None);
    std::fs::write(&paths.schedule_converted, b"").unwrap();
    assert_eq!(
        ExportPlan::assess(&paths, &verifier).await.unwrap(),
        ExportPlan::Export {
            contracts: true,
            schedule: ScheduleStep::ExportAndConvert
        }
    );

    // A finished raw export next to an empty converted file still needs converting.
    std::fs::write(&paths.contracts, "id\tclient\n1\tACME\n").unwrap();
    write_workbook(&paths.schedule, Some(3));
    assert_eq!(
        ExportPlan::assess(&paths, &verifier).await.unwrap(),
        ExportPlan::ConvertOnly
    );

    std::fs::write(&paths.schedule, b"not a spreadsheet").unwrap();
    assert_eq!(
        ExportPlan::assess(&paths, &verifier).await.unwrap(),
        ExportPlan::Export {
            contracts: false,
            schedule: ScheduleStep::ExportAndConvert
        }
    );
}

#[tokio::test]
async fn empty_contracts_file_is_exported_again() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.contracts, b"").unwrap();
    std::fs::write(&paths.schedule_converted, b"done").unwrap();

    let driver = Arc::new(FakeDriver::client());
    script_contracts(&driver, 0);
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_stub", &driver, &reaper);

    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(
        report.plan,
        ExportPlan::Export {
            contracts: true,
            schedule: ScheduleStep::Skip
        }
    );
    assert_eq!(driver.count(&format!("menu {CONTRACTS}")), 1);
    assert!(std::fs::metadata(&paths.contracts).unwrap().len() > 0);
}

#[tokio::test]
async fn empty_converted_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.contracts, b"done").unwrap();
    write_workbook(&paths.schedule, Some(1));
    std::fs::write(&paths.schedule_converted, b"").unwrap();

    let driver = Arc::new(FakeDriver::client());
    let reaper = Arc::new(FakeReaper::default());
    let mut controller = controller("pipeline_converted_stub", &driver, &reaper);

    let report = pipeline().run(&mut controller, &paths, &range()).await.unwrap();
    assert_eq!(report.plan, ExportPlan::ConvertOnly);
    assert!(std::fs::metadata(&paths.schedule_converted).unwrap().len() > 0);
    assert!(!paths.schedule.exists());
    assert!(driver.actions().is_empty());
}

#[test]
fn artifact_names_use_the_short_start_date() {
    let paths = ReportPaths::new(PathBuf::from("/r"), &quick_config(), &range());
    assert!(paths.contracts.ends_with("credits_03.02.25.xls"));
    assert!(paths.schedule_converted.ends_with("ZBRK_L_DEASHD4_03.02.25.xlsx"));
}
