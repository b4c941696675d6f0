use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::fakes::*;
use super::init_tracing;
use crate::errors::SessionError;
use crate::export::{
    convert_report, copy_failure_reason, ExportStatus, ExportTask, ExportVerifier, FormattingProbe, LockProbe,
    NotReadyReason, ProbeError, RenameLockProbe, XlsxAlignmentProbe,
};

const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
<bookViews><workbookView activeTab="1"/></bookViews>
<sheets><sheet name="Info" sheetId="1" r:id="rId1"/><sheet name="Report" sheetId="2" r:id="rId2"/></sheets>
</workbook>"#;

const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/>
<Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
</Relationships>"#;

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<cellStyleXfs count="1"><xf numFmtId="0" fontId="0"><alignment horizontal="left"/></xf></cellStyleXfs>
<cellXfs count="2"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0" applyAlignment="1"><alignment horizontal="center" vertical="center"/></xf></cellXfs>
</styleSheet>"#;

/// Sheet whose first aligned cell sits on `aligned_row`, or plain cells only.
fn sheet(aligned_row: Option<u32>) -> String {
    let mut rows = String::new();
    for r in 1..=30 {
        let style = if Some(r) == aligned_row { 1 } else { 0 };
        rows.push_str(&format!(
            r#"<row r="{r}"><c r="A{r}" s="{style}" t="n"><v>{r}</v></c><c r="B{r}"><v>0</v></c></row>"#
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{rows}</sheetData></worksheet>"#
    )
}

/// Writes a minimal spreadsheet. The aligned cells go on the active second
/// sheet only; the first sheet always stays plain.
pub(super) fn write_workbook(path: &Path, aligned_row: Option<u32>) {
    let file = File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let parts = [
        ("xl/workbook.xml", WORKBOOK.to_string()),
        ("xl/_rels/workbook.xml.rels", RELS.to_string()),
        ("xl/styles.xml", STYLES.to_string()),
        ("xl/worksheets/sheet1.xml", sheet(None)),
        ("xl/worksheets/sheet2.xml", sheet(aligned_row)),
    ];
    for (name, content) in parts {
        zip.start_file(name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn verifier() -> ExportVerifier {
    ExportVerifier::new(Arc::new(CopyConverter)).with_lock_probe(Arc::new(FixedLockProbe(false)))
}

fn task(path: &Path) -> ExportTask {
    ExportTask::new("schedule", path).with_cadence(Duration::ZERO, Duration::ZERO)
}

fn target(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[tokio::test]
async fn missing_file_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let status = verifier()
        .poll(&task(&target(&dir, "report.xls")))
        .await
        .unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Missing));
}

#[tokio::test]
async fn empty_file_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    File::create(&path).unwrap();
    let status = verifier().poll(&task(&path)).await.unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Empty));
}

#[tokio::test]
async fn locked_file_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, Some(3));
    let status = ExportVerifier::new(Arc::new(CopyConverter))
        .with_lock_probe(Arc::new(FixedLockProbe(true)))
        .poll(&task(&path))
        .await
        .unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Locked));
}

#[tokio::test]
async fn aligned_cell_on_active_sheet_means_ready() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, Some(3));

    let status = verifier().poll(&task(&path)).await.unwrap();
    assert_eq!(status, ExportStatus::Ready);

    // The probe works on a scratch copy; the directory holds only the export.
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("report.xls")]);
}

#[tokio::test]
async fn plain_cells_mean_export_still_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, None);
    let status = verifier().poll(&task(&path)).await.unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Unformatted));
}

#[tokio::test]
async fn formatting_past_inspected_rows_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, Some(25));

    let status = verifier().poll(&task(&path)).await.unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Unformatted));

    let status = verifier()
        .with_inspect_rows(30)
        .poll(&task(&path))
        .await
        .unwrap();
    assert_eq!(status, ExportStatus::Ready);
}

#[tokio::test]
async fn unreadable_container_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    std::fs::write(&path, b"this is not a spreadsheet").unwrap();
    let status = verifier().poll(&task(&path)).await.unwrap();
    assert!(matches!(status, ExportStatus::Corrupt(_)), "{status:?}");
}

#[tokio::test]
async fn failed_conversion_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, Some(1));
    let status = ExportVerifier::new(Arc::new(FailingConverter))
        .with_lock_probe(Arc::new(FixedLockProbe(false)))
        .poll(&task(&path))
        .await
        .unwrap();
    match status {
        ExportStatus::Corrupt(reason) => assert!(reason.contains("cannot open"), "{reason}"),
        other => panic!("expected corrupt, got {other:?}"),
    }
}

#[tokio::test]
async fn modern_exports_skip_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xlsx");
    write_workbook(&path, Some(2));
    let status = ExportVerifier::new(Arc::new(FailingConverter))
        .with_lock_probe(Arc::new(FixedLockProbe(false)))
        .poll(&task(&path).with_extension("xlsx"))
        .await
        .unwrap();
    assert_eq!(status, ExportStatus::Ready);
}

#[tokio::test]
async fn plain_text_exports_skip_formatting_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "credits.xls");
    std::fs::write(&path, "1\t2\t3\n").unwrap();
    let status = verifier()
        .poll(&task(&path).without_formatting_check())
        .await
        .unwrap();
    assert_eq!(status, ExportStatus::Ready);
}

#[tokio::test]
async fn wrong_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.csv");
    let err = verifier().poll(&task(&path)).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidArgument(_)), "{err:?}");
}

#[tokio::test]
async fn waiting_gives_up_with_last_reason() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    let err = verifier()
        .wait_until_ready(&task(&path).with_timeout(Duration::ZERO))
        .await
        .unwrap_err();
    match err {
        SessionError::ExportTimeout {
            path: reported,
            last_reason,
            ..
        } => {
            assert_eq!(reported, path);
            assert_eq!(last_reason, "does not exist yet");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn waiting_stops_on_corrupt_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    std::fs::write(&path, b"garbage").unwrap();
    let err = verifier()
        .wait_until_ready(&task(&path).with_timeout(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ExportCorrupt { .. }), "{err:?}");
}

#[tokio::test]
async fn waiting_sees_file_written_late() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    let writer_path = path.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Appears whole; a half-written container would read as corrupt.
        let staging = writer_path.with_extension("part");
        write_workbook(&staging, Some(1));
        std::fs::rename(&staging, &writer_path).unwrap();
    });

    let task = ExportTask::new("schedule", &path)
        .with_cadence(Duration::ZERO, Duration::from_millis(10))
        .with_timeout(Duration::from_secs(10));
    verifier().wait_until_ready(&task).await.unwrap();
    writer.await.unwrap();
}

#[tokio::test]
async fn converting_removes_the_legacy_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = target(&dir, "report.xls");
    let dest = dir.path().join("out").join("report.xlsx");
    write_workbook(&source, Some(1));

    convert_report(&CopyConverter, &source, &dest).await.unwrap();
    assert!(!source.exists());
    assert!(dest.exists());
}

#[test]
fn probe_without_styles_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "bare.xlsx");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    zip.start_file("xl/worksheets/sheet1.xml", SimpleFileOptions::default())
        .unwrap();
    zip.write_all(sheet(Some(1)).as_bytes()).unwrap();
    zip.finish().unwrap();

    assert!(!XlsxAlignmentProbe.has_cell_formatting(&path, 20).unwrap());
}

/// Passes the lock check, then the writer moves the file away before the
/// verifier gets to copy it.
struct MovedAwayAfterCheck;

impl LockProbe for MovedAwayAfterCheck {
    fn is_locked(&self, path: &Path) -> bool {
        std::fs::remove_file(path).unwrap();
        false
    }
}

#[tokio::test]
async fn file_moved_away_before_the_copy_is_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, Some(1));
    let status = ExportVerifier::new(Arc::new(CopyConverter))
        .with_lock_probe(Arc::new(MovedAwayAfterCheck))
        .poll(&task(&path))
        .await
        .unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Missing));
}

#[test]
fn busy_copy_errors_mean_not_ready() {
    use std::io::{Error, ErrorKind};

    assert_eq!(
        copy_failure_reason(&Error::from(ErrorKind::PermissionDenied)),
        Some(NotReadyReason::Locked)
    );
    assert_eq!(
        copy_failure_reason(&Error::from(ErrorKind::NotFound)),
        Some(NotReadyReason::Missing)
    );
    assert_eq!(copy_failure_reason(&Error::from(ErrorKind::InvalidData)), None);
    #[cfg(windows)]
    assert_eq!(
        copy_failure_reason(&Error::from_raw_os_error(32)),
        Some(NotReadyReason::Locked)
    );
}

#[test]
fn probe_rejects_non_zip_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "broken.xlsx");
    std::fs::write(&path, b"PK but not really").unwrap();
    let err = XlsxAlignmentProbe.has_cell_formatting(&path, 20).unwrap_err();
    assert!(matches!(err, ProbeError::Container(_)), "{err:?}");
}

#[test]
fn unlocked_file_passes_rename_probe() {
    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    std::fs::write(&path, b"data").unwrap();
    assert!(!RenameLockProbe.is_locked(&path));
    assert!(path.exists());
}

#[cfg(windows)]
#[test]
fn file_held_without_sharing_is_locked() {
    use std::os::windows::fs::OpenOptionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    std::fs::write(&path, b"data").unwrap();

    let held = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(&path)
        .unwrap();
    assert!(RenameLockProbe.is_locked(&path));
    drop(held);
    assert!(!RenameLockProbe.is_locked(&path));
}

#[cfg(windows)]
#[tokio::test]
async fn file_reopened_by_the_writer_during_the_check_is_locked() {
    use std::os::windows::fs::OpenOptionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = target(&dir, "report.xls");
    write_workbook(&path, Some(1));

    // The lock check is skipped, so the held file is first noticed by the copy.
    let held = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(0)
        .open(&path)
        .unwrap();
    let status = verifier().poll(&task(&path)).await.unwrap();
    assert_eq!(status, ExportStatus::NotReady(NotReadyReason::Locked));
    drop(held);
}
