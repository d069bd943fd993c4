// End-to-end runs against the in-memory warehouse.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use cyclesync_adapters::{AdapterError, CsvExportFile, RowSource};
use cyclesync_core::{RawRow, SourceFormat};
use cyclesync_storage::{
    InMemoryWarehouse, MonitorSink, MonitorStatus, NotifyError, Operation, RawBatchArchive, TableName, Warehouse,
};
use cyclesync_sync::{
    check_duplicates, cleanup_duplicates, RunConfig, RunCoordinator, WriteStrategy, IMPORT_BATCH_SIZE,
};
use tempfile::tempdir;

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<(MonitorStatus, String)>>,
}

impl RecordingSink {
    fn calls(&self) -> Vec<(MonitorStatus, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitorSink for RecordingSink {
    async fn notify(&self, status: MonitorStatus, message: &str) -> Result<(), NotifyError> {
        self.calls.lock().unwrap().push((status, message.to_string()));
        Ok(())
    }
}

struct StaticRows(Vec<RawRow>);

impl RowSource for StaticRows {
    fn label(&self) -> String {
        "static".to_string()
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::LiveScrape
    }

    fn read_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        Ok(self.0.clone())
    }
}

fn live_row(start: DateTime<Utc>, right: &str, device: &str) -> RawRow {
    let range = format!("{} - {right}", start.format("%Y/%m/%d %H:%M:%S"));
    RawRow::new([
        range.as_str(),
        device,
        "Whites",
        "W-01",
        "Hotel Azul",
        "029:10",
        "15.5 kg",
        "4 ml",
        "-",
        "-",
        "-",
        "3 Oz",
        "00:01",
        "<1",
    ])
}

fn table() -> TableName {
    TableName::parse("wash_cycles").unwrap()
}

fn run_config(strategy: WriteStrategy) -> RunConfig {
    RunConfig {
        snapshot_window: TimeDelta::days(2),
        write_strategy: strategy,
        dry_run: false,
    }
}

fn coordinator(
    warehouse: &Arc<InMemoryWarehouse>,
    config: RunConfig,
    sink: &Arc<RecordingSink>,
) -> RunCoordinator {
    let warehouse: Arc<dyn Warehouse> = warehouse.clone();
    let sink: Arc<dyn MonitorSink> = sink.clone();
    RunCoordinator::new(warehouse, table(), config, sink)
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(name)
}

#[tokio::test]
async fn running_cycle_completes_across_runs_with_load_merge() {
    let warehouse = Arc::new(InMemoryWarehouse::with_recent_write_lock());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::LoadMerge), &sink);
    let start = Utc::now() - TimeDelta::hours(1);

    let first = coordinator
        .run(&StaticRows(vec![
            live_row(start, "not ended", "Washer 1"),
            live_row(start, "029:10", "Washer 2"),
        ]))
        .await
        .unwrap();
    assert_eq!((first.new_rows, first.changed_rows), (2, 0));

    let second = coordinator
        .run(&StaticRows(vec![
            live_row(start, "029:10", "Washer 1"),
            live_row(start, "029:10", "Washer 2"),
        ]))
        .await
        .unwrap();
    assert_eq!((second.new_rows, second.changed_rows, second.unchanged_rows), (0, 1, 1));

    let rows = warehouse.rows(&table());
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.is_completed));
    assert_eq!(warehouse.table_names(), vec!["wash_cycles".to_string()]);

    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, MonitorStatus::Up);
    assert_eq!(
        calls[1].1,
        format!("v{}: Processed 2 rows, uploaded 1 (0 new, 1 updated)", env!("CARGO_PKG_VERSION"))
    );
}

#[tokio::test]
async fn stage_merge_converges_when_a_batch_is_replayed() {
    let warehouse = Arc::new(InMemoryWarehouse::with_recent_write_lock());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::StageMerge), &sink);
    let start = Utc::now() - TimeDelta::hours(3);
    let rows = vec![
        live_row(start, "not ended", "Washer 1"),
        live_row(start, "not ended", "Washer 2"),
    ];

    coordinator.run(&StaticRows(rows.clone())).await.unwrap();
    let replay = coordinator.run(&StaticRows(rows)).await.unwrap();
    assert_eq!(replay.unchanged_rows, 2);
    assert_eq!(warehouse.rows(&table()).len(), 2);

    warehouse.settle_recent_writes();
    let done = coordinator
        .run(&StaticRows(vec![live_row(start, "012:00", "Washer 1")]))
        .await
        .unwrap();
    assert_eq!(done.changed_rows, 1);
    assert_eq!(warehouse.rows_for_id(&table(), &done_id(start, "Washer_1")).len(), 1);
    assert_eq!(warehouse.rows(&table()).len(), 2);
}

fn done_id(start: DateTime<Utc>, device: &str) -> String {
    format!("{}_{device}", start.format("%Y%m%d_%H%M%S"))
}

#[tokio::test]
async fn write_failure_is_reported_once_as_down() {
    let warehouse = Arc::new(InMemoryWarehouse::with_recent_write_lock());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::StageMerge), &sink);
    let start = Utc::now() - TimeDelta::hours(1);

    coordinator
        .run(&StaticRows(vec![live_row(start, "not ended", "Washer 1")]))
        .await
        .unwrap();

    // The running row is still in the recent-write buffer, so merging its
    // completion must fail.
    let err = coordinator
        .run(&StaticRows(vec![live_row(start, "029:10", "Washer 1")]))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("recent-write buffer"));

    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, MonitorStatus::Down);
    assert!(calls[1].1.starts_with("Sync failed:"));
    assert_eq!(warehouse.rows(&table()).len(), 1);
    assert_eq!(warehouse.table_names().len(), 1);
}

#[tokio::test]
async fn snapshot_outage_degrades_to_new_rows() {
    let warehouse = Arc::new(InMemoryWarehouse::mutable());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::DeleteInsert), &sink);
    let start = Utc::now() - TimeDelta::hours(1);
    let rows = vec![live_row(start, "029:10", "Washer 1")];

    coordinator.run(&StaticRows(rows.clone())).await.unwrap();
    warehouse.fail_next(Operation::Query, 1);
    let degraded = coordinator.run(&StaticRows(rows)).await.unwrap();
    assert_eq!(degraded.new_rows, 1);

    let audit = check_duplicates(warehouse.as_ref(), &table(), Some(TimeDelta::days(2)), Utc::now())
        .await
        .unwrap();
    assert_eq!(audit.duplicates.len(), 1);

    let cleanup = cleanup_duplicates(warehouse.as_ref(), &table()).await.unwrap();
    assert_eq!(cleanup.removed(), 1);
}

#[tokio::test]
async fn structurally_broken_rows_are_skipped_not_fatal() {
    let warehouse = Arc::new(InMemoryWarehouse::mutable());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::DeleteInsert), &sink);
    let start = Utc::now() - TimeDelta::hours(1);

    let summary = coordinator
        .run(&StaticRows(vec![
            live_row(start, "029:10", "Washer 1"),
            live_row(start, "029:10", "Washer 2"),
            RawRow::new(["2025/07/26 08:04:52 - not ended", "Washer 3", "Whites", "W-03", "Hotel"]),
            live_row(start, "029:10", "Washer 4"),
            live_row(start, "029:10", "Washer 5"),
        ]))
        .await
        .unwrap();
    assert_eq!(summary.rejected_rows, 1);
    assert_eq!(summary.new_rows, 4);
    assert_eq!(warehouse.rows(&table()).len(), 4);

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1.ends_with("Processed 5 rows, uploaded 4 (4 new, 0 updated)"));
}

#[tokio::test]
async fn dry_run_writes_nothing_and_stays_silent() {
    let warehouse = Arc::new(InMemoryWarehouse::mutable());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let config = RunConfig {
        dry_run: true,
        ..run_config(WriteStrategy::DeleteInsert)
    };
    let dir = tempdir().unwrap();
    let coordinator = coordinator(&warehouse, config, &sink)
        .with_archive(RawBatchArchive::new(dir.path().join("raw")))
        .with_reports_dir(dir.path().join("reports"));
    let start = Utc::now() - TimeDelta::hours(1);

    let summary = coordinator
        .run(&StaticRows(vec![live_row(start, "029:10", "Washer 1")]))
        .await
        .unwrap();
    assert_eq!(summary.new_rows, 1);
    assert_eq!(summary.rows_written, 0);
    assert!(warehouse.rows(&table()).is_empty());
    assert!(sink.calls().is_empty());
    assert!(!dir.path().join("raw").exists());
    assert!(!dir.path().join("reports").exists());
}

#[tokio::test]
async fn successful_run_archives_and_reports() {
    let warehouse = Arc::new(InMemoryWarehouse::mutable());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let dir = tempdir().unwrap();
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::DeleteInsert), &sink)
        .with_archive(RawBatchArchive::new(dir.path().join("raw")))
        .with_reports_dir(dir.path().join("reports"));
    let start = Utc::now() - TimeDelta::hours(1);

    let summary = coordinator
        .run(&StaticRows(vec![live_row(start, "029:10", "Washer 1")]))
        .await
        .unwrap();

    let archived = summary.archived_batch.clone().unwrap();
    assert!(dir.path().join("raw").join(&archived).exists());
    assert!(dir.path().join("raw/index.jsonl").exists());

    let run_dir = dir.path().join("reports").join(summary.run_id.to_string());
    assert_eq!(summary.report_dir.as_deref(), Some(run_dir.display().to_string().as_str()));
    let written: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(written["new_rows"], 1);
    assert_eq!(written["strategy"], "delete_insert");
    assert!(run_dir.join("snapshots/cycles.parquet").exists());
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["run_id"], summary.run_id.to_string());
    assert_eq!(manifest["files"][1]["path"], "snapshots/cycles.parquet");
    assert_eq!(manifest["files"][1]["rows"], 1);
}

#[tokio::test]
async fn csv_import_writes_in_batches() {
    let warehouse = Arc::new(InMemoryWarehouse::with_recent_write_lock());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::LoadMerge), &sink);
    let source = CsvExportFile::new(fixture("cycle_export_sample.csv"));

    let summary = coordinator.import(&source, 1).await.unwrap();
    assert_eq!(summary.records, 2);
    assert_eq!(summary.new_rows, 2);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.rejected_rows, 2);
    assert_eq!(summary.summary_rows, 1);
    assert_eq!(warehouse.rows(&table()).len(), 2);
    assert!(sink.calls().is_empty());

    let again = coordinator.import(&source, 1000).await.unwrap();
    assert_eq!(again.skipped_unchanged, 2);
    assert_eq!(again.batches, 0);
    assert_eq!(warehouse.rows(&table()).len(), 2);
}

#[tokio::test]
async fn reimporting_an_old_export_adds_nothing() {
    // The fixture's cycles are from 2025, far outside the two-day run window.
    let warehouse = Arc::new(InMemoryWarehouse::mutable());
    warehouse.create_table(&table());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = coordinator(&warehouse, run_config(WriteStrategy::DeleteInsert), &sink);
    let source = CsvExportFile::new(fixture("cycle_export_sample.csv"));

    let first = coordinator.import(&source, IMPORT_BATCH_SIZE).await.unwrap();
    assert_eq!(first.new_rows, 2);

    let second = coordinator.import(&source, IMPORT_BATCH_SIZE).await.unwrap();
    assert_eq!(second.new_rows, 0);
    assert_eq!(second.changed_rows, 0);
    assert_eq!(second.skipped_unchanged, 2);
    assert_eq!(warehouse.rows(&table()).len(), 2);

    let audit = check_duplicates(warehouse.as_ref(), &table(), None, Utc::now()).await.unwrap();
    assert!(!audit.has_duplicates());
}

#[tokio::test]
async fn first_run_against_an_empty_warehouse_creates_the_table() {
    let warehouse = Arc::new(InMemoryWarehouse::mutable());
    let sink = Arc::new(RecordingSink::default());
    let start = Utc::now() - TimeDelta::hours(1);
    let rows = vec![live_row(start, "029:10", "Washer 1")];

    let dry = RunConfig {
        dry_run: true,
        ..run_config(WriteStrategy::DeleteInsert)
    };
    coordinator(&warehouse, dry, &sink).run(&StaticRows(rows.clone())).await.unwrap();
    assert!(warehouse.table_names().is_empty());

    let summary = coordinator(&warehouse, run_config(WriteStrategy::DeleteInsert), &sink)
        .run(&StaticRows(rows))
        .await
        .unwrap();
    assert_eq!(summary.new_rows, 1);
    assert_eq!(warehouse.table_names(), vec!["wash_cycles".to_string()]);
    assert_eq!(warehouse.rows(&table()).len(), 1);
    let ops = warehouse.operations();
    assert_eq!(ops.iter().filter(|op| **op == Operation::EnsureTable).count(), 1);
    assert_eq!(ops.last(), Some(&Operation::BulkInsert));
}
