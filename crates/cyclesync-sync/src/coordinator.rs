use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cyclesync_adapters::{transform_rows, RowSource, TransformReport};
use cyclesync_core::{CycleRecord, RawRow, SourceFormat};
use cyclesync_storage::{MonitorSink, MonitorStatus, RawBatchArchive, TableName, Warehouse};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{RunConfig, SyncConfig, WriteStrategy};
use crate::reconcile::{load_snapshot, reconcile, ReconciledBatch};
use crate::reports::write_run_report;
use crate::upsert::UpsertExecutor;

/// Records per upsert call during a bulk CSV import.
pub const IMPORT_BATCH_SIZE: usize = 1000;

const DRY_RUN_SAMPLE: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub format: SourceFormat,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_rows: usize,
    pub records: usize,
    pub rejected_rows: usize,
    pub summary_rows: usize,
    pub duplicates_collapsed: usize,
    pub new_rows: usize,
    pub changed_rows: usize,
    pub unchanged_rows: usize,
    pub rows_written: u64,
    pub strategy: WriteStrategy,
    pub dry_run: bool,
    pub stage_table: Option<String>,
    pub cleanup_failed: bool,
    pub archived_batch: Option<String>,
    pub report_dir: Option<String>,
}

impl RunSummary {
    pub fn uploaded(&self) -> usize {
        self.new_rows + self.changed_rows
    }

    /// Text forwarded to the monitoring sink on success. The row count is the
    /// raw harvested count, before rejected and totals rows are dropped.
    pub fn message(&self) -> String {
        format!(
            "v{}: Processed {} rows, uploaded {} ({} new, {} updated)",
            env!("CARGO_PKG_VERSION"),
            self.raw_rows,
            self.uploaded(),
            self.new_rows,
            self.changed_rows
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub source: String,
    pub raw_rows: usize,
    pub records: usize,
    pub rejected_rows: usize,
    pub summary_rows: usize,
    pub duplicates_collapsed: usize,
    pub new_rows: usize,
    pub changed_rows: usize,
    pub skipped_unchanged: usize,
    pub batches: usize,
    pub rows_written: u64,
    pub dry_run: bool,
}

/// Drives one harvest → transform → reconcile → upsert run and reports its
/// single outcome to the monitoring sink.
pub struct RunCoordinator {
    warehouse: Arc<dyn Warehouse>,
    table: TableName,
    config: RunConfig,
    monitor: Arc<dyn MonitorSink>,
    archive: Option<RawBatchArchive>,
    reports_dir: Option<PathBuf>,
}

impl RunCoordinator {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        table: TableName,
        config: RunConfig,
        monitor: Arc<dyn MonitorSink>,
    ) -> Self {
        Self {
            warehouse,
            table,
            config,
            monitor,
            archive: None,
            reports_dir: None,
        }
    }

    pub fn with_archive(mut self, archive: RawBatchArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run once. Exactly one notification is sent unless this is a dry run;
    /// a failure to deliver it is logged and does not change the outcome.
    pub async fn run(&self, source: &dyn RowSource) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            source = %source.label(),
            strategy = %self.config.write_strategy,
            dry_run = self.config.dry_run
        );
        async {
            let outcome = self.execute(run_id, source).await;
            match &outcome {
                Ok(summary) => {
                    info!(
                        records = summary.records,
                        new = summary.new_rows,
                        changed = summary.changed_rows,
                        unchanged = summary.unchanged_rows,
                        rejected = summary.rejected_rows,
                        "sync run complete"
                    );
                    self.notify(MonitorStatus::Up, &summary.message()).await;
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "sync run failed");
                    self.notify(MonitorStatus::Down, &format!("Sync failed: {err:#}")).await;
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn notify(&self, status: MonitorStatus, message: &str) {
        if self.config.dry_run {
            debug!(status = status.as_str(), message, "dry run; monitor notification suppressed");
            return;
        }
        if let Err(err) = self.monitor.notify(status, message).await {
            warn!(status = status.as_str(), error = %err, "monitor notification failed");
        }
    }

    /// A fresh warehouse gets its table on the first run that writes.
    async fn prepare_table(&self) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        self.warehouse
            .ensure_table(&self.table)
            .await
            .with_context(|| format!("preparing table {}", self.table))
    }

    async fn read_and_transform(
        &self,
        source: &dyn RowSource,
        fetched_at: DateTime<Utc>,
    ) -> Result<(Vec<RawRow>, TransformReport, Option<String>)> {
        let format = source.format();
        let rows = source
            .read_rows()
            .with_context(|| format!("reading rows from {}", source.label()))?;
        info!(raw_rows = rows.len(), format = format.as_str(), "harvested raw rows");

        let mut archived = None;
        if !self.config.dry_run {
            if let Some(archive) = &self.archive {
                let entry = archive
                    .store_rows(fetched_at, format, &rows)
                    .await
                    .with_context(|| format!("archiving raw rows under {}", archive.root().display()))?;
                debug!(object = %entry.object.display(), reused = entry.reused, "archived raw rows");
                archived = Some(entry.object.display().to_string());
            }
        }

        let report = transform_rows(&rows, format);
        for (index, err) in &report.rejected {
            warn!(row = index, error = %err, "dropping structurally invalid row");
        }
        if report.summary_rows > 0 {
            debug!(summary_rows = report.summary_rows, "skipped totals rows");
        }
        Ok((rows, report, archived))
    }

    async fn execute(&self, run_id: Uuid, source: &dyn RowSource) -> Result<RunSummary> {
        let started_at = Utc::now();
        let (rows, report, archived_batch) = self.read_and_transform(source, started_at).await?;
        let records = report.records.len();

        self.prepare_table().await?;
        let snapshot =
            load_snapshot(self.warehouse.as_ref(), &self.table, Some(self.config.snapshot_window), started_at).await;
        let batch = reconcile(report.records, &snapshot);

        let upsert = if self.config.dry_run {
            info!(new = batch.new.len(), changed = batch.changed.len(), "dry run; skipping warehouse writes");
            None
        } else {
            let executor = UpsertExecutor::new(self.warehouse.as_ref(), &self.table, self.config.write_strategy);
            Some(executor.apply(&batch.new, &batch.changed).await?)
        };

        let mut summary = RunSummary {
            run_id,
            source: source.label(),
            format: source.format(),
            started_at,
            finished_at: Utc::now(),
            raw_rows: rows.len(),
            records,
            rejected_rows: report.rejected.len(),
            summary_rows: report.summary_rows,
            duplicates_collapsed: batch.duplicates_collapsed,
            new_rows: batch.new.len(),
            changed_rows: batch.changed.len(),
            unchanged_rows: batch.unchanged,
            rows_written: upsert.as_ref().map_or(0, |u| u.rows_written),
            strategy: self.config.write_strategy,
            dry_run: self.config.dry_run,
            stage_table: upsert.as_ref().and_then(|u| u.stage_table.clone()),
            cleanup_failed: upsert.as_ref().is_some_and(|u| u.cleanup_failed),
            archived_batch,
            report_dir: None,
        };

        if !self.config.dry_run {
            if let Some(root) = &self.reports_dir {
                summary.report_dir = Some(root.join(run_id.to_string()).display().to_string());
                let written = written_records(&batch);
                write_run_report(root, &summary, &written).await?;
            }
        }
        Ok(summary)
    }

    /// Bulk import: one snapshot over the whole table, then New and Changed
    /// rows written in batches of `batch_size`. No monitor notification is
    /// sent.
    pub async fn import(&self, source: &dyn RowSource, batch_size: usize) -> Result<ImportSummary> {
        let batch_size = batch_size.max(1);
        let started_at = Utc::now();
        let (rows, report, _) = self.read_and_transform(source, started_at).await?;
        let records = report.records.len();

        self.prepare_table().await?;
        // An export can reach back further than any scrape window, so every
        // stored id is consulted.
        let snapshot = load_snapshot(self.warehouse.as_ref(), &self.table, None, started_at).await;
        let batch = reconcile(report.records, &snapshot);
        let executor = UpsertExecutor::new(self.warehouse.as_ref(), &self.table, self.config.write_strategy);

        let chunks = batch
            .new
            .chunks(batch_size)
            .map(|chunk| (chunk, &[][..]))
            .chain(batch.changed.chunks(batch_size).map(|chunk| (&[][..], chunk)));

        let mut batches = 0;
        let mut rows_written = 0;
        for (new, changed) in chunks {
            batches += 1;
            if self.config.dry_run {
                for record in new.iter().chain(changed).take(DRY_RUN_SAMPLE) {
                    info!(
                        batch = batches,
                        cycle_id = %record.id,
                        start_time = %record.start_time,
                        completed = record.is_completed,
                        "dry run sample"
                    );
                }
                continue;
            }
            let upsert = executor
                .apply(new, changed)
                .await
                .with_context(|| format!("writing import batch {batches}"))?;
            rows_written += upsert.rows_written;
            info!(batch = batches, rows = upsert.total(), "import batch written");
        }

        let summary = ImportSummary {
            source: source.label(),
            raw_rows: rows.len(),
            records,
            rejected_rows: report.rejected.len(),
            summary_rows: report.summary_rows,
            duplicates_collapsed: batch.duplicates_collapsed,
            new_rows: batch.new.len(),
            changed_rows: batch.changed.len(),
            skipped_unchanged: batch.unchanged,
            batches,
            rows_written,
            dry_run: self.config.dry_run,
        };
        info!(
            records = summary.records,
            new = summary.new_rows,
            changed = summary.changed_rows,
            skipped = summary.skipped_unchanged,
            rejected = summary.rejected_rows,
            "import complete"
        );
        Ok(summary)
    }
}

fn written_records(batch: &ReconciledBatch) -> Vec<CycleRecord> {
    batch.new.iter().chain(&batch.changed).cloned().collect()
}

/// Cron job running `coordinator` against `source` on `config.sync_cron`,
/// or `None` when scheduling is disabled. Each tick is an independent run.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    coordinator: Arc<RunCoordinator>,
    source: Arc<dyn RowSource>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let coordinator = Arc::clone(&coordinator);
        let source = Arc::clone(&source);
        Box::pin(async move {
            if let Err(err) = coordinator.run(source.as_ref()).await {
                warn!(error = %format!("{err:#}"), "scheduled sync run failed; next tick retries");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduled sync job");
    Ok(Some(sched))
}

/// Start `sched` and keep it running until Ctrl-C.
pub async fn run_scheduler_until_ctrl_c(mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
