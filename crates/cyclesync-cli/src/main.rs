mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use cyclesync_adapters::{ChainedSource, CsvExportFile, CycleTableHtml, RowSource, ScrapedRowsFile};
use cyclesync_core::SourceFormat;
use cyclesync_storage::{InMemoryWarehouse, PgWarehouse, RawBatchArchive, Warehouse};
use cyclesync_sync::{
    check_duplicates, cleanup_duplicates, maybe_build_scheduler, run_scheduler_until_ctrl_c, FileOverrides,
    RunCoordinator, StrategyPreference, SyncConfig, IMPORT_BATCH_SIZE,
};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "cyclesync")]
#[command(about = "Wash cycle harvest → reconcile → warehouse upsert")]
struct Cli {
    /// YAML file overriding environment configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync over harvested cycle-table rows.
    Sync {
        #[command(flatten)]
        sources: SourceArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Bulk-load a CSV export.
    ImportCsv {
        path: PathBuf,
        #[arg(long, default_value_t = IMPORT_BATCH_SIZE)]
        batch_size: usize,
        #[command(flatten)]
        run: RunArgs,
    },
    /// List ids stored more than once; exits non-zero when any exist.
    CheckDuplicates {
        #[arg(long, default_value_t = 3)]
        days: u32,
        /// Audit the whole table instead of a trailing window.
        #[arg(long)]
        all: bool,
    },
    /// Rebuild the main table with one row per id.
    CleanupDuplicates,
    /// Create the main table and its indexes. `sync` and `import-csv` do
    /// this on their own before writing.
    Migrate,
    /// Run sync on the configured cron until interrupted.
    Schedule {
        #[command(flatten)]
        sources: SourceArgs,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// JSON array of cycle-table rows from the browser scrape. Repeatable.
    #[arg(long)]
    live_json: Vec<PathBuf>,
    /// Saved cycle-table HTML page. Repeatable.
    #[arg(long)]
    live_html: Vec<PathBuf>,
    /// CSV export file.
    #[arg(long, conflicts_with_all = ["live_json", "live_html"])]
    csv: Option<PathBuf>,
}

impl SourceArgs {
    fn build(&self) -> Result<Box<dyn RowSource>> {
        if let Some(path) = &self.csv {
            return Ok(Box::new(CsvExportFile::new(path)));
        }
        let mut sources: Vec<Box<dyn RowSource>> = Vec::new();
        for path in &self.live_json {
            sources.push(Box::new(ScrapedRowsFile::new(path)));
        }
        for path in &self.live_html {
            sources.push(Box::new(CycleTableHtml::new(path)));
        }
        match sources.len() {
            0 => bail!("no row source given; pass --live-json, --live-html or --csv"),
            1 => Ok(sources.remove(0)),
            _ => Ok(Box::new(ChainedSource::new(SourceFormat::LiveScrape, sources)?)),
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Trailing window of stored rows consulted when classifying.
    #[arg(long)]
    window_days: Option<u32>,
    /// auto, delete-insert, stage-merge or load-merge.
    #[arg(long)]
    strategy: Option<StrategyPreference>,
    /// Classify and report without writing or notifying.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    table: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> FileOverrides {
        FileOverrides {
            snapshot_window_days: self.window_days,
            write_strategy: self.strategy,
            dry_run: self.dry_run.then_some(true),
            table: self.table.clone(),
            ..FileOverrides::default()
        }
    }
}

async fn connect_postgres(config: &SyncConfig) -> Result<PgWarehouse> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgWarehouse::connect(url).await.context("connecting to postgres")
}

/// Postgres when configured; a throwaway in-memory store only for dry runs.
async fn open_warehouse(config: &SyncConfig) -> Result<Arc<dyn Warehouse>> {
    if config.database_url.is_some() {
        return Ok(Arc::new(connect_postgres(config).await?));
    }
    if config.dry_run {
        warn!("DATABASE_URL is not set; dry run classifies against an empty in-memory store");
        return Ok(Arc::new(InMemoryWarehouse::mutable()));
    }
    bail!("DATABASE_URL is not set")
}

fn build_coordinator(config: &SyncConfig, warehouse: Arc<dyn Warehouse>) -> Result<RunCoordinator> {
    let run_config = config.run_config(warehouse.capabilities(), warehouse.backend_name())?;
    let mut coordinator = RunCoordinator::new(warehouse, config.table.clone(), run_config, config.monitor_sink()?);
    if let Some(dir) = &config.archive_dir {
        coordinator = coordinator.with_archive(RawBatchArchive::new(dir));
    }
    if let Some(dir) = &config.reports_dir {
        coordinator = coordinator.with_reports_dir(dir);
    }
    Ok(coordinator)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(path) = &cli.config {
        config.apply(SyncConfig::load_file(path)?)?;
    }

    match cli.command {
        Commands::Sync { sources, run } => {
            config.apply(run.overrides())?;
            let source = sources.build()?;
            let coordinator = build_coordinator(&config, open_warehouse(&config).await?)?;
            let summary = coordinator.run(source.as_ref()).await?;
            println!(
                "sync complete: run_id={} records={} new={} updated={} unchanged={} rejected={} dry_run={}",
                summary.run_id,
                summary.records,
                summary.new_rows,
                summary.changed_rows,
                summary.unchanged_rows,
                summary.rejected_rows,
                summary.dry_run
            );
        }
        Commands::ImportCsv { path, batch_size, run } => {
            config.apply(run.overrides())?;
            let source = CsvExportFile::new(path);
            let coordinator = build_coordinator(&config, open_warehouse(&config).await?)?;
            let summary = coordinator.import(&source, batch_size).await?;
            println!(
                "import complete: records={} new={} updated={} skipped={} rejected={} batches={} dry_run={}",
                summary.records,
                summary.new_rows,
                summary.changed_rows,
                summary.skipped_unchanged,
                summary.rejected_rows,
                summary.batches,
                summary.dry_run
            );
        }
        Commands::CheckDuplicates { days, all } => {
            let pg = connect_postgres(&config).await?;
            let window = if all {
                None
            } else {
                Some(TimeDelta::try_days(i64::from(days)).context("window too large")?)
            };
            let audit = check_duplicates(&pg, &config.table, window, Utc::now()).await?;
            println!("rows: {}", audit.total_rows);
            for dup in &audit.duplicates {
                println!(
                    "{} copies={} completed={:?} last_updated={:?}",
                    dup.cycle_id, dup.copies, dup.completion_flags, dup.last_updated
                );
            }
            if audit.has_duplicates() {
                bail!(
                    "{} duplicated ids ({} excess rows) in {}",
                    audit.duplicates.len(),
                    audit.excess_rows(),
                    audit.table
                );
            }
            println!("no duplicates");
        }
        Commands::CleanupDuplicates => {
            let pg = connect_postgres(&config).await?;
            let report = cleanup_duplicates(&pg, &config.table).await?;
            pg.ensure_table(&config.table).await?;
            println!(
                "cleanup complete: table={} rows_before={} rows_after={} removed={}",
                report.table,
                report.rows_before,
                report.rows_after,
                report.removed()
            );
        }
        Commands::Migrate => {
            let pg = connect_postgres(&config).await?;
            pg.ensure_table(&config.table).await?;
            println!("table {} ready", config.table);
        }
        Commands::Schedule { sources, run } => {
            config.apply(run.overrides())?;
            let source: Arc<dyn RowSource> = Arc::from(sources.build()?);
            let coordinator = Arc::new(build_coordinator(&config, open_warehouse(&config).await?)?);
            let Some(sched) = maybe_build_scheduler(&config, coordinator, source).await? else {
                bail!("scheduler is disabled; set CYCLESYNC_SCHEDULER_ENABLED=true");
            };
            run_scheduler_until_ctrl_c(sched).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_become_overrides() {
        let cli = Cli::parse_from([
            "cyclesync",
            "sync",
            "--live-json",
            "today.json",
            "--live-json",
            "yesterday.json",
            "--window-days",
            "2",
            "--strategy",
            "stage-merge",
            "--dry-run",
        ]);
        let Commands::Sync { sources, run } = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(sources.live_json.len(), 2);
        let overrides = run.overrides();
        assert_eq!(overrides.snapshot_window_days, Some(2));
        assert_eq!(overrides.write_strategy, Some(StrategyPreference::StageMerge));
        assert_eq!(overrides.dry_run, Some(true));
        assert!(sources.build().is_ok());
    }

    #[test]
    fn csv_and_live_sources_conflict() {
        assert!(Cli::try_parse_from(["cyclesync", "sync", "--csv", "a.csv", "--live-json", "b.json"]).is_err());
    }

    #[test]
    fn a_source_is_required() {
        let cli = Cli::parse_from(["cyclesync", "sync"]);
        let Commands::Sync { sources, .. } = cli.command else {
            panic!("expected sync");
        };
        assert!(sources.build().is_err());
    }
}
