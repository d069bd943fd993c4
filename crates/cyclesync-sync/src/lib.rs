//! Snapshot, reconcile and upsert orchestration for cyclesync runs.

mod config;
mod coordinator;
mod maintenance;
mod reconcile;
mod reports;
mod upsert;

pub use config::{ConfigError, FileOverrides, RunConfig, StrategyPreference, SyncConfig, WriteStrategy};
pub use coordinator::{
    maybe_build_scheduler, run_scheduler_until_ctrl_c, ImportSummary, RunCoordinator, RunSummary, IMPORT_BATCH_SIZE,
};
pub use maintenance::{check_duplicates, cleanup_duplicates, CleanupReport, DuplicateAudit};
pub use reconcile::{classify, collapse_duplicates, load_snapshot, reconcile, ReconciledBatch, Snapshot};
pub use reports::{write_run_report, ReportFile, ReportManifest};
pub use upsert::{stage_table_name, UpsertError, UpsertExecutor, UpsertPhase, UpsertReport};

pub const CRATE_NAME: &str = "cyclesync-sync";
