//! Persisting New and Changed rows under the three write protocols.
//!
//! Every protocol leaves one row per id once it succeeds. Delete-insert
//! gets there by aborting before the insert when the delete fails; the
//! merge-based protocols get there through the keyed merge. Stage-merge
//! appends New rows without a merge, so it first looks their ids up and
//! only appends the ones the table does not hold yet; applying the same
//! batch twice therefore leaves one row per id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use cyclesync_core::{CycleRecord, KEY_COLUMN};
use cyclesync_storage::{Statement, TableName, Warehouse, WarehouseError, WriteMode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WriteStrategy;

/// Steps an upsert moves through, in the order a protocol runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertPhase {
    ScreenNew,
    DeleteChanged,
    InsertRows,
    AppendNew,
    LoadStage,
    MergeStage,
    DropStage,
}

impl UpsertPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScreenNew => "screen_new",
            Self::DeleteChanged => "delete_changed",
            Self::InsertRows => "insert_rows",
            Self::AppendNew => "append_new",
            Self::LoadStage => "load_stage",
            Self::MergeStage => "merge_stage",
            Self::DropStage => "drop_stage",
        }
    }
}

impl std::fmt::Display for UpsertPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{strategy} upsert into {table} failed during {phase}: {source}")]
pub struct UpsertError {
    pub strategy: WriteStrategy,
    pub phase: UpsertPhase,
    pub table: String,
    #[source]
    pub source: WarehouseError,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertReport {
    pub strategy: WriteStrategy,
    pub new_rows: usize,
    pub changed_rows: usize,
    /// Row count the warehouse reported across every write step.
    pub rows_written: u64,
    /// New rows already stored with the same completion state; not written.
    pub already_present: usize,
    pub stage_table: Option<String>,
    pub cleanup_failed: bool,
    pub completed_phases: Vec<UpsertPhase>,
}

impl UpsertReport {
    pub fn total(&self) -> usize {
        self.new_rows + self.changed_rows
    }
}

/// Staging table name unique to this run: `<table>_stage_<UTC stamp>_<8 hex>`.
pub fn stage_table_name(table: &TableName, now: DateTime<Utc>) -> Result<TableName, WarehouseError> {
    let nonce = Uuid::new_v4().simple().to_string();
    table.with_suffix(&format!(
        "stage_{}_{}",
        now.format("%Y%m%d%H%M%S"),
        &nonce[..8]
    ))
}

pub struct UpsertExecutor<'a> {
    warehouse: &'a dyn Warehouse,
    table: &'a TableName,
    strategy: WriteStrategy,
}

impl<'a> UpsertExecutor<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, table: &'a TableName, strategy: WriteStrategy) -> Self {
        Self {
            warehouse,
            table,
            strategy,
        }
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    fn fail(&self, phase: UpsertPhase, source: WarehouseError) -> UpsertError {
        UpsertError {
            strategy: self.strategy,
            phase,
            table: self.table.to_string(),
            source,
        }
    }

    /// Persist `new` (ids absent from the snapshot) and `changed` (ids whose
    /// completion state moved). `changed` must not repeat an id.
    pub async fn apply(&self, new: &[CycleRecord], changed: &[CycleRecord]) -> Result<UpsertReport, UpsertError> {
        let mut report = UpsertReport {
            strategy: self.strategy,
            new_rows: new.len(),
            changed_rows: changed.len(),
            rows_written: 0,
            already_present: 0,
            stage_table: None,
            cleanup_failed: false,
            completed_phases: Vec::new(),
        };
        if new.is_empty() && changed.is_empty() {
            debug!(table = %self.table, "nothing to upsert");
            return Ok(report);
        }

        match self.strategy {
            WriteStrategy::DeleteInsert => self.delete_insert(new, changed, &mut report).await?,
            WriteStrategy::StageMerge => {
                let (append, mut merge) = self.screen_new(new, &mut report).await?;
                if !append.is_empty() {
                    report.rows_written += self
                        .warehouse
                        .bulk_insert(self.table, &append)
                        .await
                        .map_err(|err| self.fail(UpsertPhase::AppendNew, err))?;
                    report.completed_phases.push(UpsertPhase::AppendNew);
                }
                merge.extend_from_slice(changed);
                if !merge.is_empty() {
                    self.stage_and_merge(&merge, &mut report).await?;
                }
            }
            WriteStrategy::LoadMerge => {
                let rows: Vec<CycleRecord> = new.iter().chain(changed).cloned().collect();
                self.stage_and_merge(&rows, &mut report).await?;
            }
        }

        info!(
            table = %self.table,
            strategy = %self.strategy,
            new = report.new_rows,
            changed = report.changed_rows,
            total = report.total(),
            rows_written = report.rows_written,
            "upsert complete"
        );
        Ok(report)
    }

    /// Split `new` into rows to append and rows whose id the table already
    /// holds with a different completion state, which must go through the
    /// merge instead. Rows stored unchanged are dropped.
    async fn screen_new(
        &self,
        new: &[CycleRecord],
        report: &mut UpsertReport,
    ) -> Result<(Vec<CycleRecord>, Vec<CycleRecord>), UpsertError> {
        if new.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let lookup = Statement::CompletionForIds {
            table: self.table.clone(),
            ids: new.iter().map(|r| r.id.clone()).collect(),
        };
        let stored: HashMap<String, bool> = self
            .warehouse
            .query(&lookup)
            .await
            .and_then(|out| out.into_completion())
            .map_err(|err| self.fail(UpsertPhase::ScreenNew, err))?
            .into_iter()
            .collect();
        report.completed_phases.push(UpsertPhase::ScreenNew);

        let mut append = Vec::with_capacity(new.len());
        let mut merge = Vec::new();
        for record in new {
            match stored.get(&record.id) {
                None => append.push(record.clone()),
                Some(&completed) if completed != record.is_completed => merge.push(record.clone()),
                Some(_) => report.already_present += 1,
            }
        }
        if append.len() < new.len() {
            debug!(
                table = %self.table,
                already_present = report.already_present,
                rerouted = merge.len(),
                "new rows already stored"
            );
        }
        Ok((append, merge))
    }

    async fn delete_insert(
        &self,
        new: &[CycleRecord],
        changed: &[CycleRecord],
        report: &mut UpsertReport,
    ) -> Result<(), UpsertError> {
        if !changed.is_empty() {
            let delete = Statement::DeleteByIds {
                table: self.table.clone(),
                ids: changed.iter().map(|r| r.id.clone()).collect(),
            };
            let deleted = self
                .warehouse
                .query(&delete)
                .await
                .and_then(|out| out.into_count())
                .map_err(|err| self.fail(UpsertPhase::DeleteChanged, err))?;
            debug!(table = %self.table, deleted, "deleted superseded rows");
            report.completed_phases.push(UpsertPhase::DeleteChanged);
        }

        let rows: Vec<CycleRecord> = new.iter().chain(changed).cloned().collect();
        report.rows_written += self
            .warehouse
            .bulk_insert(self.table, &rows)
            .await
            .map_err(|err| self.fail(UpsertPhase::InsertRows, err))?;
        report.completed_phases.push(UpsertPhase::InsertRows);
        Ok(())
    }

    /// Load `rows` into a fresh staging table, merge on the key, then drop
    /// the staging table whatever the merge did. A failed drop is logged
    /// and otherwise ignored.
    async fn stage_and_merge(&self, rows: &[CycleRecord], report: &mut UpsertReport) -> Result<(), UpsertError> {
        let stage = stage_table_name(self.table, Utc::now()).map_err(|err| self.fail(UpsertPhase::LoadStage, err))?;
        report.stage_table = Some(stage.to_string());

        let outcome = self.load_and_merge(&stage, rows, report).await;

        match self.warehouse.drop_table(&stage).await {
            Ok(()) => report.completed_phases.push(UpsertPhase::DropStage),
            Err(err) => {
                warn!(stage = %stage, error = %err, "failed to drop staging table; leaving it behind");
                report.cleanup_failed = true;
            }
        }
        outcome
    }

    async fn load_and_merge(
        &self,
        stage: &TableName,
        rows: &[CycleRecord],
        report: &mut UpsertReport,
    ) -> Result<(), UpsertError> {
        self.warehouse
            .bulk_load(rows, stage, WriteMode::Truncate)
            .await
            .map_err(|err| self.fail(UpsertPhase::LoadStage, err))?;
        report.completed_phases.push(UpsertPhase::LoadStage);

        report.rows_written += self
            .warehouse
            .merge_into(self.table, stage, KEY_COLUMN)
            .await
            .map_err(|err| self.fail(UpsertPhase::MergeStage, err))?;
        report.completed_phases.push(UpsertPhase::MergeStage);
        Ok(())
    }
}
