//! Duplicate audit and cleanup for the main table.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use cyclesync_storage::{DuplicateId, Statement, TableName, Warehouse};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateAudit {
    pub table: String,
    pub since: Option<DateTime<Utc>>,
    pub total_rows: u64,
    pub duplicates: Vec<DuplicateId>,
}

impl DuplicateAudit {
    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }

    /// Rows that would go away if every id kept a single copy.
    pub fn excess_rows(&self) -> u64 {
        self.duplicates.iter().map(|d| d.copies.saturating_sub(1)).sum()
    }
}

/// Ids stored more than once among rows starting inside `window` of `now`
/// (the whole table when `window` is `None`).
pub async fn check_duplicates(
    warehouse: &dyn Warehouse,
    table: &TableName,
    window: Option<TimeDelta>,
    now: DateTime<Utc>,
) -> Result<DuplicateAudit> {
    let since = window.map(|w| now - w);
    let duplicates = warehouse
        .query(&Statement::DuplicateIds {
            table: table.clone(),
            since,
        })
        .await
        .and_then(|out| out.into_duplicates())
        .with_context(|| format!("listing duplicate ids in {table}"))?;
    let total_rows = warehouse
        .query(&Statement::CountRows {
            table: table.clone(),
            since,
        })
        .await
        .and_then(|out| out.into_count())
        .with_context(|| format!("counting rows in {table}"))?;

    let audit = DuplicateAudit {
        table: table.to_string(),
        since,
        total_rows,
        duplicates,
    };
    if audit.has_duplicates() {
        warn!(table = %table, ids = audit.duplicates.len(), excess = audit.excess_rows(), "duplicate ids found");
    } else {
        info!(table = %table, total_rows, "no duplicate ids");
    }
    Ok(audit)
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub table: String,
    pub rows_before: u64,
    pub rows_after: u64,
    pub duplicate_ids: usize,
}

impl CleanupReport {
    pub fn removed(&self) -> u64 {
        self.rows_before.saturating_sub(self.rows_after)
    }
}

/// Rebuild `table` with one row per id: the copy with the latest
/// `last_updated`, completed copies first on ties.
///
/// Builds the deduplicated copy, drops the original, renames the copy into
/// place and verifies the result. Only query, drop and rename are used.
pub async fn cleanup_duplicates(warehouse: &dyn Warehouse, table: &TableName) -> Result<CleanupReport> {
    let now = Utc::now();
    let before = check_duplicates(warehouse, table, None, now).await?;
    if !before.has_duplicates() {
        return Ok(CleanupReport {
            table: table.to_string(),
            rows_before: before.total_rows,
            rows_after: before.total_rows,
            duplicate_ids: 0,
        });
    }

    let copy = table
        .with_suffix(&format!("dedup_{}", now.format("%Y%m%d%H%M%S")))
        .context("naming deduplicated copy")?;
    let written = warehouse
        .query(&Statement::CreateDeduplicatedCopy {
            source: table.clone(),
            target: copy.clone(),
        })
        .await
        .and_then(|out| out.into_count())
        .with_context(|| format!("creating deduplicated copy {copy}"))?;
    info!(copy = %copy, rows = written, "built deduplicated copy");

    warehouse
        .drop_table(table)
        .await
        .with_context(|| format!("dropping {table}; deduplicated rows remain in {copy}"))?;
    warehouse
        .rename_table(&copy, table)
        .await
        .with_context(|| format!("renaming {copy} to {table}"))?;

    let after = check_duplicates(warehouse, table, None, Utc::now()).await?;
    if after.has_duplicates() {
        bail!("{} ids in {table} are still duplicated after cleanup", after.duplicates.len());
    }

    let report = CleanupReport {
        table: table.to_string(),
        rows_before: before.total_rows,
        rows_after: after.total_rows,
        duplicate_ids: before.duplicates.len(),
    };
    info!(table = %table, removed = report.removed(), "duplicate cleanup complete");
    Ok(report)
}
