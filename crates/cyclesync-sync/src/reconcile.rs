//! Snapshot loading and New / Changed / Unchanged classification.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use cyclesync_core::{Classification, CycleRecord};
use cyclesync_storage::{Statement, TableName, Warehouse};
use tracing::{debug, info, warn};

/// `cycle_id -> is_completed` for stored rows inside the trailing window.
pub type Snapshot = HashMap<String, bool>;

/// Read the completion state of every stored row that started within
/// `window` of `now`, or of the whole table when `window` is `None`.
///
/// A failed query yields an empty snapshot so every record classifies as
/// New; re-inserting is preferred over dropping data. When the store holds
/// an id more than once the row returned last wins.
pub async fn load_snapshot(
    warehouse: &dyn Warehouse,
    table: &TableName,
    window: Option<TimeDelta>,
    now: DateTime<Utc>,
) -> Snapshot {
    let since = window.map(|w| now - w);
    let statement = Statement::CompletionSince {
        table: table.clone(),
        since,
    };
    let rows = match warehouse.query(&statement).await.and_then(|out| out.into_completion()) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(table = %table, ?since, error = %err, "snapshot query failed; treating every record as new");
            return Snapshot::new();
        }
    };
    let snapshot: Snapshot = rows.into_iter().collect();
    info!(table = %table, ?since, existing = snapshot.len(), "loaded existing-state snapshot");
    snapshot
}

/// Pure comparison of one record against the snapshot.
pub fn classify(record: &CycleRecord, snapshot: &Snapshot) -> Classification {
    match snapshot.get(&record.id) {
        None => Classification::New,
        Some(&stored) if stored != record.is_completed => Classification::Changed,
        Some(_) => Classification::Unchanged,
    }
}

/// Keep one record per id. A completed occurrence beats an incomplete one;
/// otherwise the later occurrence wins. The survivor keeps the position of
/// the id's first occurrence. Returns the number of records dropped.
pub fn collapse_duplicates(records: Vec<CycleRecord>) -> (Vec<CycleRecord>, usize) {
    let mut kept: Vec<CycleRecord> = Vec::with_capacity(records.len());
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut collapsed = 0;
    for record in records {
        match position.get(&record.id) {
            Some(&index) => {
                collapsed += 1;
                let current = &kept[index];
                if record.is_completed || !current.is_completed {
                    debug!(cycle_id = %record.id, completed = record.is_completed, "duplicate id in batch; replacing earlier occurrence");
                    kept[index] = record;
                } else {
                    debug!(cycle_id = %record.id, "duplicate id in batch; keeping completed occurrence");
                }
            }
            None => {
                position.insert(record.id.clone(), kept.len());
                kept.push(record);
            }
        }
    }
    (kept, collapsed)
}

#[derive(Debug, Clone, Default)]
pub struct ReconciledBatch {
    pub new: Vec<CycleRecord>,
    pub changed: Vec<CycleRecord>,
    pub unchanged: usize,
    pub duplicates_collapsed: usize,
}

impl ReconciledBatch {
    /// Rows the upsert step has to persist.
    pub fn pending(&self) -> usize {
        self.new.len() + self.changed.len()
    }
}

pub fn reconcile(records: Vec<CycleRecord>, snapshot: &Snapshot) -> ReconciledBatch {
    let (records, duplicates_collapsed) = collapse_duplicates(records);
    let mut batch = ReconciledBatch {
        duplicates_collapsed,
        ..ReconciledBatch::default()
    };
    for record in records {
        match classify(&record, snapshot) {
            Classification::New => {
                debug!(cycle_id = %record.id, completed = record.is_completed, "new");
                batch.new.push(record);
            }
            Classification::Changed => {
                debug!(
                    cycle_id = %record.id,
                    stored = snapshot.get(&record.id).copied().unwrap_or_default(),
                    incoming = record.is_completed,
                    "changed"
                );
                batch.changed.push(record);
            }
            Classification::Unchanged => {
                debug!(cycle_id = %record.id, "unchanged");
                batch.unchanged += 1;
            }
        }
    }
    batch
}
