//! Process-local warehouse used for dry runs and tests.
//!
//! With the recent-write lock enabled it behaves like a streaming-buffer
//! backend: rows accepted through [`Warehouse::bulk_insert`] refuse deletes
//! and merge updates until [`InMemoryWarehouse::settle_recent_writes`] runs.
//! Load-job writes are never locked.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cyclesync_core::{CycleRecord, KEY_COLUMN};
use tracing::debug;

use crate::{
    DuplicateId, QueryOutput, Statement, TableName, Warehouse, WarehouseCapabilities, WarehouseError,
    WriteMode,
};

/// Warehouse calls, recorded in order for inspection and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Query,
    BulkInsert,
    BulkLoad,
    Merge,
    EnsureTable,
    DropTable,
    RenameTable,
}

#[derive(Debug, Clone)]
struct StoredRow {
    record: CycleRecord,
    recently_written: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<StoredRow>>,
    pending_faults: HashMap<Operation, usize>,
    operations: Vec<Operation>,
}

#[derive(Debug)]
pub struct InMemoryWarehouse {
    state: Mutex<MemoryState>,
    recent_write_lock: bool,
}

impl InMemoryWarehouse {
    /// Backend whose appended rows are immediately mutable.
    pub fn mutable() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            recent_write_lock: false,
        }
    }

    /// Backend that locks freshly appended rows against mutation.
    pub fn with_recent_write_lock() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            recent_write_lock: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_table(&self, table: &TableName) {
        self.lock().tables.entry(table.to_string()).or_default();
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn rows(&self, table: &TableName) -> Vec<CycleRecord> {
        self.lock()
            .tables
            .get(table.as_str())
            .map(|rows| rows.iter().map(|r| r.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Rows currently holding `id`, in storage order.
    pub fn rows_for_id(&self, table: &TableName, id: &str) -> Vec<CycleRecord> {
        self.rows(table).into_iter().filter(|r| r.id == id).collect()
    }

    /// Let the recent-write buffer drain, as time passing would.
    pub fn settle_recent_writes(&self) {
        for row in self.lock().tables.values_mut().flat_map(|rows| rows.iter_mut()) {
            row.recently_written = false;
        }
    }

    /// Make the next `times` calls of `operation` fail with a backend error.
    pub fn fail_next(&self, operation: Operation, times: usize) {
        *self.lock().pending_faults.entry(operation).or_default() += times;
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    fn begin(&self, operation: Operation, name: &'static str) -> Result<MutexGuard<'_, MemoryState>, WarehouseError> {
        let mut state = self.lock();
        state.operations.push(operation);
        if let Some(remaining) = state.pending_faults.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WarehouseError::Backend {
                    operation: name,
                    message: "injected fault".to_string(),
                });
            }
        }
        Ok(state)
    }
}

fn table_mut<'a>(state: &'a mut MemoryState, table: &TableName) -> Result<&'a mut Vec<StoredRow>, WarehouseError> {
    state
        .tables
        .get_mut(table.as_str())
        .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
}

fn table_ref<'a>(state: &'a MemoryState, table: &TableName) -> Result<&'a Vec<StoredRow>, WarehouseError> {
    state
        .tables
        .get(table.as_str())
        .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
}

fn deduplicated(rows: &[StoredRow]) -> Vec<StoredRow> {
    let mut order = Vec::new();
    let mut best: HashMap<&str, &StoredRow> = HashMap::new();
    for row in rows {
        let id = row.record.id.as_str();
        match best.get(id) {
            None => {
                order.push(id);
                best.insert(id, row);
            }
            Some(current) => {
                let candidate = (row.record.last_updated, row.record.is_completed);
                let incumbent = (current.record.last_updated, current.record.is_completed);
                if candidate > incumbent {
                    best.insert(id, row);
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| best.get(id))
        .map(|row| StoredRow {
            record: row.record.clone(),
            recently_written: false,
        })
        .collect()
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> WarehouseCapabilities {
        WarehouseCapabilities {
            supports_immediate_row_mutation: !self.recent_write_lock,
        }
    }

    async fn ensure_table(&self, table: &TableName) -> Result<(), WarehouseError> {
        let mut state = self.begin(Operation::EnsureTable, "ensure_table")?;
        state.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn query(&self, statement: &Statement) -> Result<QueryOutput, WarehouseError> {
        let mut state = self.begin(Operation::Query, "query")?;
        match statement {
            Statement::CompletionSince { table, since } => {
                let rows = table_ref(&state, table)?;
                Ok(QueryOutput::Completion(
                    rows.iter()
                        .filter(|r| since.map_or(true, |s| r.record.start_time >= s))
                        .map(|r| (r.record.id.clone(), r.record.is_completed))
                        .collect(),
                ))
            }
            Statement::CompletionForIds { table, ids } => {
                let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let rows = table_ref(&state, table)?;
                Ok(QueryOutput::Completion(
                    rows.iter()
                        .filter(|r| wanted.contains(r.record.id.as_str()))
                        .map(|r| (r.record.id.clone(), r.record.is_completed))
                        .collect(),
                ))
            }
            Statement::DeleteByIds { table, ids } => {
                let lock = self.recent_write_lock;
                let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let rows = table_mut(&mut state, table)?;
                let locked = rows
                    .iter()
                    .filter(|r| lock && r.recently_written && wanted.contains(r.record.id.as_str()))
                    .count();
                if locked > 0 {
                    return Err(WarehouseError::RecentWriteLocked {
                        table: table.to_string(),
                        count: locked,
                    });
                }
                let before = rows.len();
                rows.retain(|r| !wanted.contains(r.record.id.as_str()));
                Ok(QueryOutput::Affected((before - rows.len()) as u64))
            }
            Statement::DuplicateIds { table, since } => {
                let rows = table_ref(&state, table)?;
                let mut grouped: BTreeMap<&str, DuplicateId> = BTreeMap::new();
                for row in rows.iter().filter(|r| since.map_or(true, |s| r.record.start_time >= s)) {
                    let entry = grouped.entry(row.record.id.as_str()).or_insert_with(|| DuplicateId {
                        cycle_id: row.record.id.clone(),
                        copies: 0,
                        completion_flags: Vec::new(),
                        last_updated: Vec::new(),
                    });
                    entry.copies += 1;
                    entry.completion_flags.push(row.record.is_completed);
                    entry.last_updated.push(row.record.last_updated);
                }
                let mut duplicates: Vec<DuplicateId> =
                    grouped.into_values().filter(|d| d.copies > 1).collect();
                duplicates.sort_by(|a, b| b.copies.cmp(&a.copies).then_with(|| a.cycle_id.cmp(&b.cycle_id)));
                Ok(QueryOutput::Duplicates(duplicates))
            }
            Statement::CountRows { table, since } => {
                let rows = table_ref(&state, table)?;
                Ok(QueryOutput::Count(
                    rows.iter()
                        .filter(|r| since.map_or(true, |s| r.record.start_time >= s))
                        .count() as u64,
                ))
            }
            Statement::CreateDeduplicatedCopy { source, target } => {
                let copy = deduplicated(table_ref(&state, source)?);
                let written = copy.len() as u64;
                state.tables.insert(target.to_string(), copy);
                Ok(QueryOutput::Affected(written))
            }
        }
    }

    async fn bulk_insert(&self, table: &TableName, rows: &[CycleRecord]) -> Result<u64, WarehouseError> {
        let lock = self.recent_write_lock;
        let mut state = self.begin(Operation::BulkInsert, "bulk_insert")?;
        let stored = table_mut(&mut state, table)?;
        stored.extend(rows.iter().cloned().map(|record| StoredRow {
            record,
            recently_written: lock,
        }));
        debug!(table = %table, rows = rows.len(), "appended rows");
        Ok(rows.len() as u64)
    }

    async fn bulk_load(
        &self,
        rows: &[CycleRecord],
        target: &TableName,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError> {
        let mut state = self.begin(Operation::BulkLoad, "bulk_load")?;
        let stored = state.tables.entry(target.to_string()).or_default();
        if mode == WriteMode::Truncate {
            stored.clear();
        }
        stored.extend(rows.iter().cloned().map(|record| StoredRow {
            record,
            recently_written: false,
        }));
        debug!(table = %target, rows = rows.len(), ?mode, "loaded rows");
        Ok(rows.len() as u64)
    }

    async fn merge_into(&self, target: &TableName, source: &TableName, key: &str) -> Result<u64, WarehouseError> {
        if key != KEY_COLUMN {
            return Err(WarehouseError::InvalidMergeKey(key.to_string()));
        }
        let lock = self.recent_write_lock;
        let mut state = self.begin(Operation::Merge, "merge_into")?;
        let incoming: Vec<CycleRecord> = table_ref(&state, source)?
            .iter()
            .map(|r| r.record.clone())
            .collect();

        let mut seen = HashSet::new();
        for record in &incoming {
            if !seen.insert(record.id.as_str()) {
                return Err(WarehouseError::AmbiguousMergeSource {
                    table: source.to_string(),
                    cycle_id: record.id.clone(),
                });
            }
        }

        let rows = table_mut(&mut state, target)?;
        let locked = rows
            .iter()
            .filter(|r| lock && r.recently_written && seen.contains(r.record.id.as_str()))
            .count();
        if locked > 0 {
            return Err(WarehouseError::RecentWriteLocked {
                table: target.to_string(),
                count: locked,
            });
        }

        let mut affected = 0u64;
        for record in incoming {
            let mut matched = false;
            for row in rows.iter_mut().filter(|r| r.record.id == record.id) {
                row.record = record.clone();
                matched = true;
                affected += 1;
            }
            if !matched {
                rows.push(StoredRow {
                    record,
                    recently_written: false,
                });
                affected += 1;
            }
        }
        debug!(target = %target, source = %source, affected, "merged rows");
        Ok(affected)
    }

    async fn drop_table(&self, table: &TableName) -> Result<(), WarehouseError> {
        let mut state = self.begin(Operation::DropTable, "drop_table")?;
        state
            .tables
            .remove(table.as_str())
            .map(|_| ())
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
    }

    async fn rename_table(&self, from: &TableName, to: &TableName) -> Result<(), WarehouseError> {
        let mut state = self.begin(Operation::RenameTable, "rename_table")?;
        if state.tables.contains_key(to.as_str()) {
            return Err(WarehouseError::TableExists(to.to_string()));
        }
        let rows = state
            .tables
            .remove(from.as_str())
            .ok_or_else(|| WarehouseError::TableNotFound(from.to_string()))?;
        state.tables.insert(to.to_string(), rows);
        Ok(())
    }
}
