//! Postgres-backed warehouse.
//!
//! Postgres mutates freshly inserted rows without restriction, so this backend
//! advertises immediate row mutation and the delete-then-insert strategy
//! applies. `merge_into` needs Postgres 15 or newer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyclesync_core::{CycleRecord, CYCLE_COLUMNS, KEY_COLUMN};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::{
    DuplicateId, QueryOutput, Statement, TableName, Warehouse, WarehouseCapabilities, WarehouseError,
    WriteMode,
};

const COLUMN_DEFINITIONS: &str = r#"
    cycle_id TEXT NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    duration_minutes DOUBLE PRECISION,
    device_name TEXT,
    formula_name TEXT,
    washer TEXT,
    customer TEXT,
    weight DOUBLE PRECISION,
    dose_a DOUBLE PRECISION,
    dose_b DOUBLE PRECISION,
    dose_c DOUBLE PRECISION,
    dose_d DOUBLE PRECISION,
    additive_e DOUBLE PRECISION,
    excess_time_minutes DOUBLE PRECISION,
    idle_time_minutes DOUBLE PRECISION,
    is_completed BOOLEAN NOT NULL,
    last_updated TIMESTAMPTZ NOT NULL
"#;

const UNNEST_TYPES: &str = "$1::text[], $2::timestamptz[], $3::timestamptz[], $4::float8[], \
    $5::text[], $6::text[], $7::text[], $8::text[], $9::float8[], $10::float8[], $11::float8[], \
    $12::float8[], $13::float8[], $14::float8[], $15::float8[], $16::float8[], $17::bool[], \
    $18::timestamptz[]";

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn create_table_if_missing(
    tx: &mut Transaction<'_, Postgres>,
    table: &TableName,
) -> Result<(), WarehouseError> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({COLUMN_DEFINITIONS})",
        table.quoted()
    ))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_rows(
    tx: &mut Transaction<'_, Postgres>,
    table: &TableName,
    rows: &[CycleRecord],
) -> Result<u64, WarehouseError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let columns = RecordColumns::from_records(rows);
    let sql = format!(
        "INSERT INTO {} ({}) SELECT * FROM UNNEST({UNNEST_TYPES})",
        table.quoted(),
        CYCLE_COLUMNS.join(", ")
    );
    let result = sqlx::query(&sql)
        .bind(columns.cycle_id)
        .bind(columns.start_time)
        .bind(columns.end_time)
        .bind(columns.duration_minutes)
        .bind(columns.device_name)
        .bind(columns.formula_name)
        .bind(columns.washer)
        .bind(columns.customer)
        .bind(columns.weight)
        .bind(columns.dose_a)
        .bind(columns.dose_b)
        .bind(columns.dose_c)
        .bind(columns.dose_d)
        .bind(columns.additive_e)
        .bind(columns.excess_time_minutes)
        .bind(columns.idle_time_minutes)
        .bind(columns.is_completed)
        .bind(columns.last_updated)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

/// Column-major view of a record slice, bound as one array per column.
#[derive(Default)]
struct RecordColumns {
    cycle_id: Vec<String>,
    start_time: Vec<DateTime<Utc>>,
    end_time: Vec<Option<DateTime<Utc>>>,
    duration_minutes: Vec<Option<f64>>,
    device_name: Vec<Option<String>>,
    formula_name: Vec<Option<String>>,
    washer: Vec<Option<String>>,
    customer: Vec<Option<String>>,
    weight: Vec<Option<f64>>,
    dose_a: Vec<Option<f64>>,
    dose_b: Vec<Option<f64>>,
    dose_c: Vec<Option<f64>>,
    dose_d: Vec<Option<f64>>,
    additive_e: Vec<Option<f64>>,
    excess_time_minutes: Vec<Option<f64>>,
    idle_time_minutes: Vec<Option<f64>>,
    is_completed: Vec<bool>,
    last_updated: Vec<DateTime<Utc>>,
}

impl RecordColumns {
    fn from_records(rows: &[CycleRecord]) -> Self {
        let mut c = Self::default();
        for r in rows {
            c.cycle_id.push(r.id.clone());
            c.start_time.push(r.start_time);
            c.end_time.push(r.end_time);
            c.duration_minutes.push(r.duration_minutes);
            c.device_name.push(r.device_name.clone());
            c.formula_name.push(r.formula_name.clone());
            c.washer.push(r.washer.clone());
            c.customer.push(r.customer.clone());
            c.weight.push(r.weight);
            c.dose_a.push(r.dose_a);
            c.dose_b.push(r.dose_b);
            c.dose_c.push(r.dose_c);
            c.dose_d.push(r.dose_d);
            c.additive_e.push(r.additive_e);
            c.excess_time_minutes.push(r.excess_time_minutes);
            c.idle_time_minutes.push(r.idle_time_minutes);
            c.is_completed.push(r.is_completed);
            c.last_updated.push(r.last_updated);
        }
        c
    }
}

fn merge_sql(target: &TableName, source: &TableName) -> String {
    let updates = CYCLE_COLUMNS
        .iter()
        .filter(|c| **c != KEY_COLUMN)
        .map(|c| format!("{c} = s.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let values = CYCLE_COLUMNS
        .iter()
        .map(|c| format!("s.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "MERGE INTO {target} AS t USING {source} AS s ON t.{KEY_COLUMN} = s.{KEY_COLUMN} \
         WHEN MATCHED THEN UPDATE SET {updates} \
         WHEN NOT MATCHED THEN INSERT ({columns}) VALUES ({values})",
        target = target.quoted(),
        source = source.quoted(),
        columns = CYCLE_COLUMNS.join(", "),
    )
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> WarehouseCapabilities {
        WarehouseCapabilities {
            supports_immediate_row_mutation: true,
        }
    }

    /// Create `table` and its lookup indexes when missing. No uniqueness
    /// constraint is declared on the key; duplicates are tolerated and
    /// handled by the maintenance commands.
    async fn ensure_table(&self, table: &TableName) -> Result<(), WarehouseError> {
        let mut tx = self.pool.begin().await?;
        create_table_if_missing(&mut tx, table).await?;
        for column in [KEY_COLUMN, "start_time"] {
            let index = table.with_suffix(&format!("{column}_idx"))?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({column})",
                index.quoted(),
                table.quoted()
            ))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(table = %table, "ensured warehouse table");
        Ok(())
    }

    async fn query(&self, statement: &Statement) -> Result<QueryOutput, WarehouseError> {
        match statement {
            Statement::CompletionSince { table, since } => {
                let rows = sqlx::query(&format!(
                    "SELECT cycle_id, is_completed FROM {} WHERE $1::timestamptz IS NULL OR start_time >= $1",
                    table.quoted()
                ))
                .bind(since)
                .fetch_all(&self.pool)
                .await?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    out.push((row.try_get("cycle_id")?, row.try_get("is_completed")?));
                }
                Ok(QueryOutput::Completion(out))
            }
            Statement::CompletionForIds { table, ids } => {
                let rows = sqlx::query(&format!(
                    "SELECT cycle_id, is_completed FROM {} WHERE cycle_id = ANY($1)",
                    table.quoted()
                ))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    out.push((row.try_get("cycle_id")?, row.try_get("is_completed")?));
                }
                Ok(QueryOutput::Completion(out))
            }
            Statement::DeleteByIds { table, ids } => {
                let result = sqlx::query(&format!("DELETE FROM {} WHERE cycle_id = ANY($1)", table.quoted()))
                    .bind(ids)
                    .execute(&self.pool)
                    .await?;
                Ok(QueryOutput::Affected(result.rows_affected()))
            }
            Statement::DuplicateIds { table, since } => {
                let rows = sqlx::query(&format!(
                    r#"
                    SELECT cycle_id,
                           COUNT(*) AS copies,
                           ARRAY_AGG(is_completed ORDER BY last_updated) AS completion_flags,
                           ARRAY_AGG(last_updated ORDER BY last_updated) AS last_updated
                      FROM {}
                     WHERE $1::timestamptz IS NULL OR start_time >= $1
                     GROUP BY cycle_id
                    HAVING COUNT(*) > 1
                     ORDER BY copies DESC, cycle_id
                    "#,
                    table.quoted()
                ))
                .bind(since)
                .fetch_all(&self.pool)
                .await?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let copies: i64 = row.try_get("copies")?;
                    out.push(DuplicateId {
                        cycle_id: row.try_get("cycle_id")?,
                        copies: copies.max(0) as u64,
                        completion_flags: row.try_get("completion_flags")?,
                        last_updated: row.try_get("last_updated")?,
                    });
                }
                Ok(QueryOutput::Duplicates(out))
            }
            Statement::CountRows { table, since } => {
                let count: i64 = sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM {} WHERE $1::timestamptz IS NULL OR start_time >= $1",
                    table.quoted()
                ))
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
                Ok(QueryOutput::Count(count.max(0) as u64))
            }
            Statement::CreateDeduplicatedCopy { source, target } => {
                let mut tx = self.pool.begin().await?;
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", target.quoted()))
                    .execute(&mut *tx)
                    .await?;
                let columns = CYCLE_COLUMNS.join(", ");
                let result = sqlx::query(&format!(
                    r#"
                    CREATE TABLE {target} AS
                    SELECT {columns} FROM (
                        SELECT *, ROW_NUMBER() OVER (
                            PARTITION BY cycle_id
                            ORDER BY last_updated DESC, is_completed DESC
                        ) AS rn
                          FROM {source}
                    ) ranked
                     WHERE rn = 1
                    "#,
                    target = target.quoted(),
                    source = source.quoted(),
                ))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(QueryOutput::Affected(result.rows_affected()))
            }
        }
    }

    async fn bulk_insert(&self, table: &TableName, rows: &[CycleRecord]) -> Result<u64, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_rows(&mut tx, table, rows).await?;
        tx.commit().await?;
        debug!(table = %table, inserted, "appended rows");
        Ok(inserted)
    }

    async fn bulk_load(
        &self,
        rows: &[CycleRecord],
        target: &TableName,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        if mode == WriteMode::Truncate {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", target.quoted()))
                .execute(&mut *tx)
                .await?;
        }
        create_table_if_missing(&mut tx, target).await?;
        let loaded = insert_rows(&mut tx, target, rows).await?;
        tx.commit().await?;
        debug!(table = %target, loaded, ?mode, "loaded rows");
        Ok(loaded)
    }

    async fn merge_into(&self, target: &TableName, source: &TableName, key: &str) -> Result<u64, WarehouseError> {
        if key != KEY_COLUMN {
            return Err(WarehouseError::InvalidMergeKey(key.to_string()));
        }
        let result = sqlx::query(&merge_sql(target, source))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn drop_table(&self, table: &TableName) -> Result<(), WarehouseError> {
        sqlx::query(&format!("DROP TABLE {}", table.quoted()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename_table(&self, from: &TableName, to: &TableName) -> Result<(), WarehouseError> {
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", from.quoted(), to.quoted()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
