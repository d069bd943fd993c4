//! Warehouse access, raw batch archive and monitoring push for cyclesync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyclesync_core::{CycleRecord, RawRow, SourceFormat};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{InMemoryWarehouse, Operation};
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "cyclesync-storage";

const MAX_TABLE_NAME_LEN: usize = 63;

/// A validated warehouse table identifier.
///
/// Only `[A-Za-z_][A-Za-z0-9_]*` is accepted, so a name can be quoted into a
/// statement without escaping. Row values never travel this way; they are
/// always bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: impl Into<String>) -> Result<Self, WarehouseError> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_head || !valid_tail || name.len() > MAX_TABLE_NAME_LEN {
            return Err(WarehouseError::InvalidTableName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier for statement text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    pub fn with_suffix(&self, suffix: &str) -> Result<Self, WarehouseError> {
        Self::parse(format!("{}_{}", self.0, suffix))
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = WarehouseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    /// Replace the target's contents, creating it when missing.
    Truncate,
}

/// What a backend guarantees about rows it has only just accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarehouseCapabilities {
    /// Rows written moments ago can be updated or deleted straight away.
    pub supports_immediate_row_mutation: bool,
}

/// Typed statements; the only query surface the pipeline uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `(cycle_id, is_completed)` for rows whose start is at or after `since`;
    /// `None` reads the whole table.
    CompletionSince { table: TableName, since: Option<DateTime<Utc>> },
    /// `(cycle_id, is_completed)` for stored rows whose id is in `ids`.
    CompletionForIds { table: TableName, ids: Vec<String> },
    DeleteByIds { table: TableName, ids: Vec<String> },
    /// Ids stored more than once, most copies first.
    DuplicateIds { table: TableName, since: Option<DateTime<Utc>> },
    CountRows { table: TableName, since: Option<DateTime<Utc>> },
    /// Create or replace `target` with one row per id from `source`: latest
    /// `last_updated` first, completed rows preferred on ties.
    CreateDeduplicatedCopy { source: TableName, target: TableName },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateId {
    pub cycle_id: String,
    pub copies: u64,
    pub completion_flags: Vec<bool>,
    pub last_updated: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Completion(Vec<(String, bool)>),
    Duplicates(Vec<DuplicateId>),
    Count(u64),
    Affected(u64),
}

impl QueryOutput {
    pub fn into_completion(self) -> Result<Vec<(String, bool)>, WarehouseError> {
        match self {
            Self::Completion(rows) => Ok(rows),
            other => Err(WarehouseError::UnexpectedOutput(format!("{other:?}"))),
        }
    }

    pub fn into_duplicates(self) -> Result<Vec<DuplicateId>, WarehouseError> {
        match self {
            Self::Duplicates(rows) => Ok(rows),
            other => Err(WarehouseError::UnexpectedOutput(format!("{other:?}"))),
        }
    }

    pub fn into_count(self) -> Result<u64, WarehouseError> {
        match self {
            Self::Count(n) | Self::Affected(n) => Ok(n),
            other => Err(WarehouseError::UnexpectedOutput(format!("{other:?}"))),
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("unsupported merge key {0:?}")]
    InvalidMergeKey(String),
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("{count} row(s) in {table} are still in the recent-write buffer and cannot be modified")]
    RecentWriteLocked { table: String, count: usize },
    #[error("merge source {table} holds id {cycle_id} more than once")]
    AmbiguousMergeSource { table: String, cycle_id: String },
    #[error("unexpected statement output: {0}")]
    UnexpectedOutput(String),
    #[error("{operation} failed: {message}")]
    Backend { operation: &'static str, message: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// A remote, append-biased keyed table store.
///
/// Implementations expose only these operations; in particular nothing here
/// promises that freshly appended rows can be mutated unless
/// [`WarehouseCapabilities::supports_immediate_row_mutation`] says so.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> WarehouseCapabilities;

    /// Create `table` when missing. Safe to call before every run.
    async fn ensure_table(&self, table: &TableName) -> Result<(), WarehouseError>;

    async fn query(&self, statement: &Statement) -> Result<QueryOutput, WarehouseError>;

    /// Lightweight append. Rows may sit in a recent-write buffer afterwards.
    async fn bulk_insert(&self, table: &TableName, rows: &[CycleRecord]) -> Result<u64, WarehouseError>;

    /// Load-job style write; creates `target` when missing.
    async fn bulk_load(
        &self,
        rows: &[CycleRecord],
        target: &TableName,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError>;

    /// Update-if-matched, insert-if-not from `source` into `target` on `key`.
    async fn merge_into(&self, target: &TableName, source: &TableName, key: &str) -> Result<u64, WarehouseError>;

    async fn drop_table(&self, table: &TableName) -> Result<(), WarehouseError>;

    async fn rename_table(&self, from: &TableName, to: &TableName) -> Result<(), WarehouseError>;
}

/// One line of the archive index: a harvest and the stored rows it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub fetched_at: DateTime<Utc>,
    pub format: SourceFormat,
    pub row_count: usize,
    pub sha256: String,
    /// Path of the stored rows, relative to the archive root.
    pub object: PathBuf,
    /// The same rows were already stored by an earlier harvest.
    pub reused: bool,
}

/// Raw rows of every run, kept once per distinct content under
/// `rows/<aa>/<sha256>.json`. `index.jsonl` records each harvest, so an
/// unchanged cycle table fetched every hour costs one index line per run.
#[derive(Debug, Clone)]
pub struct RawBatchArchive {
    root: PathBuf,
}

impl RawBatchArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.jsonl")
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn object_path(sha256: &str) -> PathBuf {
        PathBuf::from("rows")
            .join(&sha256[..2])
            .join(format!("{sha256}.json"))
    }

    pub async fn store_rows(
        &self,
        fetched_at: DateTime<Utc>,
        format: SourceFormat,
        rows: &[RawRow],
    ) -> anyhow::Result<ArchiveEntry> {
        let bytes = serde_json::to_vec(rows).context("serializing raw rows")?;
        let sha256 = Self::content_hash(&bytes);
        let object = Self::object_path(&sha256);
        let reused = self.write_object(&object, &bytes).await?;
        let entry = ArchiveEntry {
            fetched_at,
            format,
            row_count: rows.len(),
            sha256,
            object,
            reused,
        };
        self.append_index(&entry).await?;
        Ok(entry)
    }

    /// Every recorded harvest, oldest first. A missing index is empty.
    pub async fn entries(&self) -> anyhow::Result<Vec<ArchiveEntry>> {
        let path = self.index_path();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| format!("parsing {} line {}", path.display(), n + 1))
            })
            .collect()
    }

    pub async fn load_rows(&self, entry: &ArchiveEntry) -> anyhow::Result<Vec<RawRow>> {
        let path = self.root.join(&entry.object);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    /// Returns `true` when the object was already present.
    async fn write_object(&self, object: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
        let path = self.root.join(object);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(true);
        }
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        // Readers never see a half-written object.
        let partial = dir.join(format!(".{}.partial", Uuid::new_v4().simple()));
        fs::write(&partial, bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(true);
            }
            return Err(err).with_context(|| format!("moving {} into place", path.display()));
        }
        Ok(false)
    }

    async fn append_index(&self, entry: &ArchiveEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry).context("serializing archive index entry")?;
        line.push(b'\n');
        let path = self.index_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Up,
    Down,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("push request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from monitor push")]
    HttpStatus { status: u16 },
}

/// Receives exactly one outcome message per run.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn notify(&self, status: MonitorStatus, message: &str) -> Result<(), NotifyError>;
}

/// Used when no push URL is configured.
#[derive(Debug, Default)]
pub struct LogOnlySink;

#[async_trait]
impl MonitorSink for LogOnlySink {
    async fn notify(&self, status: MonitorStatus, message: &str) -> Result<(), NotifyError> {
        warn!(status = status.as_str(), message, "no monitor push url configured");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Uptime-Kuma style push monitor: `GET <url>?status=up|down&msg=<text>`.
#[derive(Debug)]
pub struct PushNotifier {
    client: reqwest::Client,
    push_url: String,
    backoff: BackoffPolicy,
}

impl PushNotifier {
    pub fn new(push_url: impl Into<String>, timeout: Duration, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            push_url: push_url.into(),
            backoff,
        })
    }
}

#[async_trait]
impl MonitorSink for PushNotifier {
    async fn notify(&self, status: MonitorStatus, message: &str) -> Result<(), NotifyError> {
        let span = info_span!("monitor_push", status = status.as_str());
        async {
            let mut attempt = 0;
            loop {
                let result = self
                    .client
                    .get(&self.push_url)
                    .query(&[("status", status.as_str()), ("msg", message)])
                    .send()
                    .await;

                let exhausted = attempt >= self.backoff.max_retries;
                let reason = match result {
                    Ok(resp) if resp.status().is_success() => return Ok(()),
                    Ok(resp) => {
                        let code = resp.status();
                        if exhausted || classify_status(code) == RetryDisposition::NonRetryable {
                            return Err(NotifyError::HttpStatus { status: code.as_u16() });
                        }
                        code.to_string()
                    }
                    Err(err) => {
                        if exhausted || classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                            return Err(NotifyError::Request(err));
                        }
                        err.to_string()
                    }
                };
                warn!(attempt, %reason, "monitor push failed; retrying");
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}
