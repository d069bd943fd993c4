//! Per-run report directory: the run summary, a Parquet copy of the rows
//! the run wrote, and a manifest with a checksum for each file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use cyclesync_core::{CycleRecord, CYCLE_COLUMNS};
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::coordinator::RunSummary;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const CYCLES_FILE: &str = "snapshots/cycles.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Parquet footer key carrying the run id.
pub const RUN_ID_METADATA_KEY: &str = "cyclesync.run_id";

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub run_id: Uuid,
    pub files: Vec<ReportFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportFile {
    /// Relative to the run directory.
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    /// Record count for data files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
}

/// Write `<reports_root>/<run_id>/` for a finished run and return that
/// directory. Checksums are taken from the bytes handed to the filesystem.
pub async fn write_run_report(
    reports_root: &Path,
    summary: &RunSummary,
    written: &[CycleRecord],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let cycles = encode_cycles_parquet(written, summary.run_id)?;

    let files = vec![
        put(&run_dir, SUMMARY_FILE, &summary_json, None).await?,
        put(&run_dir, CYCLES_FILE, &cycles, Some(written.len())).await?,
    ];
    let manifest = ReportManifest {
        run_id: summary.run_id,
        files,
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    put(&run_dir, MANIFEST_FILE, &manifest_json, None).await?;
    Ok(run_dir)
}

async fn put(run_dir: &Path, relative: &str, bytes: &[u8], rows: Option<usize>) -> Result<ReportFile> {
    let path = run_dir.join(relative);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(ReportFile {
        path: relative.to_string(),
        sha256: hex::encode(Sha256::digest(bytes)),
        bytes: bytes.len() as u64,
        rows,
    })
}

fn cycles_schema() -> Arc<Schema> {
    let fields = CYCLE_COLUMNS
        .iter()
        .map(|name| {
            let (data_type, nullable) = match *name {
                "cycle_id" | "start_time" | "last_updated" => (DataType::Utf8, false),
                "is_completed" => (DataType::Boolean, false),
                "end_time" | "device_name" | "formula_name" | "washer" | "customer" => (DataType::Utf8, true),
                _ => (DataType::Float64, true),
            };
            ArrowField::new(*name, data_type, nullable)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

fn cycles_batch(records: &[CycleRecord]) -> Result<RecordBatch> {
    let text = |f: fn(&CycleRecord) -> Option<&str>| -> ArrayRef {
        Arc::new(records.iter().map(f).collect::<StringArray>())
    };
    let instant = |f: fn(&CycleRecord) -> Option<DateTime<Utc>>| -> ArrayRef {
        Arc::new(
            records
                .iter()
                .map(|r| f(r).map(|t| t.to_rfc3339()))
                .collect::<StringArray>(),
        )
    };
    let number = |f: fn(&CycleRecord) -> Option<f64>| -> ArrayRef {
        Arc::new(records.iter().map(f).collect::<Float64Array>())
    };

    // Same order as CYCLE_COLUMNS.
    let columns: Vec<ArrayRef> = vec![
        text(|r| Some(r.id.as_str())),
        instant(|r| Some(r.start_time)),
        instant(|r| r.end_time),
        number(|r| r.duration_minutes),
        text(|r| r.device_name.as_deref()),
        text(|r| r.formula_name.as_deref()),
        text(|r| r.washer.as_deref()),
        text(|r| r.customer.as_deref()),
        number(|r| r.weight),
        number(|r| r.dose_a),
        number(|r| r.dose_b),
        number(|r| r.dose_c),
        number(|r| r.dose_d),
        number(|r| r.additive_e),
        number(|r| r.excess_time_minutes),
        number(|r| r.idle_time_minutes),
        Arc::new(records.iter().map(|r| Some(r.is_completed)).collect::<BooleanArray>()),
        instant(|r| Some(r.last_updated)),
    ];
    RecordBatch::try_new(cycles_schema(), columns).context("building cycles record batch")
}

/// Parquet bytes for `records`, tagged with the run that wrote them.
fn encode_cycles_parquet(records: &[CycleRecord], run_id: Uuid) -> Result<Vec<u8>> {
    let batch = cycles_batch(records)?;
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![KeyValue::new(
            RUN_ID_METADATA_KEY.to_string(),
            run_id.to_string(),
        )]))
        .build();
    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), Some(props)).context("opening parquet writer")?;
    writer.write(&batch).context("encoding cycles")?;
    writer.close().context("finishing parquet footer")?;
    Ok(buf)
}
