//! Core domain model and identity rules for cyclesync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cyclesync-core";

/// Name of the key column in every warehouse table holding cycle records.
pub const KEY_COLUMN: &str = "cycle_id";

/// Warehouse column order for [`CycleRecord`]. Storage backends and report
/// writers share this so every table they touch has the same shape.
pub const CYCLE_COLUMNS: [&str; 18] = [
    "cycle_id",
    "start_time",
    "end_time",
    "duration_minutes",
    "device_name",
    "formula_name",
    "washer",
    "customer",
    "weight",
    "dose_a",
    "dose_b",
    "dose_c",
    "dose_d",
    "additive_e",
    "excess_time_minutes",
    "idle_time_minutes",
    "is_completed",
    "last_updated",
];

const CYCLE_ID_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One scraped or exported line, cells in source column order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(Vec<String>);

impl RawRow {
    pub fn new<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(cells.into_iter().map(Into::into).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cell text at `index`, or `""` past the end of the row.
    pub fn cell(&self, index: usize) -> &str {
        self.0.get(index).map(String::as_str).unwrap_or_default()
    }

    pub fn cells(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for RawRow {
    fn from(cells: Vec<String>) -> Self {
        Self(cells)
    }
}

/// Where a batch of raw rows came from. Column positions and the datetime
/// range grammar differ per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Rows read off the live cycle table (`... - not ended` / `... - MMM:SS`).
    LiveScrape,
    /// Rows from the CSV export (`... - HH:MM:SS`).
    CsvExport,
}

impl SourceFormat {
    pub fn min_columns(self) -> usize {
        match self {
            Self::LiveScrape => 14,
            Self::CsvExport => 20,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LiveScrape => "live_scrape",
            Self::CsvExport => "csv_export",
        }
    }
}

/// Canonical persisted wash cycle.
///
/// Records are created fresh on every run and never mutated afterwards; an
/// update is a new record that shares its `id` with a stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    #[serde(rename = "cycle_id")]
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<f64>,
    pub device_name: Option<String>,
    pub formula_name: Option<String>,
    pub washer: Option<String>,
    pub customer: Option<String>,
    pub weight: Option<f64>,
    pub dose_a: Option<f64>,
    pub dose_b: Option<f64>,
    pub dose_c: Option<f64>,
    pub dose_d: Option<f64>,
    pub additive_e: Option<f64>,
    pub excess_time_minutes: Option<f64>,
    pub idle_time_minutes: Option<f64>,
    pub is_completed: bool,
    pub last_updated: DateTime<Utc>,
}

/// Outcome of comparing one incoming record against the store snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

/// Replace every character outside `[A-Za-z0-9]` with `_`.
pub fn sanitize_device_name(device: &str) -> String {
    device
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Deterministic cycle key: `YYYYMMDD_HHMMSS_<sanitized device>`.
///
/// Second resolution is intentional; overlapping fetch windows that see the
/// same physical cycle must produce the same key.
pub fn build_cycle_id(start_time: Option<DateTime<Utc>>, device_name: Option<&str>) -> Option<String> {
    let start_time = start_time?;
    let device = device_name.map(str::trim).filter(|d| !d.is_empty())?;
    Some(format!(
        "{}_{}",
        start_time.format(CYCLE_ID_TIME_FORMAT),
        sanitize_device_name(device)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 26, 8, 4, 52).single().unwrap()
    }

    #[test]
    fn cycle_id_is_stable_across_calls() {
        let a = build_cycle_id(Some(start()), Some("Washer #3 (left)"));
        let b = build_cycle_id(Some(start()), Some("Washer #3 (left)"));
        assert_eq!(a, b);
        assert_eq!(a.as_deref(), Some("20250726_080452_Washer__3__left_"));
    }

    #[test]
    fn cycle_id_requires_both_inputs() {
        assert_eq!(build_cycle_id(None, Some("W1")), None);
        assert_eq!(build_cycle_id(Some(start()), None), None);
        assert_eq!(build_cycle_id(Some(start()), Some("   ")), None);
    }

    #[test]
    fn sanitize_replaces_non_ascii_characters() {
        assert_eq!(sanitize_device_name(" Lavadora-Ñ 2 "), "Lavadora___2");
        assert_eq!(sanitize_device_name("abc123"), "abc123");
    }

    #[test]
    fn raw_row_cell_past_end_is_empty() {
        let row = RawRow::new(["a", "b"]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.cell(1), "b");
        assert_eq!(row.cell(7), "");
    }

    #[test]
    fn record_serializes_key_as_cycle_id() {
        let record = CycleRecord {
            id: "20250726_080452_W1".into(),
            start_time: start(),
            end_time: None,
            duration_minutes: None,
            device_name: Some("W1".into()),
            formula_name: None,
            washer: None,
            customer: None,
            weight: None,
            dose_a: None,
            dose_b: None,
            dose_c: None,
            dose_d: None,
            additive_e: None,
            excess_time_minutes: None,
            idle_time_minutes: None,
            is_completed: false,
            last_updated: start(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value[KEY_COLUMN], "20250726_080452_W1");
        assert_eq!(value.as_object().unwrap().len(), CYCLE_COLUMNS.len());
    }
}
