//! Raw row sources, field parsers and the row → canonical record transformer.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Timelike, Utc};
use cyclesync_core::{build_cycle_id, CycleRecord, RawRow, SourceFormat};
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const CRATE_NAME: &str = "cyclesync-adapters";

const NOT_ENDED_SENTINEL: &str = "not ended";
const TOTALS_MARKER: &str = "Cycles Totals:";
const PLACEHOLDER: &str = "-";
const RANGE_SEPARATOR: &str = " - ";
const START_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
const CYCLE_TABLE_ROWS: &str = "#cycletable tbody tr";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Why a raw row could not become a record. The run continues either way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row has {found} columns, expected at least {expected}")]
    TooFewColumns { found: usize, expected: usize },
    #[error("could not parse datetime range {0:?}")]
    UnparseableDatetime(String),
    #[error("could not build cycle id for device {0:?}")]
    MissingIdentity(String),
}

/// Result of transforming one raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Record(CycleRecord),
    /// Export totals line; dropped without counting as an error.
    Summary,
    Rejected(RowError),
}

#[derive(Debug, Clone, Default)]
pub struct TransformReport {
    pub records: Vec<CycleRecord>,
    /// Zero-based input position and reason for each dropped row.
    pub rejected: Vec<(usize, RowError)>,
    pub summary_rows: usize,
}

/// A finite batch of raw rows handed to the pipeline by a harvesting collaborator.
pub trait RowSource: Send + Sync {
    fn label(&self) -> String;
    fn format(&self) -> SourceFormat;
    fn read_rows(&self) -> Result<Vec<RawRow>, AdapterError>;
}

/// JSON array of string arrays, as emitted by the browser scrape of the cycle table.
#[derive(Debug, Clone)]
pub struct ScrapedRowsFile {
    path: PathBuf,
}

impl ScrapedRowsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RowSource for ScrapedRowsFile {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::LiveScrape
    }

    fn read_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        let cells: Vec<Vec<String>> = read_json_file(&self.path)?;
        Ok(cells.into_iter().map(RawRow::from).collect())
    }
}

/// A saved copy of the live cycle table page.
#[derive(Debug, Clone)]
pub struct CycleTableHtml {
    path: PathBuf,
}

impl CycleTableHtml {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RowSource for CycleTableHtml {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::LiveScrape
    }

    fn read_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        let html = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        rows_from_cycle_table_html(&html)
    }
}

/// The CSV export download, header row first.
#[derive(Debug, Clone)]
pub struct CsvExportFile {
    path: PathBuf,
}

impl CsvExportFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RowSource for CsvExportFile {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::CsvExport
    }

    fn read_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        let file = fs::File::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        rows_from_csv_reader(file)
    }
}

/// Concatenates several sources of the same format in order, e.g. the
/// "today" and "yesterday" views of the cycle table.
pub struct ChainedSource {
    format: SourceFormat,
    sources: Vec<Box<dyn RowSource>>,
}

impl ChainedSource {
    pub fn new(format: SourceFormat, sources: Vec<Box<dyn RowSource>>) -> Result<Self, AdapterError> {
        if let Some(mismatch) = sources.iter().find(|s| s.format() != format) {
            return Err(AdapterError::Message(format!(
                "source {} is {} but the chain expects {}",
                mismatch.label(),
                mismatch.format().as_str(),
                format.as_str()
            )));
        }
        Ok(Self { format, sources })
    }
}

impl RowSource for ChainedSource {
    fn label(&self) -> String {
        self.sources
            .iter()
            .map(|s| s.label())
            .collect::<Vec<_>>()
            .join("+")
    }

    fn format(&self) -> SourceFormat {
        self.format
    }

    fn read_rows(&self) -> Result<Vec<RawRow>, AdapterError> {
        let mut rows = Vec::new();
        for source in &self.sources {
            rows.extend(source.read_rows()?);
        }
        Ok(rows)
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, AdapterError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?)
}

/// Cell text of every `#cycletable` body row.
pub fn rows_from_cycle_table_html(html: &str) -> Result<Vec<RawRow>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse(CYCLE_TABLE_ROWS).map_err(|e| AdapterError::Message(e.to_string()))?;
    let cell_sel = Selector::parse("td").map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&row_sel)
        .map(|tr| {
            RawRow::new(
                tr.select(&cell_sel)
                    .map(|td| td.text().collect::<String>().trim().to_string()),
            )
        })
        .collect())
}

pub fn rows_from_csv_reader<R: Read>(reader: R) -> Result<Vec<RawRow>, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        rows.push(RawRow::new(record.iter()));
    }
    Ok(rows)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn is_blank(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == PLACEHOLDER
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `"MMM:SS"` → minutes rounded to two decimals. Anything else is absent.
pub fn parse_duration_minutes(text: &str) -> Option<f64> {
    if is_blank(text) {
        return None;
    }
    let (minutes, seconds) = text.trim().split_once(':')?;
    let minutes = minutes.trim().parse::<u32>().ok()?;
    let seconds = seconds.trim().parse::<u32>().ok()?;
    Some(round2(f64::from(minutes) + f64::from(seconds) / 60.0))
}

/// Like [`parse_duration_minutes`] but also accepts `"HH:MM:SS"`.
fn parse_elapsed_minutes(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() != 3 {
        return parse_duration_minutes(text);
    }
    let mut values = [0u32; 3];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part.trim().parse().ok()?;
    }
    let [hours, minutes, seconds] = values;
    Some(round2(
        f64::from(hours) * 60.0 + f64::from(minutes) + f64::from(seconds) / 60.0,
    ))
}

/// First contiguous decimal number in free text, e.g. `"15.5 kg"` → `15.5`.
pub fn parse_numeric_value(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.trim().chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    if current.is_empty() {
        return None;
    }
    current.parse::<f64>().ok()
}

/// Excess time cells carry a bracketed average: `"00:01 [25:59]"`.
pub fn parse_excess_time(text: &str) -> Option<f64> {
    let head = text.trim().split(" [").next().unwrap_or_default();
    parse_duration_minutes(head)
}

/// Idle time, where `"<1"` stands for half a minute.
pub fn parse_idle_time(text: &str) -> Option<f64> {
    if text.trim() == "<1" {
        return Some(0.5);
    }
    parse_duration_minutes(text)
}

/// The four values carried by a datetime-range cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatetimeRange {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<f64>,
    pub is_completed: bool,
}

fn split_range(text: &str) -> Option<(DateTime<Utc>, &str)> {
    let trimmed = text.trim();
    let mut parts = trimmed.split(RANGE_SEPARATOR);
    let start = parts.next()?;
    let end = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let start = NaiveDateTime::parse_from_str(start.trim(), START_FORMAT)
        .ok()?
        .and_utc();
    Some((start, end.trim()))
}

/// Live table form: `"YYYY/MM/DD HH:MM:SS - <elapsed | not ended>"`.
///
/// The end clock time is the start truncated to the minute plus the whole
/// elapsed minutes; seconds are not carried into the end time.
pub fn parse_live_datetime_range(text: &str) -> Option<DatetimeRange> {
    let (start_time, end_part) = split_range(text)?;
    if end_part == NOT_ENDED_SENTINEL {
        return Some(DatetimeRange {
            start_time,
            end_time: None,
            duration_minutes: None,
            is_completed: false,
        });
    }

    let Some(duration) = parse_elapsed_minutes(end_part) else {
        return Some(DatetimeRange {
            start_time,
            end_time: None,
            duration_minutes: None,
            is_completed: false,
        });
    };
    let end_time = start_time
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .and_then(|t| t.checked_add_signed(Duration::try_minutes(duration.trunc() as i64)?))?;
    Some(DatetimeRange {
        start_time,
        end_time: Some(end_time),
        duration_minutes: Some(duration),
        is_completed: true,
    })
}

/// Export form: `"YYYY/MM/DD HH:MM:SS - HH:MM:SS"`, end on the start's date
/// unless it precedes the start, in which case the cycle crossed midnight.
pub fn parse_export_datetime_range(text: &str) -> Option<DatetimeRange> {
    let (start_time, end_part) = split_range(text)?;
    let end_clock = NaiveTime::parse_from_str(end_part, "%H:%M:%S").ok()?;
    let mut end_time = start_time.date_naive().and_time(end_clock).and_utc();
    if end_time < start_time {
        end_time = end_time.checked_add_signed(Duration::try_days(1)?)?;
    }
    let elapsed_seconds = (end_time - start_time).num_seconds();
    Some(DatetimeRange {
        start_time,
        end_time: Some(end_time),
        duration_minutes: Some(round2(elapsed_seconds as f64 / 60.0)),
        is_completed: true,
    })
}

pub fn parse_datetime_range(text: &str, format: SourceFormat) -> Option<DatetimeRange> {
    match format {
        SourceFormat::LiveScrape => parse_live_datetime_range(text),
        SourceFormat::CsvExport => parse_export_datetime_range(text),
    }
}

const DATETIME_COLUMN: usize = 0;
const DEVICE_COLUMN: usize = 1;
const FORMULA_COLUMN: usize = 2;
const WASHER_COLUMN: usize = 3;
const CUSTOMER_COLUMN: usize = 4;
const DURATION_COLUMN: usize = 5;
const WEIGHT_COLUMN: usize = 6;

/// Positions of the measurement cells, which differ between sources.
struct MeasurementColumns {
    doses: [usize; 4],
    additive: usize,
    excess: usize,
    idle: usize,
}

const LIVE_COLUMNS: MeasurementColumns = MeasurementColumns {
    doses: [7, 8, 9, 10],
    additive: 11,
    excess: 12,
    idle: 13,
};

const EXPORT_COLUMNS: MeasurementColumns = MeasurementColumns {
    doses: [11, 12, 13, 14],
    additive: 17,
    excess: 18,
    idle: 19,
};

fn measurement_columns(format: SourceFormat) -> &'static MeasurementColumns {
    match format {
        SourceFormat::LiveScrape => &LIVE_COLUMNS,
        SourceFormat::CsvExport => &EXPORT_COLUMNS,
    }
}

/// Build one canonical record from a raw row.
///
/// Only structure (column count, datetime, identity) can drop a row; every
/// other cell degrades to absent on its own.
pub fn transform_row(row: &RawRow, format: SourceFormat, ingested_at: DateTime<Utc>) -> RowOutcome {
    if format == SourceFormat::CsvExport && row.cell(DATETIME_COLUMN).contains(TOTALS_MARKER) {
        return RowOutcome::Summary;
    }
    if row.len() < format.min_columns() {
        return RowOutcome::Rejected(RowError::TooFewColumns {
            found: row.len(),
            expected: format.min_columns(),
        });
    }

    let datetime_cell = row.cell(DATETIME_COLUMN);
    let Some(range) = parse_datetime_range(datetime_cell, format) else {
        return RowOutcome::Rejected(RowError::UnparseableDatetime(datetime_cell.to_string()));
    };

    let device_name = text_or_none(row.cell(DEVICE_COLUMN));
    let Some(id) = build_cycle_id(Some(range.start_time), device_name.as_deref()) else {
        return RowOutcome::Rejected(RowError::MissingIdentity(row.cell(DEVICE_COLUMN).to_string()));
    };

    let columns = measurement_columns(format);
    let dose = |i: usize| parse_numeric_value(row.cell(columns.doses[i]));

    RowOutcome::Record(CycleRecord {
        id,
        start_time: range.start_time,
        end_time: range.end_time,
        duration_minutes: range
            .duration_minutes
            .or_else(|| parse_duration_minutes(row.cell(DURATION_COLUMN))),
        device_name,
        formula_name: text_or_none(row.cell(FORMULA_COLUMN)),
        washer: text_or_none(row.cell(WASHER_COLUMN)),
        customer: text_or_none(row.cell(CUSTOMER_COLUMN)),
        weight: parse_numeric_value(row.cell(WEIGHT_COLUMN)),
        dose_a: dose(0),
        dose_b: dose(1),
        dose_c: dose(2),
        dose_d: dose(3),
        additive_e: parse_numeric_value(row.cell(columns.additive)),
        excess_time_minutes: parse_excess_time(row.cell(columns.excess)),
        idle_time_minutes: parse_idle_time(row.cell(columns.idle)),
        is_completed: range.is_completed,
        last_updated: ingested_at,
    })
}

/// Transform a whole batch, stamping each record with the wall clock at the
/// moment it was built.
pub fn transform_rows(rows: &[RawRow], format: SourceFormat) -> TransformReport {
    let mut report = TransformReport::default();
    for (index, row) in rows.iter().enumerate() {
        match transform_row(row, format, Utc::now()) {
            RowOutcome::Record(record) => report.records.push(record),
            RowOutcome::Summary => report.summary_rows += 1,
            RowOutcome::Rejected(err) => report.rejected.push((index, err)),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    fn live_row(range: &str, device: &str) -> RawRow {
        RawRow::new([
            range, device, "Whites", "W-01", "Hotel Azul", "029:10", "15.5 kg", "4 ml", "2ml", "-",
            "", "3 Oz", "00:01", "<1",
        ])
    }

    #[test]
    fn duration_parser_handles_long_minutes_and_placeholders() {
        assert_eq!(parse_duration_minutes("002:35"), Some(2.58));
        assert_eq!(parse_duration_minutes("125:30"), Some(125.5));
        assert_eq!(parse_duration_minutes("-"), None);
        assert_eq!(parse_duration_minutes(""), None);
        assert_eq!(parse_duration_minutes("ten:05"), None);
        assert_eq!(parse_duration_minutes("1:2:3"), None);
    }

    #[test]
    fn numeric_parser_takes_first_number() {
        assert_eq!(parse_numeric_value("15.5 kg"), Some(15.5));
        assert_eq!(parse_numeric_value("130 lbs"), Some(130.0));
        assert_eq!(parse_numeric_value("25ml then 30ml"), Some(25.0));
        assert_eq!(parse_numeric_value("-"), None);
        assert_eq!(parse_numeric_value(""), None);
        assert_eq!(parse_numeric_value("n/a"), None);
    }

    #[test]
    fn excess_and_idle_quirks() {
        assert_eq!(parse_excess_time("00:01 [25:59]"), Some(0.02));
        assert_eq!(parse_excess_time("-"), None);
        assert_eq!(parse_idle_time("<1"), Some(0.5));
        assert_eq!(parse_idle_time("003:00"), Some(3.0));
    }

    #[test]
    fn export_range_round_trip() {
        let range = parse_export_datetime_range("2025/05/01 04:26:44 - 04:55:54").unwrap();
        assert_eq!(range.start_time, utc(2025, 5, 1, 4, 26, 44));
        assert_eq!(range.end_time, Some(utc(2025, 5, 1, 4, 55, 54)));
        assert_eq!(range.duration_minutes, Some(29.17));
        assert!(range.is_completed);
    }

    #[test]
    fn export_range_crossing_midnight_adds_a_day() {
        let range = parse_export_datetime_range("2025/07/25 23:32:55 - 00:02:06").unwrap();
        assert_eq!(range.end_time, Some(utc(2025, 7, 26, 0, 2, 6)));
        let duration = range.duration_minutes.unwrap();
        assert!(duration > 0.0);
        assert_eq!(duration, 29.18);
    }

    #[test]
    fn invalid_calendar_day_yields_nothing() {
        assert_eq!(parse_export_datetime_range("2025/02/30 10:00:00 - 10:30:00"), None);
        assert_eq!(parse_live_datetime_range("2025/02/30 10:00:00 - not ended"), None);
    }

    #[test]
    fn live_not_ended_sentinel() {
        let range = parse_live_datetime_range("2025/07/26 08:04:52 - not ended").unwrap();
        assert_eq!(range.start_time, utc(2025, 7, 26, 8, 4, 52));
        assert_eq!(range.end_time, None);
        assert_eq!(range.duration_minutes, None);
        assert!(!range.is_completed);
    }

    #[test]
    fn live_duration_adds_whole_minutes_to_truncated_start() {
        let range = parse_live_datetime_range("2025/07/26 08:44:52 - 029:10").unwrap();
        assert_eq!(range.end_time, Some(utc(2025, 7, 26, 9, 13, 0)));
        assert_eq!(range.duration_minutes, Some(29.17));
        assert!(range.is_completed);

        let range = parse_live_datetime_range("2025/07/25 23:32:55 - 00:29:06").unwrap();
        assert_eq!(range.end_time, Some(utc(2025, 7, 26, 0, 1, 0)));
        assert_eq!(range.duration_minutes, Some(29.1));
    }

    #[test]
    fn live_unparseable_end_marker_is_incomplete() {
        let range = parse_live_datetime_range("2025/07/26 08:04:52 - soon").unwrap();
        assert!(!range.is_completed);
        assert_eq!(range.end_time, None);
    }

    #[test]
    fn malformed_ranges_are_absent() {
        assert_eq!(parse_live_datetime_range(""), None);
        assert_eq!(parse_live_datetime_range("2025/07/26 08:04:52"), None);
        assert_eq!(parse_live_datetime_range("a - b - c"), None);
    }

    #[test]
    fn transform_live_row_maps_every_column() {
        let now = utc(2025, 7, 26, 9, 0, 0);
        let row = live_row("2025/07/26 08:04:52 - not ended", "Washer 1");
        let RowOutcome::Record(record) = transform_row(&row, SourceFormat::LiveScrape, now) else {
            panic!("expected a record");
        };
        assert_eq!(record.id, "20250726_080452_Washer_1");
        assert!(!record.is_completed);
        assert_eq!(record.end_time, None);
        // incomplete cycles fall back to the standalone duration cell
        assert_eq!(record.duration_minutes, Some(29.17));
        assert_eq!(record.weight, Some(15.5));
        assert_eq!(record.dose_a, Some(4.0));
        assert_eq!(record.dose_b, Some(2.0));
        assert_eq!(record.dose_c, None);
        assert_eq!(record.dose_d, None);
        assert_eq!(record.additive_e, Some(3.0));
        assert_eq!(record.excess_time_minutes, Some(0.02));
        assert_eq!(record.idle_time_minutes, Some(0.5));
        assert_eq!(record.customer.as_deref(), Some("Hotel Azul"));
        assert_eq!(record.last_updated, now);
    }

    #[test]
    fn transform_drops_structural_failures_only() {
        let now = Utc::now();
        let short = RawRow::new(["2025/07/26 08:04:52 - not ended", "Washer 1", "x", "y", "z"]);
        assert_eq!(
            transform_row(&short, SourceFormat::LiveScrape, now),
            RowOutcome::Rejected(RowError::TooFewColumns { found: 5, expected: 14 })
        );

        let bad_date = live_row("yesterday - not ended", "Washer 1");
        assert!(matches!(
            transform_row(&bad_date, SourceFormat::LiveScrape, now),
            RowOutcome::Rejected(RowError::UnparseableDatetime(_))
        ));

        let no_device = live_row("2025/07/26 08:04:52 - not ended", " ");
        assert!(matches!(
            transform_row(&no_device, SourceFormat::LiveScrape, now),
            RowOutcome::Rejected(RowError::MissingIdentity(_))
        ));
    }

    #[test]
    fn batch_skips_short_row_and_keeps_the_rest() {
        let mut rows: Vec<RawRow> = (0..5)
            .map(|i| live_row(&format!("2025/07/26 08:0{i}:00 - not ended"), "Washer 1"))
            .collect();
        rows[2] = RawRow::new(["2025/07/26 08:02:00 - not ended", "Washer 1", "a", "b", "c"]);

        let report = transform_rows(&rows, SourceFormat::LiveScrape);
        assert_eq!(report.records.len(), 4);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, 2);
        let ids: Vec<_> = report.records.iter().map(|r| r.id.as_str()).collect();
        assert!(!ids.contains(&"20250726_080200_Washer_1"));
    }

    #[test]
    fn totals_row_is_not_an_error() {
        let row = RawRow::new(["Cycles Totals: 12", "", ""]);
        assert_eq!(
            transform_row(&row, SourceFormat::CsvExport, Utc::now()),
            RowOutcome::Summary
        );
        let report = transform_rows(&[row], SourceFormat::CsvExport);
        assert_eq!(report.summary_rows, 1);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn cycle_table_html_rows_are_trimmed_cells() {
        let html = r#"<table id="cycletable"><thead><tr><th>Date</th></tr></thead>
            <tbody><tr><td> 2025/07/26 08:04:52 - not ended </td><td>Washer 1</td></tr>
            <tr><td>2025/07/26 07:00:00 - 030:00</td><td>Washer <b>2</b></td></tr></tbody></table>"#;
        let rows = rows_from_cycle_table_html(html).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cell(0), "2025/07/26 08:04:52 - not ended");
        assert_eq!(rows[1].cell(1), "Washer 2");
    }

    #[test]
    fn chained_source_rejects_mixed_formats() {
        let sources: Vec<Box<dyn RowSource>> = vec![
            Box::new(ScrapedRowsFile::new("today.json")),
            Box::new(CsvExportFile::new("export.csv")),
        ];
        assert!(ChainedSource::new(SourceFormat::LiveScrape, sources).is_err());
    }

    #[test]
    fn scraped_rows_file_reads_string_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("today.json");
        std::fs::write(&path, r#"[["2025/07/26 08:04:52 - not ended","Washer 1"],["x"]]"#).unwrap();
        let rows = ScrapedRowsFile::new(&path).read_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cell(1), "Washer 1");
        assert_eq!(rows[1].len(), 1);
    }
}
