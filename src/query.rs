//! Search, listing, and CSV export over a [`DetectionStore`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{InspectError, Result};
use crate::record::DetectionRecord;
use crate::storage::{ChamberRecords, DetectionStore, RecordFilter};

/// Header row of every export, in column order.
pub const EXPORT_COLUMNS: [&str; 5] = [
    "chamber_id",
    "missing_count",
    "good_count",
    "other_count",
    "timestamp",
];

pub const EXPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn DetectionStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn DetectionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DetectionStore> {
        &self.store
    }

    /// Records whose chamber id contains `substring` (case-sensitive), newest first.
    /// An empty substring matches every record.
    pub fn search(&self, substring: &str) -> Result<Vec<DetectionRecord>> {
        self.store.list(&RecordFilter::contains(substring))
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<DetectionRecord>> {
        self.store.list(filter)
    }

    pub fn by_chamber(&self, chamber_id: &str) -> Result<ChamberRecords> {
        self.store.get(chamber_id.trim())
    }

    pub fn by_id(&self, id: i64) -> Result<DetectionRecord> {
        self.store.get_by_id(id)
    }

    /// CSV export of the records matching `substring` (all records when `None`).
    pub fn export_matching(&self, substring: Option<&str>) -> Result<Vec<u8>> {
        let records = self.search(substring.unwrap_or(""))?;
        log::debug!("exporting {} record(s)", records.len());
        Ok(export(&records))
    }
}

/// Render records as CSV with a fixed column order. Pure; row order follows input order.
pub fn export(records: &[DetectionRecord]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&EXPORT_COLUMNS.join(","));
    out.push('\n');
    for record in records {
        let fields = [
            csv_field(&record.chamber_id),
            record.counts.missing.to_string(),
            record.counts.good.to_string(),
            record.counts.other.to_string(),
            record.timestamp.format(EXPORT_TIMESTAMP_FORMAT).to_string(),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out.into_bytes()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One data row of an export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportRow {
    pub chamber_id: String,
    pub missing_count: u64,
    pub good_count: u64,
    pub other_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Parse bytes produced by [`export`]. Accepts `\r\n` line endings.
pub fn parse_export(bytes: &[u8]) -> Result<Vec<ExportRow>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| InspectError::Validation(format!("export is not UTF-8: {e}")))?;
    let mut lines = split_records(text)?.into_iter();

    let header = lines
        .next()
        .ok_or_else(|| InspectError::Validation("export is empty".into()))?;
    if header != EXPORT_COLUMNS {
        return Err(InspectError::Validation(format!(
            "unexpected export header: {}",
            header.join(",")
        )));
    }

    let mut rows = Vec::new();
    for (idx, fields) in lines.enumerate() {
        let line_no = idx + 2;
        if fields.len() != EXPORT_COLUMNS.len() {
            return Err(InspectError::Validation(format!(
                "line {line_no}: expected {} fields, got {}",
                EXPORT_COLUMNS.len(),
                fields.len()
            )));
        }
        let count = |i: usize| -> Result<u64> {
            fields[i].parse::<u64>().map_err(|_| {
                InspectError::Validation(format!(
                    "line {line_no}: {} is not a count: '{}'",
                    EXPORT_COLUMNS[i], fields[i]
                ))
            })
        };
        let timestamp = NaiveDateTime::parse_from_str(&fields[4], EXPORT_TIMESTAMP_FORMAT)
            .map_err(|e| InspectError::Validation(format!("line {line_no}: bad timestamp: {e}")))?
            .and_utc();
        rows.push(ExportRow {
            chamber_id: fields[0].clone(),
            missing_count: count(1)?,
            good_count: count(2)?,
            other_count: count(3)?,
            timestamp,
        });
    }
    Ok(rows)
}

/// Split CSV text into records of fields, honoring quoted fields with embedded
/// separators, quotes, and newlines. Blank lines are skipped.
fn split_records(text: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                if !(fields.len() == 1 && fields[0].is_empty()) {
                    records.push(std::mem::take(&mut fields));
                } else {
                    fields.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(InspectError::Validation("unterminated quoted field".into()));
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push(fields);
    }
    Ok(records)
}
