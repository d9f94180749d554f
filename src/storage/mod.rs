//! Detection record persistence.
//!
//! One logical table of [`DetectionRecord`]s, two write policies:
//!
//! - `Upsert`: at most one current record per chamber; a write replaces the
//!   previous one atomically (last committed write wins).
//! - `Append`: every write inserts a new record with a fresh surrogate id,
//!   preserving history.
//!
//! Ordering is by a monotonic write sequence kept by the store, never by
//! wall-clock alone.

mod memory;
mod sqlite;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{InspectError, Result};
use crate::record::{DetectionRecord, NewRecord};

pub use memory::InMemoryDetectionStore;
pub use sqlite::SqliteDetectionStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Upsert,
    #[default]
    Append,
}

impl FromStr for WriteMode {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(WriteMode::Upsert),
            "append" => Ok(WriteMode::Append),
            other => Err(InspectError::Validation(format!(
                "store mode must be 'upsert' or 'append', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteMode::Upsert => "upsert",
            WriteMode::Append => "append",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChamberFilter {
    Exact(String),
    /// Case-sensitive literal substring; empty matches everything.
    Contains(String),
}

impl ChamberFilter {
    pub fn matches(&self, chamber_id: &str) -> bool {
        match self {
            ChamberFilter::Exact(id) => chamber_id == id,
            ChamberFilter::Contains(needle) => chamber_id.contains(needle.as_str()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub chamber: Option<ChamberFilter>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn exact(chamber_id: impl Into<String>) -> Self {
        Self {
            chamber: Some(ChamberFilter::Exact(chamber_id.into())),
            limit: None,
        }
    }

    pub fn contains(substring: impl Into<String>) -> Self {
        Self {
            chamber: Some(ChamberFilter::Contains(substring.into())),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &DetectionRecord) -> bool {
        self.chamber
            .as_ref()
            .map_or(true, |f| f.matches(&record.chamber_id))
    }
}

/// Result of a per-chamber lookup, shaped by the store's mode.
#[derive(Clone, Debug, PartialEq)]
pub enum ChamberRecords {
    /// Upsert mode: the single current record.
    Current(DetectionRecord),
    /// Append mode: every record for the chamber, newest first.
    History(Vec<DetectionRecord>),
}

impl ChamberRecords {
    pub fn latest(&self) -> Option<&DetectionRecord> {
        match self {
            ChamberRecords::Current(record) => Some(record),
            ChamberRecords::History(records) => records.first(),
        }
    }

    pub fn into_vec(self) -> Vec<DetectionRecord> {
        match self {
            ChamberRecords::Current(record) => vec![record],
            ChamberRecords::History(records) => records,
        }
    }

    pub(crate) fn shaped(mode: WriteMode, mut records: Vec<DetectionRecord>, chamber_id: &str) -> Result<Self> {
        if records.is_empty() {
            return Err(InspectError::NotFound(format!(
                "no record for chamber '{chamber_id}'"
            )));
        }
        Ok(match mode {
            WriteMode::Upsert => ChamberRecords::Current(records.swap_remove(0)),
            WriteMode::Append => ChamberRecords::History(records),
        })
    }
}

/// Identifies the single record a delete removes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKey {
    /// Newest record for the chamber (the only one in upsert mode).
    Chamber(String),
    /// Surrogate id.
    Id(i64),
}

impl RecordKey {
    /// Interpret an external key the way the store's mode keys records:
    /// chamber ids in upsert mode, surrogate ids in append mode.
    pub fn parse_for(mode: WriteMode, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InspectError::Validation("record key must not be blank".into()));
        }
        match mode {
            WriteMode::Upsert => Ok(RecordKey::Chamber(raw.to_string())),
            WriteMode::Append => raw.parse::<i64>().map(RecordKey::Id).map_err(|_| {
                InspectError::Validation(format!("record id must be an integer, got '{raw}'"))
            }),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Chamber(id) => write!(f, "chamber '{id}'"),
            RecordKey::Id(id) => write!(f, "record #{id}"),
        }
    }
}

/// A store only accepts writes in the mode it was opened with; mixing modes
/// would leave several "current" records for one chamber.
pub(crate) fn check_write_mode(store: WriteMode, requested: WriteMode) -> Result<()> {
    if store == requested {
        return Ok(());
    }
    Err(InspectError::Validation(format!(
        "store is in {store} mode, refusing {requested} write"
    )))
}

/// Persistence seam for detection records.
///
/// Implementations serialize writes internally; every method takes `&self`
/// so one store can be shared across sessions behind an `Arc`.
pub trait DetectionStore: Send + Sync {
    /// Mode used for lookups and key interpretation.
    fn mode(&self) -> WriteMode;

    /// Persist a completed record. Either the whole record is committed or nothing is.
    /// `Validation` when `mode` is not the store's own mode.
    fn write(&self, record: NewRecord, mode: WriteMode) -> Result<DetectionRecord>;

    /// Records for one chamber (exact match). `NotFound` when there are none.
    fn get(&self, chamber_id: &str) -> Result<ChamberRecords>;

    fn get_by_id(&self, id: i64) -> Result<DetectionRecord>;

    /// Matching records, newest first.
    fn list(&self, filter: &RecordFilter) -> Result<Vec<DetectionRecord>>;

    /// Remove exactly one record and return it. `NotFound` leaves the store unchanged.
    fn delete(&self, key: &RecordKey) -> Result<DetectionRecord>;

    fn count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mode_parses_and_displays() {
        assert_eq!("UPSERT".parse::<WriteMode>().unwrap(), WriteMode::Upsert);
        assert_eq!("append".parse::<WriteMode>().unwrap(), WriteMode::Append);
        assert!("replace".parse::<WriteMode>().is_err());
        assert_eq!(WriteMode::Upsert.to_string(), "upsert");
        assert_eq!(WriteMode::default(), WriteMode::Append);
    }

    #[test]
    fn record_key_follows_mode() {
        assert_eq!(
            RecordKey::parse_for(WriteMode::Upsert, "12").unwrap(),
            RecordKey::Chamber("12".into())
        );
        assert_eq!(
            RecordKey::parse_for(WriteMode::Append, "12").unwrap(),
            RecordKey::Id(12)
        );
        assert!(matches!(
            RecordKey::parse_for(WriteMode::Append, "A1"),
            Err(InspectError::Validation(_))
        ));
        assert!(RecordKey::parse_for(WriteMode::Upsert, " ").is_err());
    }

    #[test]
    fn contains_filter_is_case_sensitive() {
        let f = ChamberFilter::Contains("a1".into());
        assert!(!f.matches("A1-01"));
        assert!(ChamberFilter::Contains(String::new()).matches("anything"));
        assert!(ChamberFilter::Exact("B2".into()).matches("B2"));
        assert!(!ChamberFilter::Exact("B2".into()).matches("B20"));
    }
}
