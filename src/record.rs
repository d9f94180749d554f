use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::Counts;
use crate::detect::Detection;
use crate::error::{InspectError, Result};

/// Validated chamber identifier: non-blank, trimmed, no control characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChamberId(String);

impl ChamberId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InspectError::Validation(
                "chamber id is required and must not be blank".into(),
            ));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(InspectError::Validation(
                "chamber id must not contain control characters".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChamberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChamberId {
    type Error = InspectError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ChamberId> for String {
    fn from(id: ChamberId) -> Self {
        id.0
    }
}

/// A completed inspection result, before the store assigns identity and time.
#[derive(Clone, Debug, PartialEq)]
pub struct NewRecord {
    pub chamber_id: ChamberId,
    pub counts: Counts,
    pub raw_detections: Vec<Detection>,
    pub image_ref: Option<String>,
    pub result_image_ref: Option<String>,
}

impl NewRecord {
    pub fn new(chamber_id: ChamberId, counts: Counts, raw_detections: Vec<Detection>) -> Self {
        Self {
            chamber_id,
            counts,
            raw_detections,
            image_ref: None,
            result_image_ref: None,
        }
    }

    pub fn with_images(mut self, image_ref: Option<String>, result_image_ref: Option<String>) -> Self {
        self.image_ref = image_ref;
        self.result_image_ref = result_image_ref;
        self
    }
}

/// A persisted inspection result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Surrogate id assigned by the store.
    pub id: i64,
    /// Monotonic write sequence; defines newest-first ordering.
    pub seq: u64,
    pub chamber_id: String,
    pub timestamp: DateTime<Utc>,
    pub counts: Counts,
    pub raw_detections: Vec<Detection>,
    pub image_ref: Option<String>,
    pub result_image_ref: Option<String>,
}

impl DetectionRecord {
    pub(crate) fn from_new(record: NewRecord, id: i64, seq: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            seq,
            chamber_id: record.chamber_id.into(),
            timestamp,
            counts: record.counts,
            raw_detections: record.raw_detections,
            image_ref: record.image_ref,
            result_image_ref: record.result_image_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chamber_id_rejects_blank_input() {
        for raw in ["", "   ", "\t\n"] {
            assert!(matches!(
                ChamberId::parse(raw),
                Err(InspectError::Validation(_))
            ));
        }
    }

    #[test]
    fn chamber_id_is_trimmed() {
        assert_eq!(ChamberId::parse("  A1-01 ").unwrap().as_str(), "A1-01");
    }

    #[test]
    fn chamber_id_rejects_embedded_newline() {
        assert!(ChamberId::parse("A1\n02").is_err());
    }

    #[test]
    fn chamber_id_deserialization_validates() {
        assert!(serde_json::from_str::<ChamberId>(r#""  ""#).is_err());
        let id: ChamberId = serde_json::from_str(r#""B2""#).unwrap();
        assert_eq!(id.to_string(), "B2");
    }
}
