//! Reduction of a detection list into per-category fastener counts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::error::InspectError;

pub const MISSING_CLASS_ID: u32 = 0;
pub const GOOD_CLASS_ID: u32 = 1;

/// Semantic label a class id maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Missing,
    Good,
    Other,
}

impl Category {
    /// Fixed class table: 0 is a missing fastener, 1 a good one, anything else `Other`.
    pub fn for_class(class_id: u32) -> Self {
        match class_id {
            MISSING_CLASS_ID => Category::Missing,
            GOOD_CLASS_ID => Category::Good,
            _ => Category::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Missing => "missing",
            Category::Good => "good",
            Category::Other => "other",
        }
    }
}

/// What to do with class ids outside the fixed table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownClassPolicy {
    /// Tally them under `other`, so totals always equal the input length.
    #[default]
    Other,
    Ignore,
}

impl FromStr for UnknownClassPolicy {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "other" => Ok(UnknownClassPolicy::Other),
            "ignore" => Ok(UnknownClassPolicy::Ignore),
            other => Err(InspectError::Validation(format!(
                "unknown class policy must be 'other' or 'ignore', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for UnknownClassPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnknownClassPolicy::Other => "other",
            UnknownClassPolicy::Ignore => "ignore",
        })
    }
}

/// Per-category fastener counts for one chamber image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub missing: u64,
    pub good: u64,
    pub other: u64,
}

impl Counts {
    pub fn new(missing: u64, good: u64, other: u64) -> Self {
        Self {
            missing,
            good,
            other,
        }
    }

    pub fn total(&self) -> u64 {
        self.missing + self.good + self.other
    }

    pub fn get(&self, category: Category) -> u64 {
        match category {
            Category::Missing => self.missing,
            Category::Good => self.good,
            Category::Other => self.other,
        }
    }

    /// Label-keyed view (`missing`, `good`, `other`).
    pub fn by_label(&self) -> BTreeMap<&'static str, u64> {
        [Category::Missing, Category::Good, Category::Other]
            .into_iter()
            .map(|c| (c.label(), self.get(c)))
            .collect()
    }

    fn bump(&mut self, category: Category) {
        match category {
            Category::Missing => self.missing += 1,
            Category::Good => self.good += 1,
            Category::Other => self.other += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResultAggregator {
    policy: UnknownClassPolicy,
}

impl ResultAggregator {
    pub fn new(policy: UnknownClassPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> UnknownClassPolicy {
        self.policy
    }

    /// Multiset tally over class ids; input order does not matter.
    pub fn aggregate(&self, detections: &[Detection]) -> Counts {
        let mut counts = Counts::default();
        for detection in detections {
            let category = Category::for_class(detection.class_id);
            if category == Category::Other && self.policy == UnknownClassPolicy::Ignore {
                continue;
            }
            counts.bump(category);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn dets(classes: &[u32]) -> Vec<Detection> {
        classes
            .iter()
            .map(|&c| Detection::new(c, 0.9, BoundingBox::new(0.0, 0.0, 1.0, 1.0)))
            .collect()
    }

    #[test]
    fn tallies_missing_and_good() {
        let counts = ResultAggregator::default().aggregate(&dets(&[0, 1, 1]));
        assert_eq!(counts, Counts::new(1, 2, 0));
    }

    #[test]
    fn unknown_classes_land_in_other_by_default() {
        let input = dets(&[0, 7, 1, 3, 3]);
        let counts = ResultAggregator::default().aggregate(&input);
        assert_eq!(counts, Counts::new(1, 1, 3));
        assert_eq!(counts.total(), input.len() as u64);
    }

    #[test]
    fn ignore_policy_drops_unknown_classes() {
        let counts = ResultAggregator::new(UnknownClassPolicy::Ignore).aggregate(&dets(&[0, 7, 1]));
        assert_eq!(counts, Counts::new(1, 1, 0));
    }

    #[test]
    fn order_does_not_change_counts() {
        let agg = ResultAggregator::default();
        let forward = dets(&[0, 1, 5, 1, 0, 0]);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(agg.aggregate(&forward), agg.aggregate(&reversed));
    }

    #[test]
    fn totals_match_input_length() {
        let agg = ResultAggregator::default();
        for n in 0..40u32 {
            let classes: Vec<u32> = (0..n).map(|i| (i * 7 + n) % 5).collect();
            let counts = agg.aggregate(&dets(&classes));
            assert_eq!(counts.total(), n as u64);
        }
    }

    #[test]
    fn label_view_and_policy_parsing() {
        let counts = Counts::new(2, 5, 1);
        let labels = counts.by_label();
        assert_eq!(labels["missing"], 2);
        assert_eq!(labels["good"], 5);
        assert_eq!(labels["other"], 1);

        assert_eq!("Ignore".parse::<UnknownClassPolicy>().unwrap(), UnknownClassPolicy::Ignore);
        assert!("drop".parse::<UnknownClassPolicy>().is_err());
    }
}
