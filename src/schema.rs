//! Plain structured records produced by extraction and aggregation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One extracted (or submitted) nutrient amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientRecord {
    /// Canonical nutrient key.
    pub name: String,
    pub value: f64,
    pub unit: String,
}

impl NutrientRecord {
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// Result of running the extraction pipeline over one label.
#[derive(Debug, Clone, Serialize)]
pub struct LabelScan {
    pub id: String,
    /// SHA-256 over the input lines, newline-joined.
    pub content_hash: String,
    pub line_count: usize,
    /// True when the search was restricted to the nutrition facts block.
    pub table_region: bool,
    /// Values that were found and passed validation, in config order.
    pub records: Vec<NutrientRecord>,
    /// Keys for which no value was found.
    pub missing: Vec<String>,
    /// Values found but outside their plausible range.
    pub rejected: Vec<NutrientRecord>,
    pub scanned_at: DateTime<Utc>,
}

#[cfg(test)]
impl LabelScan {
    pub fn value_of(&self, key: &str) -> Option<f64> {
        self.records.iter().find(|r| r.name == key).map(|r| r.value)
    }
}

/// Accumulated total for one (user, nutrient, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEntry {
    pub nutrient: String,
    pub date: NaiveDate,
    pub value: f64,
    pub unit: String,
}

/// A nutrient value annotated for display.
///
/// `value` is `None` when nothing was found/submitted; `percentage` is `None`
/// when the value is absent or the segment has no usable reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutrientReport {
    pub key: String,
    pub label: String,
    pub value: Option<f64>,
    pub unit: String,
    pub percentage: Option<i64>,
}

/// Today's (or any date's) totals for a user.
#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub user_id: String,
    pub date: NaiveDate,
    pub segment: String,
    pub nutrients: Vec<NutrientReport>,
    pub warnings: Vec<String>,
    pub advices: Vec<String>,
}
