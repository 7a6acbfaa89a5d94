//! Plausibility filtering of extracted values.
//!
//! Out-of-range values are dropped, never clamped: a reading outside the
//! range is almost always a misread.

use crate::config::ValueRange;
use crate::schema::NutrientRecord;
use std::collections::BTreeMap;
use tracing::debug;

/// Records split by whether they passed their range check.
#[derive(Debug, Default)]
pub struct Validated {
    pub kept: Vec<NutrientRecord>,
    pub rejected: Vec<NutrientRecord>,
}

/// True when `value` lies inside the configured range for `key` (bounds
/// inclusive), or when `key` has no configured range.
pub fn is_plausible(key: &str, value: f64, ranges: &BTreeMap<String, ValueRange>) -> bool {
    if !value.is_finite() {
        return false;
    }
    ranges.get(key).map_or(true, |range| range.contains(value))
}

pub fn validate_records(records: Vec<NutrientRecord>, ranges: &BTreeMap<String, ValueRange>) -> Validated {
    let mut validated = Validated::default();
    for record in records {
        if is_plausible(&record.name, record.value, ranges) {
            validated.kept.push(record);
        } else {
            debug!(
                "Rejected implausible {} = {} {}",
                record.name, record.value, record.unit
            );
            validated.rejected.push(record);
        }
    }
    validated
}
