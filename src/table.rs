//! Locating the nutrition facts block inside the OCR line sequence.

use crate::config::{match_key, TableBounds};
use tracing::debug;

/// Contiguous slice of `lines` from the first start-keyword line (inclusive)
/// up to the first end-keyword line after it (exclusive).
///
/// Returns an empty slice when no start keyword is present; callers then
/// scan the full line sequence instead.
pub fn nutrition_table_region<'a, S: AsRef<str>>(lines: &'a [S], bounds: &TableBounds) -> &'a [S] {
    let start_keys: Vec<String> = bounds.start_keywords.iter().map(|k| match_key(k)).collect();
    let end_keys: Vec<String> = bounds.end_keywords.iter().map(|k| match_key(k)).collect();

    let Some(start) = lines
        .iter()
        .position(|line| contains_any(&match_key(line.as_ref()), &start_keys))
    else {
        debug!("No nutrition table start keyword in {} lines", lines.len());
        return &lines[..0];
    };

    let end = lines[start + 1..]
        .iter()
        .position(|line| contains_any(&match_key(line.as_ref()), &end_keys))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    debug!("Nutrition table region: lines {}..{} of {}", start, end, lines.len());
    &lines[start..end]
}

fn contains_any(line: &str, keys: &[String]) -> bool {
    keys.iter().any(|k| !k.is_empty() && line.contains(k.as_str()))
}
