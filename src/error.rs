//! Error taxonomy for extraction and aggregation.
//!
//! Extraction misses, unparsable tokens and range rejections are not errors:
//! they surface as missing/rejected entries on the scan. What remains here
//! is what a caller has to act on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// The image-to-text stage produced nothing to read.
    #[error("no OCR lines supplied")]
    NoInput,

    #[error("could not extract any nutrient from {lines} OCR lines")]
    NothingExtracted { lines: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Concurrent write on the same (user, nutrient, date) key.
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("unknown nutrient '{0}'")]
    UnknownNutrient(String),

    #[error("invalid value for {nutrient}: {value}")]
    InvalidValue { nutrient: String, value: f64 },

    #[error("cannot convert {nutrient} from '{from}' to '{to}'")]
    UnitMismatch {
        nutrient: String,
        from: String,
        to: String,
    },

    #[error("gave up on {key} after {attempts} conflicting writes")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
