//! Persistence of daily totals, one logical row per (user, nutrient, date).
//!
//! Backends implement [`DailyStore`]; the aggregator only ever increments
//! through [`DailyStore::add_many`], which applies a whole submission or
//! nothing.

pub mod memory;
pub mod supabase;

use crate::error::StoreError;
use crate::schema::DailyEntry;
use chrono::NaiveDate;
use std::fmt;

/// Identity of one daily total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DailyKey {
    pub user_id: String,
    pub nutrient: String,
    pub date: NaiveDate,
}

impl DailyKey {
    pub fn new(user_id: impl Into<String>, nutrient: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            nutrient: nutrient.into(),
            date,
        }
    }
}

impl fmt::Display for DailyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.nutrient, self.date)
    }
}

/// One pending addition to a daily total.
#[derive(Debug, Clone, PartialEq)]
pub struct Increment {
    pub key: DailyKey,
    pub value: f64,
    pub unit: String,
}

impl Increment {
    pub fn new(key: DailyKey, value: f64, unit: impl Into<String>) -> Self {
        Self {
            key,
            value,
            unit: unit.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait DailyStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &DailyKey) -> Result<Option<DailyEntry>, StoreError>;

    /// Overwrite the total for `key`, creating it if absent.
    async fn upsert(&self, key: &DailyKey, value: f64, unit: &str) -> Result<(), StoreError>;

    /// Add every increment to its total (creating absent totals) as one
    /// atomic write: on error no total has changed. Keys are distinct.
    /// Returns the new totals in input order.
    async fn add_many(&self, increments: &[Increment]) -> Result<Vec<DailyEntry>, StoreError>;

    /// All totals of `user_id` on `date`, ordered by nutrient.
    async fn list(&self, user_id: &str, date: NaiveDate) -> Result<Vec<DailyEntry>, StoreError>;

    /// Every total of `user_id`, ordered by date then nutrient.
    async fn history(&self, user_id: &str) -> Result<Vec<DailyEntry>, StoreError>;

    /// Delete every total of `user_id`; returns how many were removed.
    async fn erase_user(&self, user_id: &str) -> Result<usize, StoreError>;
}
