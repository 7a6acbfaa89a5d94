//! In-memory daily totals.
//!
//! Every read-modify-write happens under one write lock, so `add_many`
//! applies a whole submission atomically.

use super::{DailyKey, DailyStore, Increment};
use crate::error::StoreError;
use crate::schema::DailyEntry;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Total {
    value: f64,
    unit: String,
}

/// Keys are ordered (user, nutrient, date).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<BTreeMap<DailyKey, Total>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<DailyKey, Total>>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("daily totals lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<DailyKey, Total>>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("daily totals lock poisoned")))
    }
}

fn entry(key: &DailyKey, total: &Total) -> DailyEntry {
    DailyEntry {
        nutrient: key.nutrient.clone(),
        date: key.date,
        value: total.value,
        unit: total.unit.clone(),
    }
}

#[async_trait::async_trait]
impl DailyStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &DailyKey) -> Result<Option<DailyEntry>, StoreError> {
        Ok(self.read()?.get(key).map(|total| entry(key, total)))
    }

    async fn upsert(&self, key: &DailyKey, value: f64, unit: &str) -> Result<(), StoreError> {
        self.write()?.insert(
            key.clone(),
            Total {
                value,
                unit: unit.to_string(),
            },
        );
        debug!("MemoryStore: set {} = {} {}", key, value, unit);
        Ok(())
    }

    async fn add_many(&self, increments: &[Increment]) -> Result<Vec<DailyEntry>, StoreError> {
        let mut store = self.write()?;
        let mut updated = Vec::with_capacity(increments.len());
        for inc in increments {
            let total = store.entry(inc.key.clone()).or_insert_with(|| Total {
                value: 0.0,
                unit: inc.unit.clone(),
            });
            if total.unit != inc.unit {
                warn!(
                    "MemoryStore: unit '{}' differs from stored '{}' for {}",
                    inc.unit, total.unit, inc.key
                );
            }
            total.value += inc.value;
            debug!("MemoryStore: {} += {} -> {}", inc.key, inc.value, total.value);
            updated.push(entry(&inc.key, total));
        }
        Ok(updated)
    }

    async fn list(&self, user_id: &str, date: NaiveDate) -> Result<Vec<DailyEntry>, StoreError> {
        Ok(self
            .read()?
            .iter()
            .filter(|(k, _)| k.user_id == user_id && k.date == date)
            .map(|(k, total)| entry(k, total))
            .collect())
    }

    async fn history(&self, user_id: &str) -> Result<Vec<DailyEntry>, StoreError> {
        let mut entries: Vec<DailyEntry> = self
            .read()?
            .iter()
            .filter(|(k, _)| k.user_id == user_id)
            .map(|(k, total)| entry(k, total))
            .collect();
        entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.nutrient.cmp(&b.nutrient)));
        Ok(entries)
    }

    async fn erase_user(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut store = self.write()?;
        let before = store.len();
        store.retain(|k, _| k.user_id != user_id);
        Ok(before - store.len())
    }
}
