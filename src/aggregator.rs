//! Merging submitted nutrients into each user's running daily total.
//!
//! Per (user, nutrient, date) a total is absent until the first submission
//! creates it, and every later submission that day adds to it. A new date
//! starts from absent again. A submission is written with one
//! [`DailyStore::add_many`] call, so it lands entirely or not at all; write
//! conflicts reported by the store are retried, never dropped.

use crate::advice;
use crate::config::NutritionConfig;
use crate::error::{AggregateError, StoreError};
use crate::reference::{self, ReferenceCalculator, Segment};
use crate::schema::{DailyEntry, DailyReport, NutrientRecord};
use crate::store::{DailyKey, DailyStore, Increment};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct DailyAggregator {
    store: Arc<dyn DailyStore>,
    max_retries: u32,
    retry_delay: Duration,
}

impl DailyAggregator {
    pub fn new(store: Arc<dyn DailyStore>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            retry_delay: Duration::from_millis(50),
        }
    }

    /// Base delay between conflict retries; grows linearly per attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Add `records` to the user's totals for `date`.
    ///
    /// Names may be canonical keys or display labels; values are converted
    /// to the configured unit, and repeated nutrients are summed. The whole
    /// submission is checked before the single write, so a bad record or a
    /// failed write leaves every total untouched.
    pub async fn submit(
        &self,
        config: &NutritionConfig,
        user_id: &str,
        date: NaiveDate,
        records: &[NutrientRecord],
    ) -> Result<Vec<DailyEntry>, AggregateError> {
        let mut increments: Vec<Increment> = Vec::with_capacity(records.len());
        for record in records {
            let record = prepare(config, record)?;
            match increments.iter_mut().find(|inc| inc.key.nutrient == record.name) {
                Some(inc) => inc.value += record.value,
                None => increments.push(Increment::new(
                    DailyKey::new(user_id, &record.name, date),
                    record.value,
                    record.unit,
                )),
            }
        }

        let updated = self.add_with_retry(user_id, date, &increments).await?;

        info!(
            "Aggregated {} nutrients for user {} on {} ({} store)",
            updated.len(),
            user_id,
            date,
            self.store.name()
        );
        Ok(updated)
    }

    async fn add_with_retry(
        &self,
        user_id: &str,
        date: NaiveDate,
        increments: &[Increment],
    ) -> Result<Vec<DailyEntry>, AggregateError> {
        let mut attempt = 0;
        loop {
            match self.store.add_many(increments).await {
                Ok(entries) => return Ok(entries),
                Err(StoreError::Conflict(reason)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Conflict adding for {} on {} (attempt {}/{}): {}",
                        user_id, date, attempt, self.max_retries, reason
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(AggregateError::RetriesExhausted {
                        key: format!("{}/{}", user_id, date),
                        attempts: attempt + 1,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Single total by key or display label, `None` while nothing was added.
    pub async fn total(
        &self,
        config: &NutritionConfig,
        user_id: &str,
        date: NaiveDate,
        name: &str,
    ) -> Result<Option<DailyEntry>, AggregateError> {
        let nutrient = config
            .resolve_key(name)
            .ok_or_else(|| AggregateError::UnknownNutrient(name.to_string()))?;
        Ok(self.store.get(&DailyKey::new(user_id, nutrient, date)).await?)
    }

    /// Replace one total outright (user correction).
    pub async fn correct(
        &self,
        config: &NutritionConfig,
        user_id: &str,
        date: NaiveDate,
        record: &NutrientRecord,
    ) -> Result<DailyEntry, AggregateError> {
        let record = prepare(config, record)?;
        let key = DailyKey::new(user_id, &record.name, date);
        self.store.upsert(&key, record.value, &record.unit).await?;
        info!("Corrected {} to {} {}", key, record.value, record.unit);
        Ok(DailyEntry {
            nutrient: record.name,
            date,
            value: record.value,
            unit: record.unit,
        })
    }

    pub async fn totals(&self, user_id: &str, date: NaiveDate) -> Result<Vec<DailyEntry>, AggregateError> {
        Ok(self.store.list(user_id, date).await?)
    }

    /// All totals of a user grouped by date.
    pub async fn history(&self, user_id: &str) -> Result<BTreeMap<NaiveDate, Vec<DailyEntry>>, AggregateError> {
        let mut by_date: BTreeMap<NaiveDate, Vec<DailyEntry>> = BTreeMap::new();
        for entry in self.store.history(user_id).await? {
            by_date.entry(entry.date).or_default().push(entry);
        }
        Ok(by_date)
    }

    pub async fn erase(&self, user_id: &str) -> Result<usize, AggregateError> {
        let removed = self.store.erase_user(user_id).await?;
        info!("Erased {} daily totals for user {}", removed, user_id);
        Ok(removed)
    }

    /// Totals for `date` with percentages against `segment` and advice.
    pub async fn report(
        &self,
        config: &NutritionConfig,
        user_id: &str,
        date: NaiveDate,
        segment: Segment,
    ) -> Result<DailyReport, AggregateError> {
        let totals: Vec<NutrientRecord> = self
            .totals(user_id, date)
            .await?
            .into_iter()
            .map(|e| NutrientRecord::new(e.nutrient, e.value, e.unit))
            .collect();

        let calc = ReferenceCalculator::new(config, segment);
        let nutrients = reference::annotate(config, &calc, &totals);
        let assessment = advice::assess(&nutrients, &calc);

        Ok(DailyReport {
            user_id: user_id.to_string(),
            date,
            segment: calc.segment().to_string(),
            nutrients,
            warnings: assessment.warnings,
            advices: assessment.advices,
        })
    }
}

/// Resolve the canonical key and convert to the configured unit.
fn prepare(config: &NutritionConfig, record: &NutrientRecord) -> Result<NutrientRecord, AggregateError> {
    let spec = config
        .resolve_key(&record.name)
        .and_then(|key| config.nutrient(key))
        .ok_or_else(|| AggregateError::UnknownNutrient(record.name.clone()))?;

    if !record.value.is_finite() || record.value < 0.0 {
        return Err(AggregateError::InvalidValue {
            nutrient: spec.key.clone(),
            value: record.value,
        });
    }

    let value = if record.unit.is_empty() {
        record.value
    } else {
        convert_unit(record.value, &record.unit, &spec.unit).ok_or_else(|| AggregateError::UnitMismatch {
            nutrient: spec.key.clone(),
            from: record.unit.clone(),
            to: spec.unit.clone(),
        })?
    };

    Ok(NutrientRecord::new(&spec.key, value, &spec.unit))
}

/// Convert between mass units (g, mg, mcg) or energy units (kcal, kJ).
pub fn convert_unit(value: f64, from: &str, to: &str) -> Option<f64> {
    fn mass_in_mg(unit: &str) -> Option<f64> {
        match unit {
            "g" => Some(1000.0),
            "mg" => Some(1.0),
            "mcg" | "µg" | "ug" => Some(0.001),
            _ => None,
        }
    }
    fn energy_in_kj(unit: &str) -> Option<f64> {
        match unit {
            "kcal" => Some(4.184),
            "kj" => Some(1.0),
            _ => None,
        }
    }

    let from = from.trim().to_lowercase();
    let to = to.trim().to_lowercase();
    if from == to {
        return Some(value);
    }
    if let (Some(f), Some(t)) = (mass_in_mg(&from), mass_in_mg(&to)) {
        return Some(value * f / t);
    }
    if let (Some(f), Some(t)) = (energy_in_kj(&from), energy_in_kj(&to)) {
        return Some(value * f / t);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_default_config;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn aggregator() -> DailyAggregator {
        DailyAggregator::new(Arc::new(MemoryStore::new()), 3).with_retry_delay(Duration::from_millis(1))
    }

    /// Fails the first `failures` submissions with `fail()`, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        calls: AtomicU32,
        fail: fn() -> StoreError,
    }

    impl FlakyStore {
        fn new(failures: u32, fail: fn() -> StoreError) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                fail,
            }
        }

        fn conflicting(failures: u32) -> Self {
            Self::new(failures, || StoreError::Conflict("daily_totals".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl DailyStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn get(&self, key: &DailyKey) -> Result<Option<DailyEntry>, StoreError> {
            self.inner.get(key).await
        }
        async fn upsert(&self, key: &DailyKey, value: f64, unit: &str) -> Result<(), StoreError> {
            self.inner.upsert(key, value, unit).await
        }
        async fn add_many(&self, increments: &[Increment]) -> Result<Vec<DailyEntry>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err((self.fail)());
            }
            self.inner.add_many(increments).await
        }
        async fn list(&self, user_id: &str, date: NaiveDate) -> Result<Vec<DailyEntry>, StoreError> {
            self.inner.list(user_id, date).await
        }
        async fn history(&self, user_id: &str) -> Result<Vec<DailyEntry>, StoreError> {
            self.inner.history(user_id).await
        }
        async fn erase_user(&self, user_id: &str) -> Result<usize, StoreError> {
            self.inner.erase_user(user_id).await
        }
    }

    #[tokio::test]
    async fn test_same_value_twice_sums() {
        let config = create_default_config();
        let agg = aggregator();
        let records = vec![NutrientRecord::new("sodium", 450.0, "mg")];

        agg.submit(&config, "u1", today(), &records).await.unwrap();
        let updated = agg.submit(&config, "u1", today(), &records).await.unwrap();
        assert_eq!(updated[0].value, 900.0);

        let read = agg.total(&config, "u1", today(), "sodium").await.unwrap().unwrap();
        assert_eq!(read.value, 900.0);
    }

    #[tokio::test]
    async fn test_new_date_starts_fresh() {
        let config = create_default_config();
        let agg = aggregator();
        let records = vec![NutrientRecord::new("protein", 8.0, "g")];
        let tomorrow = today().succ_opt().unwrap();

        agg.submit(&config, "u1", today(), &records).await.unwrap();
        agg.submit(&config, "u1", tomorrow, &records).await.unwrap();

        assert_eq!(agg.totals("u1", tomorrow).await.unwrap()[0].value, 8.0);
        let history = agg.history("u1").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_labels_and_units_resolved() {
        let config = create_default_config();
        let agg = aggregator();
        let records = vec![
            NutrientRecord::new("나트륨", 0.5, "g"),
            NutrientRecord::new("열량", 150.0, ""),
        ];
        let updated = agg.submit(&config, "u1", today(), &records).await.unwrap();
        assert_eq!(updated[0].nutrient, "sodium");
        assert_eq!(updated[0].value, 500.0);
        assert_eq!(updated[0].unit, "mg");
        assert_eq!(updated[1].nutrient, "energy");
        assert_eq!(updated[1].value, 150.0);
    }

    #[tokio::test]
    async fn test_bad_record_rejects_whole_submission() {
        let config = create_default_config();
        let agg = aggregator();
        let records = vec![
            NutrientRecord::new("sodium", 450.0, "mg"),
            NutrientRecord::new("protein", -1.0, "g"),
        ];
        let err = agg.submit(&config, "u1", today(), &records).await.unwrap_err();
        assert!(matches!(err, AggregateError::InvalidValue { .. }));
        assert!(agg.totals("u1", today()).await.unwrap().is_empty());

        let unknown = vec![NutrientRecord::new("vitamin_z", 1.0, "mg")];
        assert!(matches!(
            agg.submit(&config, "u1", today(), &unknown).await,
            Err(AggregateError::UnknownNutrient(_))
        ));

        let wrong_unit = vec![NutrientRecord::new("sodium", 1.0, "kcal")];
        assert!(matches!(
            agg.submit(&config, "u1", today(), &wrong_unit).await,
            Err(AggregateError::UnitMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_do_not_lose_updates() {
        let config = Arc::new(create_default_config());
        let agg = Arc::new(aggregator());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let agg = Arc::clone(&agg);
            let config = Arc::clone(&config);
            handles.push(tokio::spawn(async move {
                let records = vec![NutrientRecord::new("sugar", 1.0, "g")];
                agg.submit(&config, "u1", today(), &records).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total = agg.total(&config, "u1", today(), "sugar").await.unwrap().unwrap();
        assert_eq!(total.value, 50.0);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let config = create_default_config();
        let store = Arc::new(FlakyStore::conflicting(2));
        let agg = DailyAggregator::new(store, 3).with_retry_delay(Duration::from_millis(1));

        let records = vec![NutrientRecord::new("fat", 3.1, "g")];
        let updated = agg.submit(&config, "u1", today(), &records).await.unwrap();
        assert_eq!(updated[0].value, 3.1);
    }

    #[tokio::test]
    async fn test_conflicts_exhausted_surface_error() {
        let config = create_default_config();
        let store = Arc::new(FlakyStore::conflicting(10));
        let agg = DailyAggregator::new(store, 2).with_retry_delay(Duration::from_millis(1));

        let records = vec![NutrientRecord::new("fat", 3.1, "g")];
        let err = agg.submit(&config, "u1", today(), &records).await.unwrap_err();
        assert!(matches!(err, AggregateError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_failed_submission_writes_nothing() {
        let config = create_default_config();
        let store = Arc::new(FlakyStore::new(1, || {
            StoreError::Backend(anyhow::anyhow!("network"))
        }));
        let agg = DailyAggregator::new(store.clone(), 3).with_retry_delay(Duration::from_millis(1));
        let records = vec![
            NutrientRecord::new("sodium", 450.0, "mg"),
            NutrientRecord::new("protein", 8.0, "g"),
        ];

        let err = agg.submit(&config, "u1", today(), &records).await.unwrap_err();
        assert!(matches!(err, AggregateError::Store(StoreError::Backend(_))));
        assert!(agg.totals("u1", today()).await.unwrap().is_empty());

        // The client retries the same submission once.
        agg.submit(&config, "u1", today(), &records).await.unwrap();
        let totals: Vec<(String, f64)> = agg
            .totals("u1", today())
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.nutrient, e.value))
            .collect();
        assert_eq!(
            totals,
            vec![("protein".to_string(), 8.0), ("sodium".to_string(), 450.0)]
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_nutrient_is_summed_once() {
        let config = create_default_config();
        let agg = aggregator();
        let records = vec![
            NutrientRecord::new("sodium", 100.0, "mg"),
            NutrientRecord::new("나트륨", 0.2, "g"),
        ];
        let updated = agg.submit(&config, "u1", today(), &records).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].value, 300.0);
    }

    #[tokio::test]
    async fn test_total_resolves_label_and_reports_absence() {
        let config = create_default_config();
        let agg = aggregator();
        agg.submit(&config, "u1", today(), &[NutrientRecord::new("protein", 8.0, "g")])
            .await
            .unwrap();

        let total = agg.total(&config, "u1", today(), "단백질").await.unwrap().unwrap();
        assert_eq!(total.nutrient, "protein");
        assert_eq!(total.value, 8.0);
        assert!(agg.total(&config, "u1", today(), "sodium").await.unwrap().is_none());
        assert!(matches!(
            agg.total(&config, "u1", today(), "caffeine").await,
            Err(AggregateError::UnknownNutrient(_))
        ));
    }

    #[tokio::test]
    async fn test_correct_overwrites_total() {
        let config = create_default_config();
        let agg = aggregator();
        agg.submit(&config, "u1", today(), &[NutrientRecord::new("fat", 3.1, "g")])
            .await
            .unwrap();
        agg.correct(&config, "u1", today(), &NutrientRecord::new("fat", 1.0, "g"))
            .await
            .unwrap();
        let total = agg.total(&config, "u1", today(), "fat").await.unwrap().unwrap();
        assert_eq!(total.value, 1.0);
    }

    #[tokio::test]
    async fn test_report_annotates_percentages() {
        let config = create_default_config();
        let agg = aggregator();
        let records = vec![
            NutrientRecord::new("energy", 1200.0, "kcal"),
            NutrientRecord::new("sodium", 1500.0, "mg"),
        ];
        agg.submit(&config, "u1", today(), &records).await.unwrap();

        let report = agg.report(&config, "u1", today(), Segment::Male).await.unwrap();
        assert_eq!(report.segment, "male");
        let energy = report.nutrients.iter().find(|n| n.key == "energy").unwrap();
        assert_eq!(energy.percentage, Some(50));
        let sodium = report.nutrients.iter().find(|n| n.key == "sodium").unwrap();
        assert_eq!(sodium.percentage, Some(75));
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_erase_removes_user_totals() {
        let config = create_default_config();
        let agg = aggregator();
        agg.submit(&config, "u1", today(), &[NutrientRecord::new("fat", 3.1, "g")])
            .await
            .unwrap();
        assert_eq!(agg.erase("u1").await.unwrap(), 1);
        assert!(agg.history("u1").await.unwrap().is_empty());
    }

    #[test]
    fn test_convert_unit() {
        assert_eq!(convert_unit(1.0, "g", "mg"), Some(1000.0));
        assert_eq!(convert_unit(500.0, "mg", "g"), Some(0.5));
        assert_eq!(convert_unit(150.0, "KCAL", "kcal"), Some(150.0));
        assert_eq!(convert_unit(4.184, "kJ", "kcal"), Some(1.0));
        assert_eq!(convert_unit(1.0, "g", "kcal"), None);
    }
}
