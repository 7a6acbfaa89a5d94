//! Nutrition configuration and server settings.
//!
//! Configs are loaded once from the `configs/` directory (or the built-in
//! default) into an immutable [`ConfigStore`] and handed to components as
//! `Arc<NutritionConfig>`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How a nutrient's value is pulled from its matching line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Plain keyword match, first numeric token wins.
    #[default]
    Keyword,
    /// Energy/calories: adds the shared energy keywords and strips a glued `kcal`.
    Energy,
}

/// How forgiving token parsing is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Drop every non-digit/non-dot character, then parse.
    #[default]
    Lenient,
    /// Token must be a number optionally followed by a known unit.
    Strict,
}

/// One tracked nutrient and the keyword variants that identify its line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutrientSpec {
    /// Canonical key (e.g. "sodium").
    pub key: String,
    /// Display label (e.g. "나트륨").
    pub label: String,
    pub unit: String,
    /// Native-language names, English names and common misspellings.
    pub keywords: Vec<String>,
    #[serde(default)]
    pub mode: ExtractionMode,
}

/// Keywords delimiting the nutrition facts block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBounds {
    pub start_keywords: Vec<String>,
    #[serde(default)]
    pub end_keywords: Vec<String>,
}

/// Inclusive plausibility range for a nutrient value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Immutable configuration for one label locale/market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutritionConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nutrients: Vec<NutrientSpec>,
    /// Extra keywords used by nutrients in [`ExtractionMode::Energy`].
    #[serde(default)]
    pub energy_keywords: Vec<String>,
    pub table: TableBounds,
    #[serde(default)]
    pub ranges: BTreeMap<String, ValueRange>,
    /// Segment key ("male", "female", "population") → nutrient key → daily reference.
    #[serde(default)]
    pub reference_tables: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    pub strictness: Strictness,
}

impl NutritionConfig {
    /// Reject configs that would make extraction or percentages meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.nutrients.is_empty() {
            anyhow::bail!("Config '{}' defines no nutrients", self.name);
        }

        let mut seen = HashSet::new();
        for nutrient in &self.nutrients {
            if !seen.insert(nutrient.key.as_str()) {
                anyhow::bail!("Config '{}': duplicate nutrient key '{}'", self.name, nutrient.key);
            }
            if nutrient.keywords.iter().all(|k| match_key(k).is_empty()) {
                anyhow::bail!("Config '{}': nutrient '{}' has no usable keywords", self.name, nutrient.key);
            }
        }

        for (key, range) in &self.ranges {
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                anyhow::bail!(
                    "Config '{}': invalid range for '{}' ({}..={})",
                    self.name,
                    key,
                    range.min,
                    range.max
                );
            }
        }

        for (segment, table) in &self.reference_tables {
            for (key, value) in table {
                if !value.is_finite() || *value < 0.0 {
                    anyhow::bail!(
                        "Config '{}': reference value for {}/{} must be a non-negative number",
                        self.name,
                        segment,
                        key
                    );
                }
            }
        }

        Ok(())
    }

    /// Look up a nutrient by canonical key.
    pub fn nutrient(&self, key: &str) -> Option<&NutrientSpec> {
        self.nutrients.iter().find(|n| n.key == key)
    }

    /// Resolve a canonical key from either the key itself or its display label.
    pub fn resolve_key(&self, name: &str) -> Option<&str> {
        self.nutrients
            .iter()
            .find(|n| n.key == name || n.label == name)
            .map(|n| n.key.as_str())
    }

    /// Matching keywords for a nutrient, already in line-matching form.
    pub fn match_keywords(&self, spec: &NutrientSpec) -> Vec<String> {
        let extra = match spec.mode {
            ExtractionMode::Keyword => &[][..],
            ExtractionMode::Energy => &self.energy_keywords[..],
        };
        let mut keywords: Vec<String> = Vec::new();
        for keyword in spec.keywords.iter().chain(extra) {
            let key = match_key(keyword);
            if !key.is_empty() && !keywords.contains(&key) {
                keywords.push(key);
            }
        }
        keywords
    }
}

/// Line/keyword matching form: spaces removed, lower-cased.
pub fn match_key(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Read-only set of configs loaded at startup.
#[derive(Debug)]
pub struct ConfigStore {
    configs: HashMap<String, Arc<NutritionConfig>>,
    default_config: String,
}

impl ConfigStore {
    /// Load all configs from the specified directory, falling back to the
    /// built-in default when the directory does not exist.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            warn!("Config directory {:?} not found, using built-in default", dir);
            return Self::from_configs(vec![create_default_config()]);
        }

        let mut configs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {:?}", path))?;

                let config: NutritionConfig = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {:?}", path))?;

                info!("Loaded config: {} from {:?}", config.name, path);
                configs.push(config);
            }
        }

        if configs.is_empty() {
            anyhow::bail!("No configs found in {:?}", dir);
        }

        Self::from_configs(configs)
    }

    /// Build a store from already-parsed configs.
    pub fn from_configs(configs: Vec<NutritionConfig>) -> Result<Self> {
        if configs.is_empty() {
            anyhow::bail!("No configs provided");
        }

        let mut map = HashMap::new();
        for config in configs {
            config.validate()?;
            if map.contains_key(&config.name) {
                anyhow::bail!("Duplicate config name: {}", config.name);
            }
            map.insert(config.name.clone(), Arc::new(config));
        }

        let default_config = if map.contains_key("default") {
            "default".to_string()
        } else {
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            names[0].clone()
        };

        Ok(Self {
            configs: map,
            default_config,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<NutritionConfig>> {
        self.configs.get(name).cloned()
    }

    /// Config named by `name`, or the default one when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<NutritionConfig>> {
        self.get(name.unwrap_or(&self.default_config))
    }

    /// List all available config names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Where daily totals are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Supabase,
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub config_dir: String,
    pub store: StoreBackend,
    pub ocr_provider: String,
    pub ocr_sidecar_url: String,
    pub aggregate_max_retries: u32,
    pub aggregate_retry_delay: Duration,
    pub upload_limit_bytes: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let store = match env_or("DAILY_STORE", "memory").as_str() {
            "memory" => StoreBackend::Memory,
            "supabase" => StoreBackend::Supabase,
            other => anyhow::bail!("Unknown DAILY_STORE '{}' (expected memory|supabase)", other),
        };

        let aggregate_max_retries = env_or("AGGREGATE_MAX_RETRIES", "5")
            .parse()
            .context("AGGREGATE_MAX_RETRIES must be a non-negative integer")?;
        let retry_delay_ms: u64 = env_or("AGGREGATE_RETRY_DELAY_MS", "50")
            .parse()
            .context("AGGREGATE_RETRY_DELAY_MS must be a non-negative integer")?;
        let upload_limit_mb: usize = env_or("UPLOAD_LIMIT_MB", "20")
            .parse()
            .context("UPLOAD_LIMIT_MB must be a non-negative integer")?;

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            config_dir: env_or("NUTRITION_CONFIG_DIR", "configs"),
            store,
            ocr_provider: env_or("OCR_PROVIDER", "sidecar"),
            ocr_sidecar_url: env_or("OCR_SIDECAR_URL", "http://localhost:8866"),
            aggregate_max_retries,
            aggregate_retry_delay: Duration::from_millis(retry_delay_ms),
            upload_limit_bytes: upload_limit_mb * 1024 * 1024,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn nutrient(key: &str, label: &str, unit: &str, keywords: &[&str]) -> NutrientSpec {
    NutrientSpec {
        key: key.to_string(),
        label: label.to_string(),
        unit: unit.to_string(),
        keywords: strings(keywords),
        mode: ExtractionMode::Keyword,
    }
}

fn table(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Built-in config for Korean/English nutrition facts labels.
pub fn create_default_config() -> NutritionConfig {
    let mut energy = nutrient("energy", "열량", "kcal", &["열량", "칼로리", "kcal", "calories", "energy", "에너지"]);
    energy.mode = ExtractionMode::Energy;

    let ranges = [
        ("energy", 0.0, 1000.0),
        ("carbohydrate", 0.0, 200.0),
        ("sugar", 0.0, 100.0),
        ("protein", 0.0, 50.0),
        ("fat", 0.0, 100.0),
        ("sat_fat", 0.0, 50.0),
        ("trans_fat", 0.0, 10.0),
        ("cholesterol", 0.0, 1000.0),
        ("sodium", 0.0, 5000.0),
        ("fiber", 0.0, 50.0),
    ]
    .into_iter()
    .map(|(k, min, max)| (k.to_string(), ValueRange { min, max }))
    .collect();

    let mut reference_tables = BTreeMap::new();
    reference_tables.insert(
        "male".to_string(),
        table(&[
            ("energy", 2400.0),
            ("protein", 60.0),
            ("sodium", 2000.0),
            ("sugar", 100.0),
            ("fat", 70.0),
            ("sat_fat", 20.0),
        ]),
    );
    reference_tables.insert(
        "female".to_string(),
        table(&[
            ("energy", 1900.0),
            ("protein", 50.0),
            ("sodium", 2000.0),
            ("sugar", 100.0),
            ("fat", 70.0),
            ("sat_fat", 20.0),
        ]),
    );
    reference_tables.insert(
        "population".to_string(),
        table(&[
            ("energy", 2000.0),
            ("carbohydrate", 324.0),
            ("sugar", 100.0),
            ("protein", 55.0),
            ("fat", 54.0),
            ("sat_fat", 15.0),
            ("cholesterol", 300.0),
            ("sodium", 2000.0),
            ("fiber", 25.0),
        ]),
    );

    NutritionConfig {
        name: "default".to_string(),
        description: "Korean/English nutrition facts labels".to_string(),
        nutrients: vec![
            energy,
            nutrient("carbohydrate", "탄수화물", "g", &["탄수화물", "carbohydrate", "carbs", "탄수회물"]),
            nutrient("sugar", "당류", "g", &["당류", "sugar", "sugars", "당휴"]),
            nutrient("protein", "단백질", "g", &["단백질", "protein", "단백잘", "딘백질"]),
            nutrient("sat_fat", "포화지방", "g", &["포화지방", "satfat", "saturated", "포화지빙"]),
            nutrient("trans_fat", "트랜스지방", "g", &["트랜스지방", "transfat", "trans"]),
            nutrient("fat", "지방", "g", &["지방", "fat", "지빙"]),
            nutrient("cholesterol", "콜레스테롤", "mg", &["콜레스테롤", "cholesterol", "콜레스테룰"]),
            nutrient("sodium", "나트륨", "mg", &["나트륨", "나트롬", "염분", "sodium", "natrium"]),
            nutrient("fiber", "식이섬유", "g", &["식이섬유", "fiber", "fibre", "dietaryfiber"]),
        ],
        energy_keywords: strings(&["총열량", "totalcalories", "totalenergy"]),
        table: TableBounds {
            start_keywords: strings(&["영양성분", "영양정보", "nutritionfacts", "nutritioninformation"]),
            end_keywords: strings(&["원료명", "원재료명", "ingredients", "allergen", "알레르기"]),
        },
        ranges,
        reference_tables,
        strictness: Strictness::Lenient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = create_default_config();
        config.validate().unwrap();
        assert_eq!(config.nutrients.len(), 10);
        assert_eq!(config.reference_tables.len(), 3);
    }

    #[test]
    fn test_energy_keywords_merged() {
        let config = create_default_config();
        let energy = config.nutrient("energy").unwrap();
        let keywords = config.match_keywords(energy);
        assert!(keywords.contains(&"열량".to_string()));
        assert!(keywords.contains(&"totalcalories".to_string()));

        let protein = config.nutrient("protein").unwrap();
        assert!(!config.match_keywords(protein).contains(&"totalcalories".to_string()));
    }

    #[test]
    fn test_match_key_strips_spaces() {
        assert_eq!(match_key("Nutrition Facts"), "nutritionfacts");
        assert_eq!(match_key(" 열 량 "), "열량");
    }

    #[test]
    fn test_resolve_key_by_label() {
        let config = create_default_config();
        assert_eq!(config.resolve_key("나트륨"), Some("sodium"));
        assert_eq!(config.resolve_key("sodium"), Some("sodium"));
        assert_eq!(config.resolve_key("vitamin_c"), None);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut config = create_default_config();
        config
            .ranges
            .insert("protein".to_string(), ValueRange { min: 10.0, max: 1.0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut config = create_default_config();
        let dup = config.nutrients[0].clone();
        config.nutrients.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_defaults_to_builtin_when_dir_missing() {
        let store = ConfigStore::load_from_dir(Path::new("/nonexistent/daily-value-configs")).unwrap();
        assert_eq!(store.list(), vec!["default".to_string()]);
        assert_eq!(store.resolve(None).unwrap().name, "default");
        assert!(store.resolve(Some("missing")).is_none());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let json = serde_json::to_string(&create_default_config()).unwrap();
        let parsed: NutritionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.nutrient("energy").unwrap().mode, ExtractionMode::Energy);
        assert_eq!(parsed.strictness, Strictness::Lenient);
    }
}
