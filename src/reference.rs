//! Daily reference values and percentage calculation.
//!
//! Percentages are `round(value / reference * 100)` with `f64::round`
//! (half away from zero). They are computed on read and never stored.

use crate::config::NutritionConfig;
use crate::schema::{NutrientRecord, NutrientReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Population segment whose reference table applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Male,
    Female,
    /// Fixed population daily-value table.
    #[default]
    Population,
}

impl Segment {
    /// Key into [`NutritionConfig::reference_tables`].
    pub fn key(&self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Population => "population",
        }
    }
}

impl FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" | "man" | "남성" | "남" => Ok(Self::Male),
            "female" | "f" | "woman" | "여성" | "여" => Ok(Self::Female),
            "population" | "all" | "default" | "" => Ok(Self::Population),
            other => Err(format!(
                "Unknown segment '{}' (expected male|female|population)",
                other
            )),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// `round(value / reference * 100)`, or `None` when the reference is zero,
/// negative or not a number.
pub fn percentage(value: f64, reference: f64) -> Option<i64> {
    if !reference.is_finite() || reference <= 0.0 || !value.is_finite() {
        return None;
    }
    Some((value / reference * 100.0).round() as i64)
}

/// Reference lookups for one segment of one config.
pub struct ReferenceCalculator<'a> {
    table: Option<&'a BTreeMap<String, f64>>,
    segment: Segment,
}

impl<'a> ReferenceCalculator<'a> {
    pub fn new(config: &'a NutritionConfig, segment: Segment) -> Self {
        Self {
            table: config.reference_tables.get(segment.key()),
            segment,
        }
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn reference(&self, key: &str) -> Option<f64> {
        self.table.and_then(|t| t.get(key)).copied()
    }

    /// Percentage of the daily reference, `None` when no usable reference exists.
    pub fn percentage_of(&self, key: &str, value: f64) -> Option<i64> {
        self.reference(key).and_then(|reference| percentage(value, reference))
    }
}

/// Annotate values for display: every configured nutrient in config order
/// (absent ones with `value: None`), then any extra keys in `values` that
/// the config does not know.
pub fn annotate(
    config: &NutritionConfig,
    calc: &ReferenceCalculator<'_>,
    values: &[NutrientRecord],
) -> Vec<NutrientReport> {
    let mut reports: Vec<NutrientReport> = config
        .nutrients
        .iter()
        .map(|spec| {
            let value = values.iter().find(|r| r.name == spec.key).map(|r| r.value);
            NutrientReport {
                key: spec.key.clone(),
                label: spec.label.clone(),
                value,
                unit: spec.unit.clone(),
                percentage: value.and_then(|v| calc.percentage_of(&spec.key, v)),
            }
        })
        .collect();

    for record in values {
        if config.nutrient(&record.name).is_none() {
            reports.push(NutrientReport {
                key: record.name.clone(),
                label: record.name.clone(),
                value: Some(record.value),
                unit: record.unit.clone(),
                percentage: calc.percentage_of(&record.name, record.value),
            });
        }
    }

    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_default_config;

    #[test]
    fn test_percentage_cases() {
        assert_eq!(percentage(1000.0, 2000.0), Some(50));
        assert_eq!(percentage(0.0, 2000.0), Some(0));
        assert_eq!(percentage(150.0, 0.0), None);
        assert_eq!(percentage(150.0, f64::NAN), None);
    }

    #[test]
    fn test_percentage_rounds_half_away_from_zero() {
        // 1 / 200 * 100 = 0.5
        assert_eq!(percentage(1.0, 200.0), Some(1));
        // 8.2 / 60 * 100 = 13.67
        assert_eq!(percentage(8.2, 60.0), Some(14));
    }

    #[test]
    fn test_segment_parsing() {
        assert_eq!("male".parse::<Segment>().unwrap(), Segment::Male);
        assert_eq!("여성".parse::<Segment>().unwrap(), Segment::Female);
        assert_eq!(" Population ".parse::<Segment>().unwrap(), Segment::Population);
        assert!("child".parse::<Segment>().is_err());
    }

    #[test]
    fn test_calculator_uses_segment_table() {
        let config = create_default_config();
        let male = ReferenceCalculator::new(&config, Segment::Male);
        let female = ReferenceCalculator::new(&config, Segment::Female);
        assert_eq!(male.percentage_of("energy", 1200.0), Some(50));
        assert_eq!(female.percentage_of("energy", 950.0), Some(50));
        // No carbohydrate reference in the gender tables.
        assert_eq!(male.percentage_of("carbohydrate", 30.0), None);
        let population = ReferenceCalculator::new(&config, Segment::Population);
        assert_eq!(population.percentage_of("carbohydrate", 162.0), Some(50));
    }

    #[test]
    fn test_missing_table_gives_no_percentages() {
        let mut config = create_default_config();
        config.reference_tables.clear();
        let calc = ReferenceCalculator::new(&config, Segment::Male);
        assert_eq!(calc.percentage_of("energy", 100.0), None);
    }

    #[test]
    fn test_annotate_lists_every_configured_nutrient() {
        let config = create_default_config();
        let calc = ReferenceCalculator::new(&config, Segment::Male);
        let values = vec![
            NutrientRecord::new("sodium", 1000.0, "mg"),
            NutrientRecord::new("caffeine", 80.0, "mg"),
        ];
        let reports = annotate(&config, &calc, &values);
        assert_eq!(reports.len(), config.nutrients.len() + 1);

        let sodium = reports.iter().find(|r| r.key == "sodium").unwrap();
        assert_eq!(sodium.label, "나트륨");
        assert_eq!(sodium.percentage, Some(50));

        let protein = reports.iter().find(|r| r.key == "protein").unwrap();
        assert_eq!(protein.value, None);
        assert_eq!(protein.percentage, None);

        let caffeine = reports.last().unwrap();
        assert_eq!(caffeine.key, "caffeine");
        assert_eq!(caffeine.percentage, None);
    }
}
