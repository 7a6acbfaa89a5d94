//! Rule-based warnings and advice over annotated nutrient values.
//!
//! Rules compare raw values against the segment reference, not the rounded
//! percentage. A nutrient with no value, or no reference for the segment,
//! produces nothing.

use crate::reference::ReferenceCalculator;
use crate::schema::NutrientReport;
use serde::Serialize;

const SODIUM_WARN_RATIO: f64 = 0.5;
const PROTEIN_LOW_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Advice {
    pub warnings: Vec<String>,
    pub advices: Vec<String>,
}

pub fn assess(reports: &[NutrientReport], calc: &ReferenceCalculator<'_>) -> Advice {
    let mut advice = Advice::default();

    if let Some((value, reference)) = with_reference(reports, calc, "sodium") {
        if value > reference * SODIUM_WARN_RATIO {
            advice.warnings.push("나트륨이 50% 이상입니다.".to_string());
        }
    }

    if let Some((value, reference)) = with_reference(reports, calc, "protein") {
        if value < reference * PROTEIN_LOW_RATIO {
            advice.advices.push("단백질이 적은 편입니다.".to_string());
        } else {
            advice.advices.push("단백질은 적절한 수준입니다.".to_string());
        }
    }

    for report in reports {
        if let Some((value, reference)) = with_reference(reports, calc, &report.key) {
            if value > reference {
                advice
                    .warnings
                    .push(format!("{}이(가) 일일 기준치를 초과했습니다.", report.label));
            }
        }
    }

    advice
}

fn with_reference(
    reports: &[NutrientReport],
    calc: &ReferenceCalculator<'_>,
    key: &str,
) -> Option<(f64, f64)> {
    let value = reports.iter().find(|r| r.key == key)?.value?;
    let reference = calc.reference(key).filter(|r| r.is_finite() && *r > 0.0)?;
    Some((value, reference))
}
