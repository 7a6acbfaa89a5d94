//! Keyword-anchored nutrient extraction over OCR lines.
//!
//! Pure, synchronous functions over an in-memory line sequence. The
//! [`Extractor`] is built once per config and shared across requests.

use crate::config::{match_key, ExtractionMode, NutritionConfig, Strictness};
use crate::error::ScanError;
use crate::normalize::TokenNormalizer;
use crate::schema::{LabelScan, NutrientRecord};
use crate::table::nutrition_table_region;
use crate::validate::validate_records;
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Keywords for one nutrient, in line-matching form.
struct KeywordSet {
    keywords: Vec<String>,
    /// Longer configured keywords that contain one of ours (`포화지방`
    /// for `지방`). Only consulted in strict mode.
    shadowed_by: Vec<String>,
}

impl KeywordSet {
    fn matches(&self, line: &str, strictness: Strictness) -> bool {
        if strictness == Strictness::Lenient || self.shadowed_by.is_empty() {
            return self.keywords.iter().any(|k| line.contains(k.as_str()));
        }
        let masked = self
            .shadowed_by
            .iter()
            .fold(line.to_string(), |acc, longer| acc.replace(longer.as_str(), " "));
        self.keywords.iter().any(|k| masked.contains(k.as_str()))
    }
}

/// Values pulled from a line sequence, before validation.
#[derive(Debug, Default)]
pub struct Extracted {
    pub found: Vec<NutrientRecord>,
    pub missing: Vec<String>,
}

pub struct Extractor {
    config: Arc<NutritionConfig>,
    normalizer: TokenNormalizer,
    strict_token: Regex,
}

impl Extractor {
    pub fn new(config: Arc<NutritionConfig>) -> Self {
        Self {
            config,
            normalizer: TokenNormalizer::new(),
            strict_token: Regex::new(r"(?i)^(\d+(?:\.\d+)?)(?:kcal|mcg|mg|g)?$").expect("static regex"),
        }
    }

    pub fn config(&self) -> &Arc<NutritionConfig> {
        &self.config
    }

    /// Best-guess value for one nutrient, `None` when no matching line yields
    /// a number.
    ///
    /// Lines are scanned in order. On a matching line every token is
    /// normalized and the first that parses wins; failing that, the next
    /// line is tried (label and value split across lines). Further matching
    /// lines are tried until the sequence is exhausted. In strict mode,
    /// longer configured keywords containing one of `keywords` are masked
    /// first.
    pub fn extract_value<S: AsRef<str>>(
        &self,
        lines: &[S],
        keywords: &[String],
        mode: ExtractionMode,
    ) -> Option<f64> {
        let keywords: Vec<String> = keywords.iter().map(|k| match_key(k)).filter(|k| !k.is_empty()).collect();
        let set = KeywordSet {
            shadowed_by: self.shadowing_keywords(&keywords),
            keywords,
        };
        self.extract_with(lines, &set, mode)
    }

    /// Configured keywords that strictly contain one of `own` without being one of them.
    fn shadowing_keywords(&self, own: &[String]) -> Vec<String> {
        let mut longer: Vec<String> = Vec::new();
        for spec in &self.config.nutrients {
            for keyword in self.config.match_keywords(spec) {
                let shadows = !own.contains(&keyword)
                    && own.iter().any(|k| keyword.len() > k.len() && keyword.contains(k.as_str()));
                if shadows && !longer.contains(&keyword) {
                    longer.push(keyword);
                }
            }
        }
        longer
    }

    fn extract_with<S: AsRef<str>>(&self, lines: &[S], set: &KeywordSet, mode: ExtractionMode) -> Option<f64> {
        let strictness = self.config.strictness;

        for (idx, line) in lines.iter().enumerate() {
            let line = line.as_ref();
            if !set.matches(&match_key(line), strictness) {
                continue;
            }

            if let Some(value) = self.first_value(line, mode) {
                debug!("Matched '{}' -> {}", line, value);
                return Some(value);
            }

            if let Some(next) = lines.get(idx + 1) {
                if let Some(value) = self.first_value(next.as_ref(), mode) {
                    debug!("Matched '{}' -> {} (from next line)", line, value);
                    return Some(value);
                }
            }
        }

        None
    }

    /// First token on `line` that parses as a number after normalization.
    fn first_value(&self, line: &str, mode: ExtractionMode) -> Option<f64> {
        line.split_whitespace().find_map(|token| {
            let normalized = self.normalizer.normalize(token);
            let candidate = match mode {
                ExtractionMode::Keyword => normalized.as_str(),
                ExtractionMode::Energy => strip_kcal(&normalized),
            };
            self.parse_number(candidate)
        })
    }

    fn parse_number(&self, token: &str) -> Option<f64> {
        match self.config.strictness {
            Strictness::Lenient => {
                let digits: String = token.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
                if !digits.chars().any(|c| c.is_ascii_digit()) {
                    return None;
                }
                digits.parse().ok()
            }
            Strictness::Strict => {
                let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '.');
                let trimmed = trimmed.trim_end_matches('.');
                self.strict_token
                    .captures(trimmed)
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse().ok())
            }
        }
    }

    /// Run every configured nutrient over `lines`.
    pub fn extract_all<S: AsRef<str>>(&self, lines: &[S]) -> Extracted {
        let mut extracted = Extracted::default();
        for spec in &self.config.nutrients {
            let keywords = self.config.match_keywords(spec);
            match self.extract_value(lines, &keywords, spec.mode) {
                Some(value) => extracted.found.push(NutrientRecord::new(&spec.key, value, &spec.unit)),
                None => {
                    debug!("No value found for {}", spec.key);
                    extracted.missing.push(spec.key.clone());
                }
            }
        }
        extracted
    }

    /// Full label pipeline: table region, extraction, validation.
    pub fn scan<S: AsRef<str>>(&self, lines: &[S]) -> Result<LabelScan, ScanError> {
        let lines: Vec<&str> = lines
            .iter()
            .map(|l| l.as_ref().trim())
            .filter(|l| !l.is_empty())
            .collect();

        if lines.is_empty() {
            return Err(ScanError::NoInput);
        }

        let region = nutrition_table_region(&lines, &self.config.table);
        let mut table_region = !region.is_empty();
        let mut extracted = if table_region {
            self.extract_all(region)
        } else {
            self.extract_all(&lines)
        };

        if table_region && extracted.found.is_empty() {
            debug!("Table region yielded nothing, rescanning all {} lines", lines.len());
            table_region = false;
            extracted = self.extract_all(&lines);
        }

        let validated = validate_records(extracted.found, &self.config.ranges);
        if validated.kept.is_empty() {
            return Err(ScanError::NothingExtracted { lines: lines.len() });
        }

        let scan = LabelScan {
            id: format!("scan_{}", Uuid::new_v4().simple()),
            content_hash: content_hash(&lines),
            line_count: lines.len(),
            table_region,
            records: validated.kept,
            missing: extracted.missing,
            rejected: validated.rejected,
            scanned_at: Utc::now(),
        };

        info!(
            "Scan {}: {} found, {} missing, {} rejected (config={}, table_region={})",
            scan.id,
            scan.records.len(),
            scan.missing.len(),
            scan.rejected.len(),
            self.config.name,
            scan.table_region
        );
        Ok(scan)
    }
}

/// Drop a trailing `kcal` glued to the digits (`150kcal`, `150kcal:`).
fn strip_kcal(token: &str) -> &str {
    let trimmed = token.trim_end_matches(|c: char| !c.is_alphanumeric());
    trimmed
        .strip_suffix("kcal")
        .or_else(|| trimmed.strip_suffix("KCAL"))
        .unwrap_or(token)
}

fn content_hash(lines: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    format!("{:x}", hasher.finalize())
}
