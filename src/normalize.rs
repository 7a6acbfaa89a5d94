//! OCR token repair.
//!
//! Resolves the character confusions OCR engines make on nutrition labels
//! (comma decimals, letters read as digits, `g` read as `9`, `l` read as `1`
//! in `kcal`) before a token is parsed as a number. Output is only ever used
//! for numeric parsing.

use regex::Regex;
use tracing::trace;

/// Letters that OCR commonly returns in place of a digit.
const DIGIT_LOOKALIKES: [(char, char); 8] = [
    ('O', '0'),
    ('o', '0'),
    ('I', '1'),
    ('l', '1'),
    ('Z', '2'),
    ('S', '5'),
    ('B', '8'),
    ('A', '4'),
];

/// Pre-compiled repair patterns. Build once and share.
pub struct TokenNormalizer {
    /// `2.69` → `2.6g`: trailing `g` misread as `9`/`q` after a decimal value.
    gram: Regex,
    /// `3.29mg` → `3.2mg`: a stray `9` ahead of the unit.
    milligram_decimal: Regex,
    /// `450m9` → `450mg`.
    milligram: Regex,
    /// `kca1`, `KCAL`, `kcaI` → `kcal`.
    kcal: Regex,
}

impl TokenNormalizer {
    pub fn new() -> Self {
        Self {
            gram: Regex::new(r"(\d+\.\d+)[9q]\b").expect("static regex"),
            milligram_decimal: Regex::new(r"(\d+\.\d)9mg\b").expect("static regex"),
            milligram: Regex::new(r"(\d)m[9q]\b").expect("static regex"),
            kcal: Regex::new(r"(?i)kc[a4][1li]\b").expect("static regex"),
        }
    }

    /// Normalize a single whitespace-delimited token.
    ///
    /// Unit repair runs before the lookalike substitution and once more after
    /// it, so a value uncovered by substitution (`O.69` → `0.69`) is repaired
    /// in the same call and the function stays idempotent.
    pub fn normalize(&self, token: &str) -> String {
        let token = token.replace(',', ".");
        let repaired = self.repair_units(&token);
        let substituted = self.substitute_lookalikes(&repaired);
        let normalized = self.repair_units(&substituted);

        if normalized != token {
            trace!("OCR token repair: '{}' -> '{}'", token, normalized);
        }
        normalized
    }

    fn repair_units(&self, token: &str) -> String {
        let token = self.kcal.replace_all(token, "kcal");
        let token = self.milligram_decimal.replace_all(&token, "${1}mg");
        let token = self.milligram.replace_all(&token, "${1}mg");
        self.gram.replace_all(&token, "${1}g").into_owned()
    }

    /// Map digit lookalikes inside numeric runs.
    ///
    /// A run is a maximal stretch of digits, `.` and lookalike letters; only
    /// runs holding a real digit are rewritten. Lookalikes at the head of a
    /// run glued to a preceding letter stay letters, so words and unit text
    /// survive (`Sodium160mg`, `Total1O0`, `2OOkcal`).
    fn substitute_lookalikes(&self, token: &str) -> String {
        if !token.chars().any(|c| c.is_ascii_digit()) {
            return token.to_string();
        }

        let chars: Vec<char> = token.chars().collect();
        let mut out = String::with_capacity(token.len());
        let mut i = 0;
        while i < chars.len() {
            if !is_numeric_like(chars[i]) {
                out.push(chars[i]);
                i += 1;
                continue;
            }

            let end = chars[i..]
                .iter()
                .position(|c| !is_numeric_like(*c))
                .map_or(chars.len(), |offset| i + offset);
            let run = &chars[i..end];

            let word_tail = if i > 0 && chars[i - 1].is_alphabetic() {
                run.iter()
                    .position(|c| c.is_ascii_digit() || *c == '.')
                    .unwrap_or(run.len())
            } else {
                0
            };
            out.extend(&run[..word_tail]);

            let rest = &run[word_tail..];
            if rest.iter().any(|c| c.is_ascii_digit()) {
                out.extend(rest.iter().map(|c| lookalike_digit(*c)));
            } else {
                out.extend(rest);
            }
            i = end;
        }
        out
    }
}

impl Default for TokenNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_numeric_like(c: char) -> bool {
    c.is_ascii_digit() || c == '.' || DIGIT_LOOKALIKES.iter().any(|(from, _)| *from == c)
}

fn lookalike_digit(c: char) -> char {
    DIGIT_LOOKALIKES
        .iter()
        .find(|(from, _)| *from == c)
        .map(|(_, to)| *to)
        .unwrap_or(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_nine_becomes_gram() {
        let n = TokenNormalizer::new();
        for (raw, expected) in [
            ("2.69", "2.6g"),
            ("15.89", "15.8g"),
            ("25.59", "25.5g"),
            ("0.19", "0.1g"),
            ("12.39", "12.3g"),
            ("8.2q", "8.2g"),
        ] {
            assert_eq!(n.normalize(raw), expected, "token {}", raw);
        }
    }

    #[test]
    fn test_plain_numbers_untouched() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("150"), "150");
        assert_eq!(n.normalize("19"), "19");
        assert_eq!(n.normalize("2.5"), "2.5");
        assert_eq!(n.normalize("8.2g"), "8.2g");
    }

    #[test]
    fn test_kcal_repair() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("150kca1"), "150kcal");
        assert_eq!(n.normalize("150KCAL"), "150kcal");
        assert_eq!(n.normalize("150kcaI"), "150kcal");
        assert_eq!(n.normalize("150kcal"), "150kcal");
    }

    #[test]
    fn test_milligram_repair() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("450m9"), "450mg");
        assert_eq!(n.normalize("450mg"), "450mg");
        assert_eq!(n.normalize("3.29mg"), "3.2mg");
        assert_eq!(n.normalize("13.29mg"), "13.2mg");
        assert_eq!(n.normalize("3.2mg"), "3.2mg");
        assert_eq!(n.normalize("129mg"), "129mg");
    }

    #[test]
    fn test_comma_decimal() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("3,1g"), "3.1g");
        assert_eq!(n.normalize("1,89"), "1.8g");
    }

    #[test]
    fn test_lookalike_substitution() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("1O0"), "100");
        assert_eq!(n.normalize("4S0mg"), "450mg");
        assert_eq!(n.normalize("O.5g"), "0.5g");
        assert_eq!(n.normalize("O.69"), "0.6g");
    }

    #[test]
    fn test_words_without_digits_untouched() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("Sodium"), "Sodium");
        assert_eq!(n.normalize("kcal"), "kcal");
        assert_eq!(n.normalize("열량:"), "열량:");
    }

    #[test]
    fn test_words_glued_to_digits_untouched() {
        let n = TokenNormalizer::new();
        assert_eq!(n.normalize("Sodium160mg"), "Sodium160mg");
        assert_eq!(n.normalize("Total1O0"), "Total100");
        assert_eq!(n.normalize("Protein8g"), "Protein8g");
        assert_eq!(n.normalize("나트륨4S0mg"), "나트륨450mg");
    }

    #[test]
    fn test_unit_text_not_substituted() {
        let n = TokenNormalizer::new();
        // `l` in kcal and `A` in KCAL would otherwise become digits.
        assert_eq!(n.normalize("2OOkcal"), "200kcal");
        assert_eq!(n.normalize("2OOKCAL"), "200kcal");
    }

    #[test]
    fn test_idempotent() {
        let n = TokenNormalizer::new();
        for raw in [
            "2.69", "O.69", "150kca1", "450m9", "1,89", "Sodium", "4S0mg", "12.399", "100g당", "(8.2g)",
            "B.2", "kcal", "0.0", "3.29mg", "12.399mg", "Sodium160mg", "Total1O0",
        ] {
            let once = n.normalize(raw);
            assert_eq!(n.normalize(&once), once, "token {}", raw);
        }
    }
}
