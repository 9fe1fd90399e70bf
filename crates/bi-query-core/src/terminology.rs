//! Terminology Normalizer: maps domain synonyms to canonical schema terms.

use std::collections::HashMap;

use crate::locale::Locale;

/// A single synonym → canonical-term replacement applied to a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMapping {
    pub synonym: String,
    pub canonical: String,
}

/// Result of normalizing a question's terminology.
#[derive(Debug, Clone)]
pub struct NormalizationResult {
    pub normalized_text: String,
    pub applied_mappings: Vec<AppliedMapping>,
    pub confidence: f64,
}

/// Replaces domain synonyms with canonical schema references, per locale.
pub struct TerminologyNormalizer {
    tables: HashMap<Locale, HashMap<&'static str, &'static str>>,
}

impl Default for TerminologyNormalizer {
    fn default() -> Self {
        let mut en = HashMap::new();
        en.insert("footfall", "patient_visits");
        en.insert("revenue", "total_billed_amount");
        en.insert("no_shows", "missed_appointments");
        en.insert("no-shows", "missed_appointments");
        en.insert("headcount", "active_patients");
        en.insert("turnover", "revenue_growth_rate");
        en.insert("ar", "accounts_receivable");
        en.insert("ap", "accounts_payable");
        en.insert("admits", "admissions");

        let mut tables = HashMap::new();
        tables.insert(Locale::En, en.clone());
        // The Arabic path runs after translation, so the same canonical
        // English synonym table applies to the translated text.
        tables.insert(Locale::Ar, en);

        Self { tables }
    }
}

impl TerminologyNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes `text` (already in English, post-translation if the
    /// request was Arabic) against the synonym table for `locale`.
    pub fn normalize(&self, text: &str, locale: Locale) -> NormalizationResult {
        let table = self.tables.get(&locale).cloned().unwrap_or_default();

        let mut applied = Vec::new();
        let words: Vec<String> = text
            .split_whitespace()
            .map(|word| {
                let lower = word.to_ascii_lowercase();
                let trimmed: String = lower
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                    .collect();
                if let Some(canonical) = table.get(trimmed.as_str()) {
                    applied.push(AppliedMapping {
                        synonym: trimmed.clone(),
                        canonical: canonical.to_string(),
                    });
                    canonical.to_string()
                } else {
                    word.to_string()
                }
            })
            .collect();

        let normalized_text = words.join(" ");

        // Confidence decays with the number of simultaneous replacements:
        // zero or one substitution is high agreement, many at once suggests
        // noise (spec.md §4.4).
        let confidence = match applied.len() {
            0 | 1 => 1.0,
            n => (1.0 - 0.05 * (n as f64 - 1.0)).max(0.7),
        };

        NormalizationResult {
            normalized_text,
            applied_mappings: applied,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_named_synonyms() {
        let normalizer = TerminologyNormalizer::new();
        let result = normalizer.normalize("show footfall and revenue", Locale::En);
        assert!(result.normalized_text.contains("patient_visits"));
        assert!(result.normalized_text.contains("total_billed_amount"));
        assert_eq!(result.applied_mappings.len(), 2);
    }

    #[test]
    fn confidence_is_high_with_no_or_one_mapping() {
        let normalizer = TerminologyNormalizer::new();
        let none = normalizer.normalize("show total claims", Locale::En);
        assert_eq!(none.confidence, 1.0);

        let one = normalizer.normalize("show revenue", Locale::En);
        assert_eq!(one.confidence, 1.0);
    }

    #[test]
    fn confidence_decays_and_is_floored() {
        let normalizer = TerminologyNormalizer::new();
        let result = normalizer.normalize(
            "footfall revenue no_shows headcount turnover ar ap admits",
            Locale::En,
        );
        assert!(result.confidence >= 0.7);
        assert!(result.confidence < 1.0);
    }
}
