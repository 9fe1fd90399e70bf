//! Locale detection, Arabic-to-English translation, and locale-aware
//! number/currency formatting.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported locales. Unsupported values fall back to [`Locale::En`] silently
/// (spec.md §6: "Unsupported values fall back to default silently").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    En,
    Ar,
}

impl Locale {
    pub fn parse_or_default(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ar" => Locale::Ar,
            _ => Locale::En,
        }
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locale::En => write!(f, "en"),
            Locale::Ar => write!(f, "ar"),
        }
    }
}

/// How a [`LocaleDetection`] was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Explicit,
    Heuristic,
    Statistical,
}

/// Result of running the Locale Detector over free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocaleDetection {
    pub locale: Locale,
    pub confidence: f64,
    pub method: DetectionMethod,
}

const ARABIC_KEYWORDS: &[&str] = &["إيرادات", "مريض", "عيادة", "فاتورة", "تقرير"];

/// Detects whether free text is English or Arabic.
///
/// Priority order per spec.md §4.3: explicit override, then a character-ratio
/// analysis over letters only (ASCII a-z/A-Z counted English; the five named
/// Arabic Unicode blocks counted Arabic), then keyword boosting.
pub struct LocaleDetector;

impl LocaleDetector {
    pub fn detect(text: &str, explicit: Option<Locale>) -> LocaleDetection {
        if let Some(locale) = explicit {
            return LocaleDetection {
                locale,
                confidence: 0.99,
                method: DetectionMethod::Explicit,
            };
        }

        let (arabic_letters, english_letters) = letter_counts(text);
        let total = arabic_letters + english_letters;

        if total == 0 {
            return LocaleDetection {
                locale: Locale::En,
                confidence: 0.5,
                method: DetectionMethod::Heuristic,
            };
        }

        let arabic_ratio = arabic_letters as f64 / total as f64;
        let mut locale = if arabic_ratio >= 0.5 {
            Locale::Ar
        } else {
            Locale::En
        };
        let mut confidence = (arabic_ratio - 0.5).abs() * 2.0;
        let mut method = DetectionMethod::Heuristic;

        if ARABIC_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            locale = Locale::Ar;
            confidence = (confidence + 0.2).min(0.99);
            method = DetectionMethod::Statistical;
        }

        LocaleDetection {
            locale,
            // Confidence must not exceed 0.99 (spec.md §4.3).
            confidence: confidence.min(0.99),
            method,
        }
    }
}

fn is_arabic_letter(c: char) -> bool {
    let cp = c as u32;
    (0x0600..=0x06FF).contains(&cp)
        || (0x0750..=0x077F).contains(&cp)
        || (0x08A0..=0x08FF).contains(&cp)
        || (0xFB50..=0xFDFF).contains(&cp)
        || (0xFE70..=0xFEFF).contains(&cp)
}

fn letter_counts(text: &str) -> (usize, usize) {
    let mut arabic = 0usize;
    let mut english = 0usize;
    for c in text.chars() {
        if is_arabic_letter(c) {
            arabic += 1;
        } else if c.is_ascii_alphabetic() {
            english += 1;
        }
    }
    (arabic, english)
}

/// Maps Arabic intent to an English canonical question, used only when the
/// detected locale is Arabic.
pub struct Translator {
    dictionary: HashMap<&'static str, &'static str>,
}

impl Default for Translator {
    fn default() -> Self {
        let mut dictionary = HashMap::new();
        dictionary.insert("إيرادات", "revenue");
        dictionary.insert("مريض", "patient");
        dictionary.insert("مرضى", "patients");
        dictionary.insert("عيادة", "clinic");
        dictionary.insert("فاتورة", "invoice");
        dictionary.insert("تقرير", "report");
        dictionary.insert("شهر", "month");
        dictionary.insert("يناير", "january");
        dictionary.insert("أظهر", "show");
        Self { dictionary }
    }
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dictionary-pass translation. Unknown tokens are preserved so an
    /// optional LLM pass (when configured) has recognisable anchors to work
    /// from instead of a fully opaque string.
    pub fn translate(&self, arabic_text: &str) -> String {
        let translated: Vec<String> = arabic_text
            .split_whitespace()
            .map(|token| {
                let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
                self.dictionary
                    .get(trimmed)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| token.to_string())
            })
            .collect();
        normalize_whitespace(&translated.join(" "))
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Per-currency decimal-place counts. Only Gulf dinars use three decimals in
/// this domain's currency universe (spec.md names KWD explicitly; BHD/OMR
/// are the same-shape supplement noted in SPEC_FULL.md).
fn currency_decimals(code: &str) -> u32 {
    match code {
        "JPY" => 0,
        "KWD" | "BHD" | "OMR" => 3,
        _ => 2,
    }
}

const EASTERN_ARABIC_DIGITS: [char; 10] = ['٠', '١', '٢', '٣', '٤', '٥', '٦', '٧', '٨', '٩'];
const ARABIC_DECIMAL_SEPARATOR: char = '\u{066B}';
const ARABIC_THOUSANDS_SEPARATOR: char = '\u{066C}';

/// Formats numbers, currencies, and compact magnitudes for a locale.
///
/// Per spec.md §9's design note: format with Western digits/separators
/// first, then — for Arabic — convert the whole formatted string
/// digit-by-digit and separator-by-separator. Never mix code paths.
pub struct NumberFormatter;

impl NumberFormatter {
    /// Formats a plain number (no currency) with thousands grouping.
    pub fn format_number(value: f64, locale: Locale, decimals: u32) -> String {
        let western = format_western(value, decimals);
        match locale {
            Locale::En => western,
            Locale::Ar => to_eastern_arabic(&western),
        }
    }

    pub fn format_currency(value: f64, currency_code: &str, locale: Locale) -> String {
        let decimals = currency_decimals(currency_code);
        let number = format_western(value, decimals);
        match locale {
            Locale::En => format!("{currency_code} {number}"),
            Locale::Ar => format!("{} {currency_code}", to_eastern_arabic(&number)),
        }
    }

    /// Converts every Western-digit numeric literal embedded in free text
    /// (e.g. the generator's rationale) to Eastern Arabic digits and
    /// separators for `Locale::Ar`; a no-op for `Locale::En`. Row cells go
    /// through `format_number`/`format_currency` directly since their type
    /// is known; free text has no structure to key a formatter off of, so
    /// this scans for numeric substrings and converts each in place.
    pub fn format_text_numerals(text: &str, locale: Locale) -> String {
        if locale == Locale::En {
            return text.to_string();
        }
        let digits = regex::Regex::new(r"[0-9]+(?:,[0-9]{3})*(?:\.[0-9]+)?").unwrap();
        digits
            .replace_all(text, |caps: &regex::Captures| to_eastern_arabic(&caps[0]))
            .into_owned()
    }

    /// Converts a previously Eastern-Arabic-formatted string back to its
    /// Western-digit canonical form (round-trip property in spec.md §8.6).
    pub fn to_western(formatted: &str) -> String {
        formatted
            .chars()
            .map(|c| {
                if let Some(pos) = EASTERN_ARABIC_DIGITS.iter().position(|&d| d == c) {
                    char::from_digit(pos as u32, 10).unwrap()
                } else if c == ARABIC_DECIMAL_SEPARATOR {
                    '.'
                } else if c == ARABIC_THOUSANDS_SEPARATOR {
                    ','
                } else {
                    c
                }
            })
            .collect()
    }
}

fn format_western(value: f64, decimals: u32) -> String {
    let negative = value < 0.0;
    let value = value.abs();
    let formatted = format!("{:.*}", decimals as usize, value);
    let (integer_part, fractional_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let grouped = group_thousands(integer_part);
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(frac) = fractional_part {
        out.push('.');
        out.push_str(frac);
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let bytes = digits.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 3);
    for (i, b) in bytes.iter().enumerate() {
        let remaining = bytes.len() - i;
        if i > 0 && remaining % 3 == 0 {
            out.push(b',');
        }
        out.push(*b);
    }
    String::from_utf8(out).unwrap()
}

fn to_eastern_arabic(western: &str) -> String {
    western
        .chars()
        .map(|c| match c {
            '0'..='9' => EASTERN_ARABIC_DIGITS[c.to_digit(10).unwrap() as usize],
            '.' => ARABIC_DECIMAL_SEPARATOR,
            ',' => ARABIC_THOUSANDS_SEPARATOR,
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_locale_wins_over_text() {
        let detection = LocaleDetector::detect("مريض", Some(Locale::En));
        assert_eq!(detection.locale, Locale::En);
        assert_eq!(detection.method, DetectionMethod::Explicit);
        assert!(detection.confidence <= 0.99);
    }

    #[test]
    fn arabic_text_is_detected() {
        let detection = LocaleDetector::detect("أظهر إيرادات العيادة لشهر يناير", None);
        assert_eq!(detection.locale, Locale::Ar);
        assert!(detection.confidence <= 0.99);
    }

    #[test]
    fn english_text_is_detected() {
        let detection = LocaleDetector::detect("What is total revenue in January?", None);
        assert_eq!(detection.locale, Locale::En);
    }

    #[test]
    fn translator_maps_known_tokens_and_preserves_unknown() {
        let translator = Translator::new();
        let out = translator.translate("أظهر إيرادات العيادة");
        assert!(out.contains("show"));
        assert!(out.contains("revenue"));
        assert!(out.contains("clinic"));
    }

    #[test]
    fn eastern_arabic_digit_roundtrip() {
        let formatted = NumberFormatter::format_number(12345.67, Locale::Ar, 2);
        for c in formatted.chars() {
            assert!(!c.is_ascii_digit(), "expected no Western digits in {formatted}");
        }
        let back = NumberFormatter::to_western(&formatted);
        assert_eq!(back, "12,345.67");
    }

    #[test]
    fn currency_decimal_places_follow_table() {
        assert_eq!(currency_decimals("JPY"), 0);
        assert_eq!(currency_decimals("KWD"), 3);
        assert_eq!(currency_decimals("BHD"), 3);
        assert_eq!(currency_decimals("OMR"), 3);
        assert_eq!(currency_decimals("USD"), 2);
    }

    #[test]
    fn text_numerals_are_converted_for_arabic_and_untouched_for_english() {
        let text = "Totals 12,345.67 across 3 months.";
        let en = NumberFormatter::format_text_numerals(text, Locale::En);
        assert_eq!(en, text);

        let ar = NumberFormatter::format_text_numerals(text, Locale::Ar);
        assert!(!ar.chars().any(|c| c.is_ascii_digit()), "expected no Western digits in {ar}");
        assert!(ar.contains(ARABIC_DECIMAL_SEPARATOR));
        assert!(ar.contains(ARABIC_THOUSANDS_SEPARATOR));
    }

    #[test]
    fn currency_formatting_places_symbol_per_locale() {
        let en = NumberFormatter::format_currency(1200.5, "USD", Locale::En);
        assert!(en.starts_with("USD"));
        let ar = NumberFormatter::format_currency(1200.5, "USD", Locale::Ar);
        assert!(ar.ends_with("USD"));
    }
}
