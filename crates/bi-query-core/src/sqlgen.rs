//! Text-to-SQL Generator: prompts an LLM with schema context and produces
//! a candidate SQL query + rationale.
//!
//! Realized as a typed [`Signature`](crate::signature::Signature) so it can
//! be driven through [`crate::module::Predict`] exactly like any other
//! typed prompt in this crate.

use bi_query_core_derive::Signature;
use serde::{Deserialize, Serialize};

/// Typed prompt for SQL generation. Input fields are rendered into the
/// prompt by `Signature::to_prompt`; output fields are parsed back out of
/// the model's response by `Signature::from_response`.
#[derive(Signature)]
#[signature(
    instructions = "You are a careful analytics SQL assistant. Given a warehouse \
schema context and a normalized question, produce a single read-only SELECT \
statement that answers the question. Never use DML or DDL. If the question \
cannot be answered from the given schema, explain why in the rationale and \
leave sql empty."
)]
pub struct SqlGeneration {
    #[input(desc = "The normalized, English-canonical question to answer")]
    pub question: String,

    #[input(desc = "Ranked tables, columns, and query patterns available")]
    pub schema_context: String,

    #[input(desc = "Locale instruction for any embedded date/number literals")]
    pub locale_instruction: String,

    #[output(desc = "A single SELECT statement, or empty if not answerable")]
    pub sql: String,

    #[output(desc = "Short rationale for the generated query, or the reason no query was produced")]
    pub rationale: String,

    #[output(desc = "Short label for the detected analytical intent, e.g. trend, comparison, kpi")]
    pub detected_intent: String,

    #[output(desc = "Confidence in the detected intent, 0 to 1")]
    #[field(default = "0.5")]
    pub intent_confidence: f64,
}

/// A generated candidate, independent of the `Signature` machinery, for
/// callers that just want the parsed shape (spec.md §3's `SQLCandidate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub text: String,
    pub detected_intent: String,
    pub intent_confidence: f64,
    pub schema_matches: Vec<String>,
}

impl SqlCandidate {
    /// True when the model produced no SQL or produced prose only
    /// (spec.md §4.6: "Must NOT claim success if the model produced no SQL
    /// or produced prose only").
    pub fn is_usable(&self) -> bool {
        let trimmed = self.text.trim();
        !trimmed.is_empty() && trimmed.to_ascii_uppercase().starts_with("SELECT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;

    #[test]
    fn instructions_are_present() {
        assert!(SqlGeneration::instructions().contains("read-only"));
    }

    #[test]
    fn input_and_output_fields_match_declared_shape() {
        let inputs = SqlGeneration::input_fields();
        let names: Vec<_> = inputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["question", "schema_context", "locale_instruction"]);

        let outputs = SqlGeneration::output_fields();
        let names: Vec<_> = outputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            ["sql", "rationale", "detected_intent", "intent_confidence"]
        );
    }

    #[test]
    fn candidate_usability_rejects_prose_and_empty() {
        let prose = SqlCandidate {
            text: "I cannot answer that.".to_string(),
            detected_intent: "unknown".to_string(),
            intent_confidence: 0.1,
            schema_matches: vec![],
        };
        assert!(!prose.is_usable());

        let empty = SqlCandidate {
            text: String::new(),
            detected_intent: "unknown".to_string(),
            intent_confidence: 0.0,
            schema_matches: vec![],
        };
        assert!(!empty.is_usable());

        let real = SqlCandidate {
            text: "SELECT 1".to_string(),
            detected_intent: "kpi".to_string(),
            intent_confidence: 0.9,
            schema_matches: vec![],
        };
        assert!(real.is_usable());
    }
}
