//! SQL Self-Corrector: on execution failure, diagnoses the error class and
//! either rewrites the SQL once using the executor's error as feedback, or
//! gives up.
//!
//! Grounded directly on the teacher's `FallbackLoop` retry-envelope shape
//! (max-iteration count, trigger classification, rewrite-then-retry),
//! generalized here from "REPL-submit retry" to "SQL diagnose → rewrite →
//! re-execute."

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Classification of the error that triggered a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionTrigger {
    SyntaxError,
    UnknownIdentifier,
    TypeMismatch,
    PermissionDenied,
    Timeout,
}

impl CorrectionTrigger {
    /// Classifies a warehouse error message into a trigger, falling back to
    /// treating unrecognized messages as syntax errors — the most common
    /// recoverable class and the one most likely to benefit from a rewrite.
    pub fn classify(error: &Error) -> Self {
        match error {
            Error::ExecutionTimeout { .. } => CorrectionTrigger::Timeout,
            Error::ExecutionFailed(message) => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    CorrectionTrigger::PermissionDenied
                } else if lower.contains("no such column") || lower.contains("unknown column") || lower.contains("not found") {
                    CorrectionTrigger::UnknownIdentifier
                } else if lower.contains("type") && (lower.contains("mismatch") || lower.contains("cannot compare")) {
                    CorrectionTrigger::TypeMismatch
                } else {
                    CorrectionTrigger::SyntaxError
                }
            }
            _ => CorrectionTrigger::SyntaxError,
        }
    }

    /// Permission failures should never be retried with a rewrite — more
    /// SQL cannot fix an authorization problem.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CorrectionTrigger::PermissionDenied)
    }
}

/// Record of one correction attempt, fed into confidence scoring's
/// `retry_penalty`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionAttempt {
    pub attempt_number: u32,
    pub trigger: CorrectionTrigger,
    pub feedback: String,
    pub rewritten_sql: Option<String>,
}

/// Bounds and drives the retry loop. Default max retries is 3 including the
/// original attempt (spec.md §4.9).
pub struct SelfCorrector {
    max_retries: u32,
}

impl Default for SelfCorrector {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl SelfCorrector {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Builds the next correction attempt, or `None` if retries are
    /// exhausted or the error class isn't retryable.
    pub fn next_attempt(
        &self,
        previous_attempts: &[CorrectionAttempt],
        error: &Error,
    ) -> Option<CorrectionAttempt> {
        let attempt_number = previous_attempts.len() as u32 + 1;
        if attempt_number >= self.max_retries {
            tracing::debug!(attempt_number, max_retries = self.max_retries, "retries exhausted");
            return None;
        }

        let trigger = CorrectionTrigger::classify(error);
        if !trigger.is_retryable() {
            tracing::debug!(?trigger, "non-retryable error; stopping correction loop");
            return None;
        }

        Some(CorrectionAttempt {
            attempt_number,
            trigger,
            feedback: error.to_string(),
            rewritten_sql: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permission_errors() {
        let error = Error::ExecutionFailed("permission denied for table claims".to_string());
        assert_eq!(
            CorrectionTrigger::classify(&error),
            CorrectionTrigger::PermissionDenied
        );
    }

    #[test]
    fn classifies_unknown_identifier() {
        let error = Error::ExecutionFailed("no such column: patient_id".to_string());
        assert_eq!(
            CorrectionTrigger::classify(&error),
            CorrectionTrigger::UnknownIdentifier
        );
    }

    #[test]
    fn classifies_timeout() {
        let error = Error::execution_timeout(1000);
        assert_eq!(CorrectionTrigger::classify(&error), CorrectionTrigger::Timeout);
    }

    #[test]
    fn permission_errors_are_not_retried() {
        let corrector = SelfCorrector::default();
        let error = Error::ExecutionFailed("permission denied".to_string());
        assert!(corrector.next_attempt(&[], &error).is_none());
    }

    #[test]
    fn stops_after_max_retries_including_original() {
        let corrector = SelfCorrector::new(3);
        let error = Error::ExecutionFailed("syntax error near SELECT".to_string());

        let first = corrector.next_attempt(&[], &error).expect("first retry");
        assert_eq!(first.attempt_number, 1);

        let second = corrector
            .next_attempt(&[first], &error)
            .expect("second retry");
        assert_eq!(second.attempt_number, 2);

        // Attempt 3 is the max (original + 2 retries); no further attempt.
        let third = corrector.next_attempt(&[second.clone(), second], &error);
        assert!(third.is_none());
    }
}
