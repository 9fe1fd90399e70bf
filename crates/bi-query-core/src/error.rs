//! Error types for bi-query-core.

use thiserror::Error;

use crate::locale::Locale;

/// Result type alias using bi-query-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while a request moves through the gateway pipeline.
///
/// Variant names line up with the error kinds a client sees in a
/// `QueryResult::Error` response, so a pipeline stage can construct the
/// right variant directly rather than laundering everything through a
/// single string.
#[derive(Error, Debug)]
pub enum Error {
    /// The request envelope itself was malformed (missing principal, empty
    /// question text, unparseable locale hint, etc).
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// No principal/credentials were attached to the request.
    #[error("unauthenticated request")]
    Unauthenticated,

    /// The Policy Gate rejected the request before any SQL was generated.
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    /// The detected or requested locale isn't one the gateway can serve.
    #[error("unsupported locale: {0}")]
    LocaleUnsupported(String),

    /// The question doesn't resolve to a BI/analytics intent.
    #[error("off-topic question: {0}")]
    OffTopic(String),

    /// The question is ambiguous and needs user clarification before
    /// SQL generation can proceed.
    #[error("ambiguous question: {0}")]
    Ambiguous(String),

    /// The configured LLM provider could not be reached or returned a
    /// transport-level failure.
    #[error("LLM provider unavailable: {provider} - {message}")]
    LlmUnavailable { provider: String, message: String },

    /// The Text-to-SQL Generator failed to produce a candidate query.
    #[error("SQL generation failed: {0}")]
    SqlGenerationFailed(String),

    /// The Validator or Hallucination Guard rejected the generated SQL.
    #[error("unsafe SQL rejected: {0}")]
    SqlUnsafe(String),

    /// The warehouse rejected or failed to run the query.
    #[error("query execution failed: {0}")]
    ExecutionFailed(String),

    /// The warehouse query exceeded its deadline.
    #[error("query execution timed out after {duration_ms}ms")]
    ExecutionTimeout { duration_ms: u64 },

    /// Response formatting/masking could not be completed safely.
    #[error("masking failed: {0}")]
    MaskingFailed(String),

    /// A downstream dependency (schema catalog, terminology store, ...)
    /// did not respond.
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// The event bus could not accept or deliver an event.
    #[error("event bus unavailable: {0}")]
    BusUnavailable(String),

    /// Audit sink persistence failed.
    #[error("audit sink error: {0}")]
    AuditSink(String),

    /// LLM error (simple variant, kept for the typed-prompting layer).
    #[error("LLM error: {0}")]
    LLM(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error that doesn't fit another category.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a policy-denied error.
    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// Create an LLM-unavailable error.
    pub fn llm_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an execution-timeout error.
    pub fn execution_timeout(duration_ms: u64) -> Self {
        Self::ExecutionTimeout { duration_ms }
    }

    /// The stable error-kind string carried on the wire (`Envelope`
    /// responses report this instead of the `Display` message so clients
    /// can branch on it without string matching).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputInvalid(_) => "input_invalid",
            Self::Unauthenticated => "unauthenticated",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::LocaleUnsupported(_) => "locale_unsupported",
            Self::OffTopic(_) => "off_topic",
            Self::Ambiguous(_) => "ambiguous",
            Self::LlmUnavailable { .. } => "llm_unavailable",
            Self::SqlGenerationFailed(_) => "sql_generation_failed",
            Self::SqlUnsafe(_) => "sql_unsafe",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::MaskingFailed(_) => "masking_failed",
            Self::DownstreamUnavailable(_) => "downstream_unavailable",
            Self::BusUnavailable(_) => "bus_unavailable",
            Self::AuditSink(_) => "internal",
            Self::LLM(_) => "llm_unavailable",
            Self::Serialization(_) => "internal",
            Self::Config(_) => "internal",
            Self::Internal(_) => "internal",
        }
    }

    /// User-facing, localized rendering of this error's [`Error::kind`].
    /// The `Display` string above (rule id, driver message, LLM transport
    /// error) is for logs and the audit trail, not the caller — spec.md §7:
    /// "User-visible messages are always localized... and never leak
    /// identifiers of internal components."
    pub fn localized_message(&self, locale: Locale) -> String {
        localized_kind_message(self.kind(), locale)
    }
}

/// Locale-keyed reject/clarify message table, keyed by [`Error::kind`] plus
/// a couple of pipeline-internal reasons that never construct an `Error`
/// (e.g. a generated candidate with no usable SQL). Mirrors
/// `hallucination.rs`'s per-locale message functions, centralized here
/// since several stages (policy, self-corrector, executor) reject/clarify
/// with the same handful of kinds.
pub fn localized_kind_message(kind: &str, locale: Locale) -> String {
    match (kind, locale) {
        ("policy_denied", Locale::En) => {
            "This request was blocked by data-access policy and cannot be run.".to_string()
        }
        ("policy_denied", Locale::Ar) => {
            "تم رفض هذا الطلب بموجب سياسة الوصول إلى البيانات ولا يمكن تنفيذه.".to_string()
        }
        ("sql_unsafe", Locale::En) => {
            "The generated query did not pass safety checks, so it was not run.".to_string()
        }
        ("sql_unsafe", Locale::Ar) => {
            "لم يجتز الاستعلام الذي تم إنشاؤه فحوصات السلامة، لذا لم يتم تنفيذه.".to_string()
        }
        ("sql_generation_failed", Locale::En) => {
            "I couldn't generate a query for that question. Could you try rephrasing it?".to_string()
        }
        ("sql_generation_failed", Locale::Ar) => {
            "تعذر إنشاء استعلام لهذا السؤال. هل يمكنك إعادة صياغته؟".to_string()
        }
        ("sql_candidate_unusable", Locale::En) => {
            "I couldn't turn that into a runnable query. Could you add more detail?".to_string()
        }
        ("sql_candidate_unusable", Locale::Ar) => {
            "تعذر تحويل ذلك إلى استعلام قابل للتنفيذ. هل يمكنك إضافة مزيد من التفاصيل؟".to_string()
        }
        ("execution_failed", Locale::En) => {
            "The query couldn't be executed against the warehouse.".to_string()
        }
        ("execution_failed", Locale::Ar) => {
            "تعذر تنفيذ الاستعلام على مستودع البيانات.".to_string()
        }
        (_, Locale::En) => "This request could not be completed.".to_string(),
        (_, Locale::Ar) => "تعذر إكمال هذا الطلب.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_for_client_branching() {
        assert_eq!(Error::policy_denied("test").kind(), "policy_denied");
        assert_eq!(Error::execution_timeout(500).kind(), "execution_timeout");
        assert_eq!(Error::Unauthenticated.kind(), "unauthenticated");
    }

    #[test]
    fn localized_message_differs_by_locale() {
        let error = Error::policy_denied("stacked-statement separator outside literals");
        let en = error.localized_message(Locale::En);
        let ar = error.localized_message(Locale::Ar);
        assert_ne!(en, ar);
        assert!(!en.contains("stacked-statement"), "internal rule id must not leak to the caller");
    }

    #[test]
    fn unknown_kind_falls_back_to_generic_message() {
        let en = localized_kind_message("not_a_real_kind", Locale::En);
        let ar = localized_kind_message("not_a_real_kind", Locale::Ar);
        assert_ne!(en, ar);
    }
}
