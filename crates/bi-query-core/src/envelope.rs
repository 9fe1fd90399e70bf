//! Request envelope: identity, locale, deadline, and cancellation carried
//! through every pipeline stage, plus the service bundle stages depend on.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::bus::EventBus;
use crate::executor::WarehouseConnection;
use crate::llm::LLMClient;

/// Locale a request is served in. See [`crate::locale::Locale`] for the
/// richer detector/translator/formatter types; this is the wire-level enum.
pub use crate::locale::Locale;

/// Per-request immutable context carrying identity, locale, deadline, and
/// trace id. Created at the boundary and never mutated; stages read it and
/// check its cancellation/deadline before and after I/O.
#[derive(Clone)]
pub struct Envelope {
    pub trace_id: Uuid,
    pub principal_id: String,
    pub tenant_id: String,
    pub roles: HashSet<String>,
    pub locale: Locale,
    pub received_at: DateTime<Utc>,
    pub deadline: Instant,
    cancel: Arc<Notify>,
    pub services: Arc<ServiceBundle>,
}

impl Envelope {
    pub fn new(
        principal_id: impl Into<String>,
        tenant_id: impl Into<String>,
        locale: Locale,
        timeout: std::time::Duration,
        services: Arc<ServiceBundle>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            principal_id: principal_id.into(),
            tenant_id: tenant_id.into(),
            roles: HashSet::new(),
            locale,
            received_at: Utc::now(),
            deadline: Instant::now() + timeout,
            cancel: Arc::new(Notify::new()),
            services,
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = String>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// True once the deadline has passed or cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Remaining budget before the deadline, or `Duration::ZERO` if expired.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Signal cancellation to anything awaiting [`Envelope::cancelled`].
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    /// Resolves when either the deadline elapses or [`Envelope::cancel`] is
    /// called — suitable as the second branch of a `tokio::select!` around
    /// any suspension point (LLM call, DB call, bus publish/receive).
    pub async fn cancelled(&self) {
        let sleep = tokio::time::sleep_until(self.deadline);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = self.cancel.notified() => {}
        }
    }
}

/// Dependency bundle passed through the envelope rather than held in
/// process-wide singletons (spec design note: "wrap provider selection in
/// an explicit dependency... no process-wide singleton").
pub struct ServiceBundle {
    pub llm: Arc<dyn LLMClient>,
    pub warehouse: Arc<dyn WarehouseConnection>,
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditSink>,
}

/// A natural-language question to be answered.
#[derive(Clone)]
pub struct QueryRequest {
    pub envelope: Envelope,
    pub nl_text: String,
    pub explicit_locale: Option<Locale>,
}

impl QueryRequest {
    pub fn new(envelope: Envelope, nl_text: impl Into<String>) -> Self {
        Self {
            envelope,
            nl_text: nl_text.into(),
            explicit_locale: None,
        }
    }

    pub fn with_explicit_locale(mut self, locale: Locale) -> Self {
        self.explicit_locale = Some(locale);
        self
    }
}

/// Terminal routing action attached to a [`QueryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    Answered,
    Clarify,
    Reject,
    Timeout,
}

/// The final, formatted answer to a [`QueryRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub trace_id: Uuid,
    pub sql_executed: Option<String>,
    pub parameters: Vec<serde_json::Value>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub chart_spec: Option<crate::viz::ChartSpec>,
    pub confidence: Option<crate::confidence::ConfidenceScore>,
    pub routing_action: RoutingAction,
    pub explanation: String,
    pub trace: QueryTrace,
}

impl QueryResult {
    pub fn rejected(trace_id: Uuid, explanation: impl Into<String>, trace: QueryTrace) -> Self {
        Self {
            trace_id,
            sql_executed: None,
            parameters: Vec::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            chart_spec: None,
            confidence: None,
            routing_action: RoutingAction::Reject,
            explanation: explanation.into(),
            trace,
        }
    }

    pub fn clarify(trace_id: Uuid, question: impl Into<String>, trace: QueryTrace) -> Self {
        Self {
            trace_id,
            sql_executed: None,
            parameters: Vec::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            chart_spec: None,
            confidence: None,
            routing_action: RoutingAction::Clarify,
            explanation: question.into(),
            trace,
        }
    }

    pub fn timed_out(trace_id: Uuid, trace: QueryTrace) -> Self {
        Self {
            trace_id,
            sql_executed: None,
            parameters: Vec::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            chart_spec: None,
            confidence: None,
            routing_action: RoutingAction::Timeout,
            explanation: "request deadline exceeded".to_string(),
            trace,
        }
    }
}

/// Per-stage latency and token/cost accumulator, attached to every
/// `QueryResult` so the Council/deliberation endpoint can report scoring
/// provenance (spec.md §6 mentions it; nothing else in the pipeline needs
/// to pay for this beyond what stages already measure).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryTrace {
    pub stage_latencies_ms: Vec<(String, u64)>,
    pub retries: u32,
    pub llm_cost_usd: f64,
}

impl QueryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stage(&mut self, stage: impl Into<String>, elapsed: std::time::Duration) {
        self.stage_latencies_ms
            .push((stage.into(), elapsed.as_millis() as u64));
    }
}

/// Uniform return type every pipeline stage produces. Short-circuits
/// (anything but `Proceed`) propagate immediately to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageOutcome<T> {
    Proceed(T),
    Clarify(String),
    Reject(String),
    Retry(String),
}

impl<T> StageOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            StageOutcome::Proceed(v) => StageOutcome::Proceed(f(v)),
            StageOutcome::Clarify(m) => StageOutcome::Clarify(m),
            StageOutcome::Reject(m) => StageOutcome::Reject(m),
            StageOutcome::Retry(m) => StageOutcome::Retry(m),
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, StageOutcome::Proceed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_tracks_roles() {
        let services = test_services();
        let envelope = Envelope::new(
            "user-1",
            "tenant-a",
            Locale::En,
            std::time::Duration::from_secs(5),
            services,
        )
        .with_roles(["analyst".to_string()]);

        assert!(envelope.has_role("analyst"));
        assert!(!envelope.has_role("admin"));
        assert!(!envelope.is_cancelled());
    }

    #[test]
    fn stage_outcome_maps_only_proceed() {
        let outcome: StageOutcome<i32> = StageOutcome::Proceed(1);
        assert!(matches!(outcome.map(|v| v + 1), StageOutcome::Proceed(2)));

        let rejected: StageOutcome<i32> = StageOutcome::Reject("nope".to_string());
        assert!(matches!(rejected.map(|v| v + 1), StageOutcome::Reject(_)));
    }

    pub(crate) fn test_services() -> Arc<ServiceBundle> {
        use crate::executor::SqliteWarehouse;
        use crate::llm::{ClientConfig, OllamaClient};

        Arc::new(ServiceBundle {
            llm: Arc::new(OllamaClient::new(ClientConfig::new(""))),
            warehouse: Arc::new(
                SqliteWarehouse::open_in_memory().expect("in-memory warehouse"),
            ),
            bus: Arc::new(EventBus::new(Default::default())),
            audit: Arc::new(AuditSink::open_in_memory().expect("in-memory audit sink")),
        })
    }
}
