//! Supervisor: a read-biased registry of pipeline stages, dispatching each
//! query through them in order and exposing a cached health snapshot.
//!
//! Grounded on the teacher's `PromptCache` registry shape
//! (`Arc<tokio::sync::RwLock<HashMap<_, _>>>` guarding shared mutable state
//! behind a read-mostly lock) generalized from a cache table to a stage
//! registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::envelope::Envelope;
use crate::error::Result;

/// Identifies one stage of the query pipeline, in the order a request flows
/// through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    PolicyGate,
    LocaleDetector,
    Translator,
    HallucinationGuard,
    TerminologyNormalizer,
    SchemaRetriever,
    SqlGenerator,
    SqlValidator,
    Executor,
    SelfCorrector,
    VisualizationRouter,
    ConfidenceScorer,
    Formatter,
}

impl StageId {
    /// The fixed dispatch order a query envelope flows through, per spec.md
    /// §2's pipeline diagram.
    pub const ORDER: [StageId; 13] = [
        StageId::PolicyGate,
        StageId::LocaleDetector,
        StageId::Translator,
        StageId::HallucinationGuard,
        StageId::TerminologyNormalizer,
        StageId::SchemaRetriever,
        StageId::SqlGenerator,
        StageId::SqlValidator,
        StageId::Executor,
        StageId::SelfCorrector,
        StageId::VisualizationRouter,
        StageId::ConfidenceScorer,
        StageId::Formatter,
    ];
}

/// A registered pipeline stage. Stages are free to hold their own internal
/// state (an LLM client, a compiled rule table); the Supervisor only owns
/// the registry and the dispatch order.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Runs the stage against the shared envelope. Stages communicate
    /// proceed/stop decisions out-of-band via `StageOutcome` in their own
    /// concrete return types; this trait method exists for registry-level
    /// health checks and generic dispatch bookkeeping.
    async fn check_health(&self, envelope: &Envelope) -> Result<()>;
}

/// Point-in-time health snapshot, recomputed at most once per
/// `refresh_interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub healthy_stages: Vec<StageId>,
    pub unhealthy_stages: Vec<(StageId, String)>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy_stages.is_empty()
    }
}

struct CachedHealth {
    snapshot: HealthSnapshot,
    computed_at: std::time::Instant,
}

/// Registry of pipeline stages plus a cached health snapshot. Reads (stage
/// lookups during dispatch) vastly outnumber writes (stage registration at
/// startup), so the registry is an `RwLock` rather than a `Mutex`.
pub struct Supervisor {
    stages: RwLock<HashMap<StageId, Arc<dyn Stage>>>,
    health: RwLock<Option<CachedHealth>>,
    refresh_interval: Duration,
}

impl Supervisor {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            stages: RwLock::new(HashMap::new()),
            health: RwLock::new(None),
            refresh_interval,
        }
    }

    pub async fn register(&self, stage: Arc<dyn Stage>) {
        let mut stages = self.stages.write().await;
        stages.insert(stage.id(), stage);
    }

    pub async fn dispatch(&self, stage_id: StageId) -> Option<Arc<dyn Stage>> {
        let stages = self.stages.read().await;
        stages.get(&stage_id).cloned()
    }

    pub async fn registered_stage_ids(&self) -> Vec<StageId> {
        let stages = self.stages.read().await;
        stages.keys().copied().collect()
    }

    /// Returns the cached snapshot if still fresh, otherwise recomputes it
    /// by checking every registered stage.
    pub async fn check_health(&self, envelope: &Envelope) -> HealthSnapshot {
        {
            let cached = self.health.read().await;
            if let Some(cached) = cached.as_ref() {
                if cached.computed_at.elapsed() < self.refresh_interval {
                    return cached.snapshot.clone();
                }
            }
        }

        let stages = self.stages.read().await;
        let mut healthy_stages = Vec::new();
        let mut unhealthy_stages = Vec::new();

        for (id, stage) in stages.iter() {
            match stage.check_health(envelope).await {
                Ok(()) => healthy_stages.push(*id),
                Err(e) => unhealthy_stages.push((*id, e.to_string())),
            }
        }
        drop(stages);

        healthy_stages.sort_by_key(|id| StageId::ORDER.iter().position(|o| o == id));
        unhealthy_stages.sort_by_key(|(id, _)| StageId::ORDER.iter().position(|o| o == id));

        let snapshot = HealthSnapshot {
            checked_at: Utc::now(),
            healthy_stages,
            unhealthy_stages,
        };

        let mut health = self.health.write().await;
        *health = Some(CachedHealth {
            snapshot: snapshot.clone(),
            computed_at: std::time::Instant::now(),
        });

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ServiceBundle;
    use crate::error::Error;

    struct AlwaysHealthy(StageId);

    #[async_trait]
    impl Stage for AlwaysHealthy {
        fn id(&self) -> StageId {
            self.0
        }

        async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysUnhealthy(StageId);

    #[async_trait]
    impl Stage for AlwaysUnhealthy {
        fn id(&self) -> StageId {
            self.0
        }

        async fn check_health(&self, _envelope: &Envelope) -> Result<()> {
            Err(Error::ExecutionFailed("down".to_string()))
        }
    }

    fn test_envelope(services: Arc<ServiceBundle>) -> Envelope {
        Envelope::new(
            "principal-1",
            "tenant-a",
            crate::locale::Locale::En,
            Duration::from_secs(5),
            services,
        )
    }

    #[tokio::test]
    async fn registers_and_dispatches_stages() {
        let supervisor = Supervisor::new(Duration::from_secs(60));
        supervisor
            .register(Arc::new(AlwaysHealthy(StageId::PolicyGate)))
            .await;

        assert!(supervisor.dispatch(StageId::PolicyGate).await.is_some());
        assert!(supervisor.dispatch(StageId::Executor).await.is_none());
    }

    #[tokio::test]
    async fn health_snapshot_reports_unhealthy_stages() {
        let services = crate::envelope::tests::test_services();
        let envelope = test_envelope(services);

        let supervisor = Supervisor::new(Duration::from_secs(60));
        supervisor
            .register(Arc::new(AlwaysHealthy(StageId::PolicyGate)))
            .await;
        supervisor
            .register(Arc::new(AlwaysUnhealthy(StageId::Executor)))
            .await;

        let snapshot = supervisor.check_health(&envelope).await;
        assert!(!snapshot.is_healthy());
        assert_eq!(snapshot.unhealthy_stages.len(), 1);
        assert_eq!(snapshot.unhealthy_stages[0].0, StageId::Executor);
    }

    #[tokio::test]
    async fn health_snapshot_is_cached_within_refresh_interval() {
        let services = crate::envelope::tests::test_services();
        let envelope = test_envelope(services);

        let supervisor = Supervisor::new(Duration::from_secs(3600));
        supervisor
            .register(Arc::new(AlwaysHealthy(StageId::PolicyGate)))
            .await;

        let first = supervisor.check_health(&envelope).await;
        supervisor
            .register(Arc::new(AlwaysUnhealthy(StageId::Executor)))
            .await;
        let second = supervisor.check_health(&envelope).await;

        // Cached snapshot should not reflect the newly registered unhealthy
        // stage because the refresh interval has not elapsed.
        assert_eq!(first.checked_at, second.checked_at);
        assert!(second.is_healthy());
    }
}
