//! ETL quality worker: a durable-subscription consumer loop that drains
//! [`crate::bus::subjects::SYNC_COMPLETED`] events and runs them through the
//! [`crate::quality::QualityValidator`].
//!
//! Grounded on the teacher's background-task spawn pattern (a `tokio::spawn`
//! loop reading from a channel until a shutdown signal fires), generalized
//! here from REPL input polling to durable-bus polling with manual ack.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::audit::AuditSink;
use crate::bus::{subjects, EventBus};
use crate::quality::{parse_sync_event, QualityDataSource, QualityValidator};

/// How long a single `receive` poll blocks before checking the shutdown
/// signal again.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One running worker's handle plus its shutdown trigger.
pub struct EtlWorker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl EtlWorker {
    /// Signals the worker loop to exit after its current poll and waits for
    /// it to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

/// Spawns a durable-subscription consumer named `worker_name` that drains
/// [`subjects::SYNC_COMPLETED`], validates each batch, and acks on success.
///
/// A deserialization failure or a validation error is logged and the
/// delivery is left unacknowledged so it redelivers after the bus's
/// visibility timeout (spec.md §4.14's at-least-once contract) rather than
/// being silently dropped.
pub fn spawn_worker(
    worker_name: impl Into<String>,
    bus: Arc<EventBus>,
    validator: Arc<QualityValidator>,
    source: Arc<dyn QualityDataSource>,
    audit: Arc<AuditSink>,
) -> EtlWorker {
    let worker_name = worker_name.into();
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();

    let handle = tokio::spawn(async move {
        let subscription = bus
            .subscribe_durable(worker_name.clone(), subjects::SYNC_COMPLETED)
            .await;

        loop {
            let received = tokio::select! {
                envelope = subscription.receive(POLL_INTERVAL) => envelope,
                _ = shutdown_signal.notified() => break,
            };

            let Some(envelope) = received else {
                continue;
            };

            let event = match parse_sync_event(&envelope.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        worker = %worker_name,
                        delivery_id = %envelope.delivery_id,
                        error = %e,
                        "dropping sync.completed event: could not parse payload"
                    );
                    continue;
                }
            };

            match validator.validate(&event, source.as_ref(), &audit, &bus).await {
                Ok(report) => {
                    if let Err(e) = subscription.ack(envelope.delivery_id).await {
                        tracing::warn!(worker = %worker_name, error = %e, "ack failed");
                    }
                    tracing::info!(
                        worker = %worker_name,
                        batch_id = %report.batch_id,
                        passed = report.validation_passed,
                        "quality report persisted"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %worker_name,
                        batch_id = %event.batch_id,
                        error = %e,
                        "quality validation failed; leaving event unacked for redelivery"
                    );
                }
            }
        }
    });

    EtlWorker { handle, shutdown }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::executor::Row;
    use crate::quality::QualityConfig;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct EmptySource;

    #[async_trait]
    impl QualityDataSource for EmptySource {
        async fn sample_rows(&self, _entity: &str, _cap: usize) -> crate::error::Result<Vec<Row>> {
            Ok(vec![])
        }

        async fn count_duplicates(
            &self,
            _entity: &str,
            _business_key: (&str, &str),
        ) -> crate::error::Result<u64> {
            Ok(0)
        }

        async fn count_referential_violations(&self, _entity: &str) -> crate::error::Result<u64> {
            Ok(0)
        }

        async fn row_count(&self, _entity: &str) -> crate::error::Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn worker_validates_and_acks_published_event() {
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let audit = Arc::new(AuditSink::open_in_memory().unwrap());
        let validator = Arc::new(QualityValidator::new(QualityConfig::default()));
        let source: Arc<dyn QualityDataSource> = Arc::new(EmptySource);

        let worker = spawn_worker(
            "quality-worker-test",
            bus.clone(),
            validator,
            source,
            audit.clone(),
        );

        let batch_id = Uuid::new_v4();
        bus.publish(
            subjects::SYNC_COMPLETED,
            serde_json::json!({
                "batch_id": batch_id,
                "source": "erp",
                "entity": "invoices",
                "required_columns": [],
                "business_key": ["source", "source_id"],
                "range_rules": [],
                "processed": 0,
                "inserted": 0,
                "updated": 0,
                "quarantined": 0,
                "occurred_at": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await
        .unwrap();

        // Give the spawned task a chance to drain the event.
        for _ in 0..50 {
            if audit.count_quality_reports(batch_id).unwrap_or(0) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(audit.count_quality_reports(batch_id).unwrap(), 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_panicking() {
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let audit = Arc::new(AuditSink::open_in_memory().unwrap());
        let validator = Arc::new(QualityValidator::new(QualityConfig::default()));
        let source: Arc<dyn QualityDataSource> = Arc::new(EmptySource);

        let worker = spawn_worker("quality-worker-malformed", bus.clone(), validator, source, audit);

        bus.publish(subjects::SYNC_COMPLETED, serde_json::json!({"not": "a sync event"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown().await;
    }
}
