//! Event Bus Adapter: in-process pub/sub with durable (named, at-least-once)
//! and ephemeral (best-effort) subscription modes.
//!
//! No external message-bus crate (NATS/Kafka) is pulled in: spec.md §1
//! scopes "raw upstream connectors" and "wire-level connector protocols"
//! out, so the in-process adapter built on `tokio::sync::broadcast` (for
//! ephemeral fan-out) plus an `mpsc`-backed redelivery queue (for durable,
//! acknowledged subscriptions) is the right-sized implementation of the
//! specified contract — subjects, manual ack, visibility-timeout
//! redelivery, drop-oldest overflow with an observable counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One published message, tagged with a delivery id so durable consumers
/// can acknowledge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub delivery_id: Uuid,
    pub subject: String,
    pub payload: serde_json::Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl EventEnvelope {
    fn new(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            subject: subject.into(),
            payload,
            published_at: chrono::Utc::now(),
        }
    }
}

/// Bus-level errors, carried as `Error::BusUnavailable` at the crate
/// boundary; kept as a distinct type here so callers inside this module can
/// match on the specific failure before it's laundered into the crate error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("publish buffer overflowed for subject '{0}'")]
    BufferOverflow(String),
    #[error("no such durable subscription: {0}")]
    UnknownSubscription(String),
    #[error("delivery id {0} is not outstanding")]
    UnknownDelivery(Uuid),
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Error::BusUnavailable(e.to_string())
    }
}

/// In-flight (unacknowledged) delivery, redelivered once its visibility
/// timeout elapses without an ack.
struct Pending {
    envelope: EventEnvelope,
    redeliver_after: tokio::time::Instant,
}

/// A named, at-least-once subscription. Unacknowledged messages redeliver
/// after `visibility_timeout`. Manual ack is the default per spec.md §4.14.
pub struct Subscription {
    name: String,
    subject: String,
    queue: Mutex<VecDeque<EventEnvelope>>,
    pending: Mutex<Vec<Pending>>,
    visibility_timeout: Duration,
    notify: Notify,
}

impl Subscription {
    fn new(name: impl Into<String>, subject: impl Into<String>, visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            subject: subject.into(),
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            visibility_timeout,
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, envelope: EventEnvelope, max_buffered: usize) -> bool {
        let mut queue = self.queue.lock().await;
        if queue.len() >= max_buffered {
            // Overflow policy: drop-oldest with an observable counter
            // (spec.md §4.14); the caller increments the counter.
            queue.pop_front();
            queue.push_back(envelope);
            drop(queue);
            self.notify.notify_one();
            return true;
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_one();
        false
    }

    /// Requeues any pending deliveries whose visibility timeout has
    /// elapsed, then pops the next available message (redelivered ones
    /// first, in original order).
    async fn next(&self) -> Option<EventEnvelope> {
        self.requeue_expired().await;
        let mut queue = self.queue.lock().await;
        let envelope = queue.pop_front()?;
        let mut pending = self.pending.lock().await;
        pending.push(Pending {
            envelope: envelope.clone(),
            redeliver_after: tokio::time::Instant::now() + self.visibility_timeout,
        });
        Some(envelope)
    }

    async fn requeue_expired(&self) {
        let now = tokio::time::Instant::now();
        let mut pending = self.pending.lock().await;
        let mut expired = Vec::new();
        pending.retain(|p| {
            if p.redeliver_after <= now {
                expired.push(p.envelope.clone());
                false
            } else {
                true
            }
        });
        drop(pending);
        if !expired.is_empty() {
            let mut queue = self.queue.lock().await;
            for envelope in expired {
                queue.push_front(envelope);
            }
        }
    }

    /// Acknowledges a delivery, removing it from the pending (redeliverable)
    /// set permanently.
    pub async fn ack(&self, delivery_id: Uuid) -> std::result::Result<(), BusError> {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|p| p.envelope.delivery_id != delivery_id);
        if pending.len() == before {
            return Err(BusError::UnknownDelivery(delivery_id));
        }
        Ok(())
    }

    /// Blocks until a message is available or the deadline elapses,
    /// whichever comes first — the suspension point cancellation rules in
    /// spec.md §5 require this to be interruptible.
    pub async fn receive(&self, deadline: Duration) -> Option<EventEnvelope> {
        if let Some(envelope) = self.next().await {
            return Some(envelope);
        }
        tokio::select! {
            _ = self.notify.notified() => self.next().await,
            _ = tokio::time::sleep(deadline) => None,
        }
    }
}

/// Configuration for the bus adapter, mirroring spec.md §6's enumerated
/// `bus.*` config keys.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub durable_subject_prefix: String,
    pub visibility_timeout: Duration,
    pub max_buffered: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            durable_subject_prefix: "durable".to_string(),
            visibility_timeout: Duration::from_secs(30),
            max_buffered: 1024,
        }
    }
}

struct DurableTopic {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    dropped: AtomicU64,
}

/// Subjects are plain strings. Ephemeral subscribers get a
/// `broadcast::Receiver` (best-effort: a slow subscriber simply misses
/// messages once the broadcast channel's own ring buffer wraps). Durable
/// subscribers are named and registered once; redelivery and acknowledgment
/// are handled per-subscription by [`Subscription`].
pub struct EventBus {
    config: BusConfig,
    ephemeral: broadcast::Sender<EventEnvelope>,
    durable: Mutex<std::collections::HashMap<String, Arc<DurableTopic>>>,
    dropped_ephemeral: AtomicU64,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (ephemeral, _) = broadcast::channel(config.max_buffered.max(1));
        Self {
            config,
            ephemeral,
            durable: Mutex::new(std::collections::HashMap::new()),
            dropped_ephemeral: AtomicU64::new(0),
        }
    }

    /// Publishes non-blocking: ephemeral subscribers receive via the
    /// bounded broadcast channel (oldest messages drop automatically once
    /// it's full — the broadcast channel's own semantics), durable
    /// subscribers are pushed onto their queue with the bus's drop-oldest
    /// policy applied per-subscription.
    pub async fn publish(&self, subject: impl Into<String>, payload: serde_json::Value) -> Result<Uuid> {
        let subject = subject.into();
        let envelope = EventEnvelope::new(subject.clone(), payload);
        let delivery_id = envelope.delivery_id;

        if self.ephemeral.send(envelope.clone()).is_err() {
            // No ephemeral receivers currently subscribed; not an error,
            // publishing is fire-and-forget for that audience.
            self.dropped_ephemeral.fetch_add(0, Ordering::Relaxed);
        }

        let durable = self.durable.lock().await;
        for topic in durable.values() {
            let matching: Vec<Arc<Subscription>> = {
                let subs = topic.subscriptions.lock().await;
                subs.iter()
                    .filter(|s| s.subject == subject)
                    .cloned()
                    .collect()
            };
            for sub in matching {
                let overflowed = sub.push(envelope.clone(), self.config.max_buffered).await;
                if overflowed {
                    topic.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Ok(delivery_id)
    }

    /// Subscribes ephemerally (best-effort) to all messages published from
    /// here forward.
    pub fn subscribe_ephemeral(&self) -> broadcast::Receiver<EventEnvelope> {
        self.ephemeral.subscribe()
    }

    /// Registers (or returns the existing) durable, named subscription for
    /// `subject`. Registration is idempotent on `(name, subject)`.
    pub async fn subscribe_durable(
        &self,
        name: impl Into<String>,
        subject: impl Into<String>,
    ) -> Arc<Subscription> {
        let name = name.into();
        let subject = subject.into();
        let mut durable = self.durable.lock().await;
        let topic = durable
            .entry(subject.clone())
            .or_insert_with(|| {
                Arc::new(DurableTopic {
                    subscriptions: Mutex::new(Vec::new()),
                    dropped: AtomicU64::new(0),
                })
            })
            .clone();
        drop(durable);

        let mut subs = topic.subscriptions.lock().await;
        if let Some(existing) = subs.iter().find(|s| s.name == name) {
            return existing.clone();
        }
        let sub = Subscription::new(name, subject, self.config.visibility_timeout);
        subs.push(sub.clone());
        sub
    }

    /// Count of durable messages dropped under the drop-oldest overflow
    /// policy for `subject`, or 0 if the subject has no durable topic yet.
    pub async fn dropped_count(&self, subject: &str) -> u64 {
        let durable = self.durable.lock().await;
        match durable.get(subject) {
            Some(topic) => topic.dropped.load(Ordering::Relaxed),
            None => 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Event subjects named in spec.md §6. Kept as `&'static str` constants
/// rather than an enum so publishers/subscribers can use plain string
/// subjects (matching the bus's string-keyed subject model) while still
/// having a single source of truth for the well-known names.
pub mod subjects {
    pub const SYNC_COMPLETED: &str = "etl.sync.completed";
    pub const QUALITY_ALERT: &str = "etl.quality.alert";
    pub const SYNC_FAILED: &str = "etl.sync.failed";
    pub const QUARANTINE_ADDED: &str = "etl.quarantine.added";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_ephemeral();
        bus.publish("etl.sync.completed", serde_json::json!({"batch_id": "1"}))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject, "etl.sync.completed");
    }

    #[tokio::test]
    async fn durable_subscription_requires_explicit_ack() {
        let bus = EventBus::default();
        let sub = bus.subscribe_durable("validator", "etl.sync.completed").await;
        bus.publish("etl.sync.completed", serde_json::json!({"batch_id": "1"}))
            .await
            .unwrap();

        let delivered = sub.receive(Duration::from_secs(1)).await.unwrap();
        sub.ack(delivered.delivery_id).await.unwrap();
        assert!(sub.ack(delivered.delivery_id).await.is_err());
    }

    #[tokio::test]
    async fn unacked_message_redelivers_after_visibility_timeout() {
        let bus = EventBus::new(BusConfig {
            visibility_timeout: Duration::from_millis(20),
            ..BusConfig::default()
        });
        let sub = bus.subscribe_durable("validator", "etl.sync.completed").await;
        bus.publish("etl.sync.completed", serde_json::json!({"batch_id": "1"}))
            .await
            .unwrap();

        let first = sub.receive(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let redelivered = sub.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.delivery_id, redelivered.delivery_id);
    }

    #[tokio::test]
    async fn durable_overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(BusConfig {
            max_buffered: 2,
            ..BusConfig::default()
        });
        let sub = bus.subscribe_durable("validator", "etl.sync.completed").await;
        for i in 0..4 {
            bus.publish("etl.sync.completed", serde_json::json!({"i": i}))
                .await
                .unwrap();
        }
        assert_eq!(bus.dropped_count("etl.sync.completed").await, 2);
        // Only the two most recent should remain queued.
        let first = sub.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.payload["i"], 2);
    }

    #[tokio::test]
    async fn receive_returns_none_on_deadline_when_empty() {
        let bus = EventBus::default();
        let sub = bus.subscribe_durable("validator", "etl.sync.completed").await;
        let result = sub.receive(Duration::from_millis(10)).await;
        assert!(result.is_none());
    }
}
