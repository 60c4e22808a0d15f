//! In-process topic exchange. The exchange lives behind a trait
//! (`Bus`) on top of `tokio::sync::mpsc` queues, so a future
//! out-of-process broker can implement `Bus` without touching the
//! worker manager or the agent runtime.

use crate::error::BusError;
use crate::event::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Static queue name -> binding pattern table, plus the DLQ. Mirrors the
/// queue topology table: each agent owns exactly one queue, bound to the
/// event type that triggers it; the orchestrator queue binds the
/// wildcard `*.complete`, and `explorer` is bound to an externally
/// produced event this crate only ingests.
pub fn default_bindings() -> Vec<(&'static str, &'static str)> {
    vec![
        ("planner", "task.initiated"),
        ("architect", "plan.created"),
        ("coder", "architecture.proposed"),
        ("tester", "code.pr.opened"),
        ("reviewer", "test.results"),
        ("deployer", "review.decision"),
        ("explorer", "explorer.scan.request"),
        ("orchestrator", "*.complete"),
    ]
}

const DEFAULT_MAX_REDELIVERIES: u32 = 3;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Hands back the receiving half for a queue; panics if called twice
    /// for the same queue (single-consumer-per-queue, matching the
    /// worker manager's one-task-per-queue model).
    fn take_receiver(&self, queue: &str) -> Option<mpsc::Receiver<QueuedEnvelope>>;

    async fn dead_letter(&self, queued: QueuedEnvelope, reason: String);

    fn dlq_receiver(&self) -> Option<mpsc::Receiver<DeadLettered>>;

    /// Requeues with an incremented delivery count, or routes to the DLQ
    /// once the exchange's redelivery limit is exceeded.
    async fn nack(&self, queue: &str, queued: QueuedEnvelope, reason: String);
}

#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub envelope: Envelope,
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
pub struct DeadLettered {
    pub envelope: Envelope,
    pub reason: String,
}

struct Queue {
    tx: mpsc::Sender<QueuedEnvelope>,
    rx: Mutex<Option<mpsc::Receiver<QueuedEnvelope>>>,
}

pub struct TopicExchange {
    bindings: Vec<(String, String)>,
    queues: HashMap<String, Queue>,
    dlq_tx: mpsc::Sender<DeadLettered>,
    dlq_rx: Mutex<Option<mpsc::Receiver<DeadLettered>>>,
    max_redeliveries: u32,
    published: AtomicU32,
}

impl TopicExchange {
    pub fn new(bindings: Vec<(&str, &str)>) -> Arc<Self> {
        Self::with_capacity(bindings, 1024, DEFAULT_MAX_REDELIVERIES)
    }

    pub fn with_capacity(
        bindings: Vec<(&str, &str)>,
        capacity: usize,
        max_redeliveries: u32,
    ) -> Arc<Self> {
        let mut queues = HashMap::new();
        for (name, _) in &bindings {
            if queues.contains_key(*name) {
                continue;
            }
            let (tx, rx) = mpsc::channel(capacity);
            queues.insert(
                name.to_string(),
                Queue { tx, rx: Mutex::new(Some(rx)) },
            );
        }
        let (dlq_tx, dlq_rx) = mpsc::channel(capacity);
        Arc::new(TopicExchange {
            bindings: bindings
                .into_iter()
                .map(|(q, p)| (q.to_string(), p.to_string()))
                .collect(),
            queues,
            dlq_tx,
            dlq_rx: Mutex::new(Some(dlq_rx)),
            max_redeliveries,
            published: AtomicU32::new(0),
        })
    }

    fn matching_queues(&self, event_type: &str) -> Vec<&str> {
        self.bindings
            .iter()
            .filter(|(_, pattern)| {
                crate::event::EventType::new(event_type).matches_pattern(pattern)
            })
            .map(|(q, _)| q.as_str())
            .collect()
    }
}

#[async_trait]
impl Bus for TopicExchange {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        let targets = self.matching_queues(&envelope.event_type.0);
        if targets.is_empty() {
            return Err(BusError::Unrouted(envelope.event_type.0.clone()));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        for queue in targets {
            let Some(q) = self.queues.get(queue) else { continue };
            let queued = QueuedEnvelope { envelope: envelope.clone(), delivery_count: 0 };
            q.tx
                .send(queued)
                .await
                .map_err(|_| BusError::Unavailable(format!("queue {queue} closed")))?;
        }
        Ok(())
    }

    fn take_receiver(&self, queue: &str) -> Option<mpsc::Receiver<QueuedEnvelope>> {
        self.queues.get(queue)?.rx.try_lock().ok()?.take()
    }

    async fn dead_letter(&self, queued: QueuedEnvelope, reason: String) {
        let _ = self
            .dlq_tx
            .send(DeadLettered { envelope: queued.envelope, reason })
            .await;
    }

    fn dlq_receiver(&self) -> Option<mpsc::Receiver<DeadLettered>> {
        self.dlq_rx.try_lock().ok()?.take()
    }

    /// Requeues with an incremented delivery count, or routes to the DLQ
    /// once `max_redeliveries` is exceeded. Called by a queue consumer
    /// after its handler fails.
    async fn nack(&self, queue: &str, mut queued: QueuedEnvelope, reason: String) {
        queued.delivery_count += 1;
        if queued.delivery_count > self.max_redeliveries {
            self.dead_letter(queued, reason).await;
            return;
        }
        if let Some(q) = self.queues.get(queue) {
            if q.tx.send(queued).await.is_err() {
                warn!(queue, "failed to requeue envelope, queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn env(event_type: &str) -> Envelope {
        Envelope::new(Uuid::new_v4(), Uuid::new_v4(), "tester", event_type, serde_json::json!({}))
    }

    #[tokio::test]
    async fn publish_routes_to_bound_queue() {
        let bus = TopicExchange::new(default_bindings());
        let mut rx = bus.take_receiver("planner").unwrap();
        bus.publish(env("task.initiated")).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.envelope.event_type.0, "task.initiated");
        assert_eq!(received.delivery_count, 0);
    }

    #[tokio::test]
    async fn publish_with_no_binding_errors() {
        let bus = TopicExchange::new(default_bindings());
        let err = bus.publish(env("no.such.type")).await.unwrap_err();
        assert!(matches!(err, BusError::Unrouted(_)));
    }

    #[tokio::test]
    async fn wildcard_binding_matches_complete_suffix() {
        let bus = TopicExchange::new(default_bindings());
        let mut rx = bus.take_receiver("orchestrator").unwrap();
        bus.publish(env("deploy.status.complete")).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn nack_past_max_redeliveries_goes_to_dlq() {
        let bus = TopicExchange::with_capacity(default_bindings(), 16, 1);
        let mut dlq = bus.dlq_receiver().unwrap();
        let queued = QueuedEnvelope { envelope: env("task.initiated"), delivery_count: 1 };
        bus.nack("planner", queued, "boom".into()).await;
        let dead = dlq.recv().await.unwrap();
        assert_eq!(dead.reason, "boom");
    }
}
