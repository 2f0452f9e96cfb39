//! The process-internal message bus: pub/sub over named topics plus
//! correlated request/reply to specific agents.
//!
//! Grounded on the teacher's `engine::events::EventBus` (`tokio::sync::broadcast`
//! fan-out per topic) generalized to the full envelope/kind model of
//! spec.md §4.2, plus a per-recipient bounded `mpsc` inbox for `Send`'s
//! backpressure semantics and a `DashMap` of outstanding `Request` waiters.
//! `publish`'s retry-with-backoff loop mirrors the teacher's
//! `calculate_retry_delay`/exponential-backoff shape in `engine/functions.rs`,
//! narrowed to the one strategy spec.md asks for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::models::agent::AgentId;
use crate::models::envelope::{CorrelationId, Envelope, Recipient};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no such recipient: {0}")]
    NoSuchRecipient(AgentId),
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(AgentId),
    #[error("recipient inbox full: {0}")]
    QueueFull(AgentId),
    #[error("request timed out waiting for a reply")]
    Timeout,
    #[error("envelope already expired")]
    Expired,
}

/// A recipient's bounded inbox plus the liveness flag the bus consults
/// before attempting `Send` (spec.md §4.2: `recipient_unreachable`).
struct Inbox {
    sender: mpsc::Sender<Envelope>,
    healthy: std::sync::atomic::AtomicBool,
}

/// The bus itself. One instance is shared (via `Arc`) across the engine,
/// registry, scheduler and every agent handle — agents never hold a direct
/// reference to the engine, only to the bus (spec.md §9's cyclic-reference
/// resolution).
/// Publish retry policy (spec.md §4.2): a handful of fast, doubling-delay
/// attempts, enough to ride out a subscriber that hasn't finished
/// `subscribe()`-ing yet without holding up the publisher for long.
const PUBLISH_MAX_ATTEMPTS: u32 = 4;
const PUBLISH_BASE_DELAY: Duration = Duration::from_millis(15);

pub struct MessageBus {
    inboxes: DashMap<AgentId, Arc<Inbox>>,
    topics: DashMap<String, broadcast::Sender<Envelope>>,
    waiters: DashMap<CorrelationId, oneshot::Sender<Envelope>>,
    dropped_counters: DashMap<String, u64>,
    topic_sequences: DashMap<String, AtomicU64>,
    inbox_capacity: usize,
}

impl MessageBus {
    pub fn new(inbox_capacity: usize) -> Self {
        Self {
            inboxes: DashMap::new(),
            topics: DashMap::new(),
            waiters: DashMap::new(),
            dropped_counters: DashMap::new(),
            topic_sequences: DashMap::new(),
            inbox_capacity,
        }
    }

    /// Next monotonic sequence number for `topic`, starting at 1 — the basis
    /// for cursor-based resend (spec.md §6), since `Envelope::id` is a random
    /// UUID and carries no publish order.
    fn next_sequence(&self, topic: &str) -> u64 {
        self.topic_sequences
            .entry(topic.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Register a recipient inbox, returning the receiving half for the
    /// agent's own delivery loop to drain.
    pub fn register_recipient(&self, agent_id: AgentId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.inbox_capacity);
        self.inboxes.insert(
            agent_id,
            Arc::new(Inbox { sender: tx, healthy: std::sync::atomic::AtomicBool::new(true) }),
        );
        rx
    }

    pub fn deregister_recipient(&self, agent_id: &AgentId) {
        self.inboxes.remove(agent_id);
    }

    pub fn set_recipient_health(&self, agent_id: &AgentId, healthy: bool) {
        if let Some(inbox) = self.inboxes.get(agent_id) {
            inbox.healthy.store(healthy, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Point-to-point delivery. Fails with `NoSuchRecipient`,
    /// `RecipientUnreachable`, or `QueueFull` per spec.md §4.2.
    pub async fn send(&self, recipient: &AgentId, envelope: Envelope) -> Result<(), BusError> {
        if envelope.is_expired(chrono::Utc::now()) {
            return Err(BusError::Expired);
        }
        let inbox = self
            .inboxes
            .get(recipient)
            .ok_or_else(|| BusError::NoSuchRecipient(recipient.clone()))?;
        if !inbox.healthy.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(BusError::RecipientUnreachable(recipient.clone()));
        }
        inbox
            .sender
            .try_send(envelope)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BusError::QueueFull(recipient.clone()),
                mpsc::error::TrySendError::Closed(_) => BusError::RecipientUnreachable(recipient.clone()),
            })
    }

    /// Fan-out publish. Best-effort with retry: a full/lagging subscriber
    /// drops its own copy and increments a counter rather than blocking
    /// others, and a publish that lands with zero current subscribers is
    /// retried with exponential backoff up to `PUBLISH_MAX_ATTEMPTS` times
    /// before being given up on — spec.md §4.2's "delivery is best-effort
    /// with retry (exponential backoff, capped attempts)". Assigns the
    /// envelope its topic-sequence number before the first attempt, so
    /// retries don't shift cursor ordering for anyone already subscribed.
    pub async fn publish(&self, topic: &str, mut envelope: Envelope) {
        if envelope.is_expired(chrono::Utc::now()) {
            return;
        }
        envelope.sequence = self.next_sequence(topic);

        let mut delay = PUBLISH_BASE_DELAY;
        for attempt in 1..=PUBLISH_MAX_ATTEMPTS {
            let delivered = self
                .topics
                .get(topic)
                .map(|sender| sender.send(envelope.clone()).is_ok())
                .unwrap_or(false);
            if delivered {
                return;
            }
            if attempt == PUBLISH_MAX_ATTEMPTS {
                debug!(topic, attempt, "publish gave up: no subscribers");
                return;
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Record a dropped delivery for a lagging subscriber (called by the
    /// subscriber's own receive loop on `RecvError::Lagged`).
    pub fn record_dropped(&self, topic: &str, count: u64) {
        *self.dropped_counters.entry(topic.to_string()).or_insert(0) += count;
        warn!(topic, count, "subscriber lagged; copies dropped");
    }

    pub fn dropped_count(&self, topic: &str) -> u64 {
        self.dropped_counters.get(topic).map(|v| *v).unwrap_or(0)
    }

    /// Subscribe to a topic; returns a broadcast receiver the caller drains
    /// independently. Topic membership is durable for the receiver's
    /// lifetime — dropping the receiver is the only unsubscribe.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .subscribe()
    }

    pub fn unsubscribe(&self, topic: &str, receiver: broadcast::Receiver<Envelope>) {
        drop(receiver);
        // If no subscribers remain, prune the topic's sender so it doesn't
        // leak forever — spec.md doesn't require this but it keeps the
        // topic map bounded by active interest.
        if let Some(sender) = self.topics.get(topic) {
            if sender.receiver_count() == 0 {
                drop(sender);
                self.topics.remove(topic);
            }
        }
    }

    /// Correlated request/reply. Registers a one-shot waiter, sends the
    /// request, and races the reply against `timeout`. The waiter is always
    /// removed on return — by whichever of (reply, timeout) resolves first —
    /// so `Request` never leaks a waiter (spec.md §4.2, §8 property #4).
    pub async fn request(
        &self,
        recipient: &AgentId,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, BusError> {
        let correlation_id = CorrelationId::new();
        envelope.correlation_id = Some(correlation_id);

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id, tx);

        if let Err(e) = self.send(recipient, envelope).await {
            self.waiters.remove(&correlation_id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.waiters.remove(&correlation_id);

        match result {
            Ok(Ok(reply)) => {
                if reply.is_expired(chrono::Utc::now()) {
                    Err(BusError::Expired)
                } else {
                    Ok(reply)
                }
            }
            Ok(Err(_)) => Err(BusError::Timeout), // sender half dropped
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Deliver a reply envelope to whoever is waiting on its correlation id.
    /// Expired replies are dropped before ever waking a waiter — the other
    /// half of the §8 property #4 invariant.
    pub fn deliver_reply(&self, envelope: Envelope) {
        let Some(correlation_id) = envelope.correlation_id else {
            return;
        };
        if envelope.is_expired(chrono::Utc::now()) {
            debug!(?correlation_id, "dropping expired reply before waking waiter");
            return;
        }
        if let Some((_, sender)) = self.waiters.remove(&correlation_id) {
            let _ = sender.send(envelope);
        }
    }

    /// Route an arbitrary envelope: replies go to their waiter, everything
    /// else goes by recipient kind (point-to-point vs topic fan-out).
    pub async fn route(&self, envelope: Envelope) -> Result<(), BusError> {
        if envelope.correlation_id.is_some()
            && matches!(envelope.kind, crate::models::envelope::MessageKind::TaskResponse
                | crate::models::envelope::MessageKind::CoordinationReply
                | crate::models::envelope::MessageKind::StatusReply)
        {
            self.deliver_reply(envelope);
            return Ok(());
        }
        match &envelope.recipient {
            Recipient::Agent(agent_id) => self.send(&agent_id.clone(), envelope).await,
            Recipient::Topic(topic) => {
                self.publish(&topic.clone(), envelope).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::envelope::{Envelope, MessageKind};

    #[tokio::test]
    async fn send_fails_for_unregistered_recipient() {
        let bus = MessageBus::new(16);
        let envelope = Envelope::new(
            "engine",
            Recipient::Agent(AgentId::from("ghost")),
            MessageKind::TaskRequest,
            serde_json::json!({}),
            chrono::Duration::seconds(30),
        );
        let err = bus.send(&AgentId::from("ghost"), envelope).await.unwrap_err();
        assert!(matches!(err, BusError::NoSuchRecipient(_)));
    }

    #[tokio::test]
    async fn send_respects_inbox_capacity() {
        let bus = MessageBus::new(1);
        let agent = AgentId::from("agent-1");
        let _rx = bus.register_recipient(agent.clone());
        let make = || {
            Envelope::new(
                "engine",
                Recipient::Agent(agent.clone()),
                MessageKind::TaskRequest,
                serde_json::json!({}),
                chrono::Duration::seconds(30),
            )
        };
        bus.send(&agent, make()).await.unwrap();
        let err = bus.send(&agent, make()).await.unwrap_err();
        assert!(matches!(err, BusError::QueueFull(_)));
    }

    #[tokio::test]
    async fn request_times_out_and_cleans_up_waiter() {
        let bus = MessageBus::new(16);
        let agent = AgentId::from("agent-1");
        let _rx = bus.register_recipient(agent.clone());
        let envelope = Envelope::new(
            "engine",
            Recipient::Agent(agent.clone()),
            MessageKind::TaskRequest,
            serde_json::json!({}),
            chrono::Duration::seconds(30),
        );
        let err = bus.request(&agent, envelope, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout));
        assert_eq!(bus.waiters.len(), 0, "waiter must be cleaned up on timeout");
    }

    #[tokio::test]
    async fn expired_reply_never_wakes_a_waiter() {
        let bus = MessageBus::new(16);
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        bus.waiters.insert(correlation_id, tx);

        let mut reply = Envelope::new(
            "agent-1",
            Recipient::Agent(AgentId::from("engine")),
            MessageKind::TaskResponse,
            serde_json::json!({}),
            chrono::Duration::seconds(-5),
        );
        reply.correlation_id = Some(correlation_id);
        bus.deliver_reply(reply);

        assert!(bus.waiters.contains_key(&correlation_id), "waiter survives an expired reply");
        drop(rx);
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let bus = MessageBus::new(16);
        let mut sub_a = bus.subscribe("topic-a");
        let mut sub_b = bus.subscribe("topic-a");
        let envelope = Envelope::new(
            "engine",
            Recipient::Topic("topic-a".into()),
            MessageKind::TaskProgress,
            serde_json::json!({"n": 1}),
            chrono::Duration::seconds(30),
        );
        bus.publish("topic-a", envelope).await;
        assert!(sub_a.recv().await.is_ok());
        assert!(sub_b.recv().await.is_ok());
    }
}
