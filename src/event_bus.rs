//! Intra-process topic pub/sub and request/reply (spec.md §4.1).
//!
//! A topic-addressed bus: best-effort fan-out publish, wildcard-segment
//! subscriptions, and a request/reply helper that waits for up to N replies
//! or a timeout. Subscriber tables use `dashmap::DashMap` rather than
//! `Mutex<HashMap<_>>` to keep publish lock-light under concurrent
//! dispatch.

use crate::config::BusConfig;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Message payload carried on the bus. Kept as an opaque JSON value so the
/// bus does not need to know about every component's concrete event types.
pub type Payload = Value;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A responder used with [`EventBus::on_request`]; returns the reply payload.
pub type Responder = Arc<dyn Fn(Payload) -> BoxFuture<'static, Payload> + Send + Sync>;

/// One message queued for a subscriber, carrying the backpressure permit
/// that must stay held until the handler has actually run it.
struct QueuedMessage {
    payload: Payload,
    permit: OwnedSemaphorePermit,
}

/// A subscription's mailbox. Messages are pushed here in publish order and
/// drained by a single dedicated task (spawned in `subscribe`), so a given
/// subscriber always sees its messages in the order they were published —
/// isolation from slow peers comes from every subscriber owning its own
/// queue and task, not from a fresh task per message.
struct Subscription {
    id: u64,
    tx: mpsc::UnboundedSender<QueuedMessage>,
}

struct HistoryEntry {
    topic: String,
    payload: Payload,
    at: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    exact: DashMap<String, Vec<Subscription>>,
    wildcard: Mutex<Vec<(String, Subscription)>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    queue_permits: Arc<Semaphore>,
    next_id: AtomicU64,
    config: BusConfig,
}

/// Topic pub/sub + request/reply for intra-process coordination.
///
/// Cheaply cloneable — every clone shares the same subscriber tables.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// Returned from `subscribe`/`on_request`; drop it or call `unsubscribe` to
/// stop receiving events on that topic.
pub struct SubscriptionHandle {
    bus: EventBus,
    topic: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        self.bus.remove_subscription(&self.topic, self.id);
    }
}

fn critical_topic(topic: &str) -> bool {
    topic.starts_with("orchestration:") || topic.starts_with("usage:budget:")
}

/// Whether a registered topic pattern (possibly ending in a `*` wildcard
/// segment) matches a concrete published topic. Only a trailing `*` segment
/// is treated specially — `"a:*"` matches `"a:b"` and `"a:b:c"`.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return topic == prefix || topic.starts_with(&format!("{}:", prefix));
    }
    false
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let permits = config.max_queue;
        Self {
            inner: Arc::new(Inner {
                exact: DashMap::new(),
                wildcard: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(config.history_size.min(4096))),
                queue_permits: Arc::new(Semaphore::new(permits)),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    /// Best-effort fan-out. Never fails to the publisher (guarantee (ii)).
    ///
    /// One permit is acquired per matching subscriber and held until that
    /// subscriber's drain task has actually run the message, so
    /// `bus.maxQueue` bounds pending handler work rather than concurrent
    /// `publish` calls. Critical topics block for a permit instead of
    /// dropping; everything else is dropped on backpressure.
    pub async fn publish(&self, topic: &str, payload: Payload) {
        self.record_history(topic, &payload);

        let critical = critical_topic(topic);
        for tx in self.matching_targets(topic) {
            let permit = if critical {
                match Arc::clone(&self.inner.queue_permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => continue,
                }
            } else {
                match Arc::clone(&self.inner.queue_permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        log::warn!("event bus backpressure: dropping publish to '{}'", topic);
                        continue;
                    }
                }
            };
            let _ = tx.send(QueuedMessage {
                payload: payload.clone(),
                permit,
            });
        }
    }

    fn matching_targets(&self, topic: &str) -> Vec<mpsc::UnboundedSender<QueuedMessage>> {
        let mut out = Vec::new();
        if let Some(subs) = self.inner.exact.get(topic) {
            out.extend(subs.iter().map(|s| s.tx.clone()));
        }
        let wildcard = self.inner.wildcard.lock().unwrap();
        for (pattern, sub) in wildcard.iter() {
            if topic_matches(pattern, topic) {
                out.push(sub.tx.clone());
            }
        }
        out
    }

    fn record_history(&self, topic: &str, payload: &Payload) {
        let mut history = self.inner.history.lock().unwrap();
        if history.len() >= self.inner.config.history_size {
            history.pop_front();
        }
        history.push_back(HistoryEntry {
            topic: topic.to_string(),
            payload: payload.clone(),
            at: chrono::Utc::now(),
        });
    }

    /// Rolling history of the last `historySize` messages, optionally
    /// filtered by topic (guarantee (v)).
    pub fn history(&self, topic_filter: Option<&str>) -> Vec<(String, Payload)> {
        let history = self.inner.history.lock().unwrap();
        history
            .iter()
            .filter(|e| topic_filter.map(|t| e.topic == t).unwrap_or(true))
            .map(|e| (e.topic.clone(), e.payload.clone()))
            .collect()
    }

    /// Subscribe to an exact topic or a trailing-`*` wildcard topic.
    ///
    /// Spawns one drain task that owns this subscriber's mailbox and calls
    /// `handler` once per queued message, in the order `publish` enqueued
    /// them. A slow or hung handler only stalls this subscriber's own queue
    /// — it never blocks other subscribers or the publisher.
    pub fn subscribe<F, Fut>(&self, topic: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedMessage>();
        let budget = self.inner.config.handler_budget;
        let topic_owned = topic.to_string();
        tokio::spawn(async move {
            while let Some(QueuedMessage { payload, permit }) = rx.recv().await {
                match tokio::time::timeout(budget, handler(payload)).await {
                    Ok(()) => {}
                    Err(_) => {
                        log::warn!(
                            "event bus handler on '{}' exceeded its {:?} budget; abandoned",
                            topic_owned,
                            budget
                        );
                    }
                }
                drop(permit);
            }
        });
        let sub = Subscription { id, tx };
        if topic.ends_with(":*") {
            self.inner
                .wildcard
                .lock()
                .unwrap()
                .push((topic.to_string(), sub));
        } else {
            self.inner
                .exact
                .entry(topic.to_string())
                .or_insert_with(Vec::new)
                .push(sub);
        }
        SubscriptionHandle {
            bus: self.clone(),
            topic: topic.to_string(),
            id,
        }
    }

    fn remove_subscription(&self, topic: &str, id: u64) {
        if topic.ends_with(":*") {
            self.inner.wildcard.lock().unwrap().retain(|(t, s)| !(t == topic && s.id == id));
        } else if let Some(mut subs) = self.inner.exact.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Publish `payload` on `topic` and collect up to `expected` reply
    /// payloads, waiting no longer than `timeout`. Never fails; returns
    /// whatever arrived (possibly empty).
    pub async fn request(
        &self,
        topic: &str,
        payload: Payload,
        timeout: Duration,
        expected: usize,
    ) -> Vec<Payload> {
        let reply_topic = format!("__reply__:{}", Uuid::new_v4());
        let (tx, mut rx) = mpsc::channel::<Payload>(expected.max(1));

        let sub = self.subscribe(&reply_topic, move |payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload).await;
            }
        });

        let envelope = serde_json::json!({ "payload": payload, "reply_to": reply_topic });
        self.publish(topic, envelope).await;

        let mut results = Vec::with_capacity(expected);
        let deadline = tokio::time::Instant::now() + timeout;
        while results.len() < expected {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(p)) => results.push(p),
                _ => break,
            }
        }
        sub.unsubscribe();
        results
    }

    /// Register a responder for `topic`: every request envelope is unwrapped,
    /// passed to `responder`, and the reply is published back to the
    /// requester's private reply topic.
    pub fn on_request(&self, topic: &str, responder: Responder) -> SubscriptionHandle {
        let bus = self.clone();
        self.subscribe(topic, move |envelope| {
            let bus = bus.clone();
            let responder = responder.clone();
            async move {
                let reply_to = envelope
                    .get("reply_to")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let inner_payload = envelope.get("payload").cloned().unwrap_or(Value::Null);
                let reply = responder(inner_payload).await;
                if let Some(reply_to) = reply_to {
                    bus.publish(&reply_to, reply).await;
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn publish_delivers_to_exact_subscriber() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe("orchestration:starting", move |_payload| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.publish("orchestration:starting", serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_topic_matches_subtopics() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe("agent:*", move |_p| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.publish("agent:state-change", serde_json::json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_reply_round_trips() {
        let bus = EventBus::default();
        let _responder = bus.on_request(
            "echo",
            Arc::new(|payload| Box::pin(async move { payload })),
        );
        let replies = bus
            .request("echo", serde_json::json!({"hello": "world"}), Duration::from_millis(500), 1)
            .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["hello"], "world");
    }

    #[tokio::test]
    async fn request_returns_partial_on_timeout() {
        let bus = EventBus::default();
        let replies = bus
            .request("nobody-listens", serde_json::json!({}), Duration::from_millis(30), 3)
            .await;
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn history_is_rolling_and_filterable() {
        let bus = EventBus::new(BusConfig {
            history_size: 2,
            ..BusConfig::default()
        });
        bus.publish("a", serde_json::json!(1)).await;
        bus.publish("b", serde_json::json!(2)).await;
        bus.publish("a", serde_json::json!(3)).await;
        let all = bus.history(None);
        assert_eq!(all.len(), 2);
        let only_a = bus.history(Some("a"));
        assert_eq!(only_a.len(), 1);
    }

    #[tokio::test]
    async fn single_subscriber_sees_messages_in_publish_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let _sub = bus.subscribe("ordered:topic", move |payload| {
            let order = order_clone.clone();
            async move {
                let n = payload.as_i64().unwrap();
                if n == 1 {
                    // The first message is the slow one; if delivery were a
                    // fresh spawned task per message, message 2 could land first.
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
                order.lock().unwrap().push(n);
            }
        });
        bus.publish("ordered:topic", serde_json::json!(1)).await;
        bus.publish("ordered:topic", serde_json::json!(2)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn backpressure_bounds_pending_handler_messages_not_publish_calls() {
        let bus = EventBus::new(BusConfig {
            max_queue: 1,
            ..BusConfig::default()
        });
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe("slow:topic", move |_payload| {
            let count = count_clone.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        // Both publish calls return almost immediately either way; the
        // second should still be dropped because the first message's permit
        // is held until its handler actually finishes, not until publish
        // returns.
        bus.publish("slow:topic", serde_json::json!(1)).await;
        bus.publish("slow:topic", serde_json::json!(2)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
