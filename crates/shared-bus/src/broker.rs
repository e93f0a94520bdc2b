//! # In-Memory Broker
//!
//! Single-process [`Transport`] with topic bindings, competing consumers,
//! dead-lettering, message TTL and drop-head length bounds.

use crate::delivery::{Consumer, Delivery, Settle};
use crate::message::{Message, QueueSpec};
use crate::topic::topic_matches;
use crate::transport::{Transport, TransportError};
use crate::DEFAULT_CONSUMER_BUFFER;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use shared_types::DeathReason;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

struct Queued {
    message: Message,
    enqueued_at: Instant,
}

struct QueueState {
    spec: QueueSpec,
    ready: Mutex<VecDeque<Queued>>,
    notify: Notify,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

struct BrokerInner {
    queues: DashMap<String, Arc<QueueState>>,

    /// (pattern, queue) pairs.
    bindings: RwLock<Vec<(String, String)>>,

    closed: AtomicBool,

    messages_published: AtomicU64,

    messages_dead_lettered: AtomicU64,
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Result<Arc<QueueState>, TransportError> {
        self.queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| TransportError::UnknownQueue(name.to_string()))
    }

    /// Deliver to every bound queue. Returns the number of queues reached.
    fn route(&self, routing_key: &str, message: Message) -> usize {
        // Collect first: enqueueing may dead-letter, which routes again
        let targets: Vec<String> = {
            let bindings = self.bindings.read();
            let mut targets: Vec<String> = bindings
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, routing_key))
                .map(|(_, queue)| queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        let mut delivered = 0;
        for name in targets {
            if let Ok(queue) = self.queue(&name) {
                self.enqueue(&queue, message.clone());
                delivered += 1;
            }
        }
        delivered
    }

    fn enqueue(&self, queue: &QueueState, message: Message) {
        self.expire_head(queue);
        let overflow = {
            let mut ready = queue.ready.lock();
            ready.push_back(Queued {
                message,
                enqueued_at: Instant::now(),
            });
            let mut overflow = Vec::new();
            if let Some(max) = queue.spec.max_length {
                while ready.len() > max {
                    if let Some(oldest) = ready.pop_front() {
                        overflow.push(oldest.message);
                    }
                }
            }
            overflow
        };
        queue.notify.notify_one();

        for message in overflow {
            self.dead_letter(queue, message, DeathReason::MaxLength);
        }
    }

    fn requeue(&self, queue: &QueueState, mut message: Message) {
        message.properties.redelivered = true;
        queue.ready.lock().push_front(Queued {
            message,
            enqueued_at: Instant::now(),
        });
        queue.notify.notify_one();
    }

    fn dead_letter(&self, from: &QueueState, mut message: Message, reason: DeathReason) {
        let Some(dead_letter_key) = from.spec.dead_letter_routing_key.clone() else {
            warn!(
                queue = %from.spec.name,
                message_id = %message.properties.message_id,
                reason = %reason,
                "Message dropped (queue has no dead-letter target)"
            );
            return;
        };

        if message.properties.origin_routing_key.is_none() {
            message.properties.origin_routing_key = Some(message.routing_key.clone());
        }
        message.properties.origin_queue = Some(from.spec.name.clone());
        message.properties.death_reason = Some(reason);
        message.properties.redelivered = false;
        message.routing_key = dead_letter_key.clone();

        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
        debug!(
            queue = %from.spec.name,
            dead_letter_key = %dead_letter_key,
            message_id = %message.properties.message_id,
            "Message dead-lettered"
        );

        if self.route(&dead_letter_key, message) == 0 {
            warn!(
                queue = %from.spec.name,
                dead_letter_key = %dead_letter_key,
                "Dead-letter key is unroutable, message dropped"
            );
        }
    }

    /// Dead-letter expired messages at the head of the queue.
    ///
    /// Queues nobody consumes (`poison.queue`) still honour their TTL because
    /// enqueue, depth and peek all run this first.
    fn expire_head(&self, queue: &QueueState) {
        let Some(ttl) = queue.spec.message_ttl else {
            return;
        };
        let expired: Vec<Message> = {
            let mut ready = queue.ready.lock();
            let mut expired = Vec::new();
            while ready.front().is_some_and(|q| q.enqueued_at.elapsed() >= ttl) {
                if let Some(queued) = ready.pop_front() {
                    expired.push(queued.message);
                }
            }
            expired
        };
        for message in expired {
            self.dead_letter(queue, message, DeathReason::Expired);
        }
    }

    /// Wait for the next live message. Expired heads are dead-lettered on the way.
    async fn next_ready(&self, queue: &QueueState) -> Option<Message> {
        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            let popped = queue.ready.lock().pop_front();
            match popped {
                Some(queued) => {
                    let expired = queue
                        .spec
                        .message_ttl
                        .is_some_and(|ttl| queued.enqueued_at.elapsed() >= ttl);
                    if expired {
                        self.dead_letter(queue, queued.message, DeathReason::Expired);
                        continue;
                    }
                    return Some(queued.message);
                }
                None => notified.await,
            }
        }
    }
}

struct QueueSettler {
    broker: Arc<BrokerInner>,
    queue: Arc<QueueState>,
}

impl Settle for QueueSettler {
    fn ack(&self, message: &Message) {
        debug!(
            queue = %self.queue.spec.name,
            message_id = %message.properties.message_id,
            "Delivery acknowledged"
        );
    }

    fn reject(&self, message: Message, reason: DeathReason) {
        self.broker.dead_letter(&self.queue, message, reason);
    }

    fn requeue(&self, message: Message) {
        self.broker.requeue(&self.queue, message);
    }
}

async fn pump(broker: Arc<BrokerInner>, queue: Arc<QueueState>, tx: mpsc::Sender<Delivery>) {
    let settler: Arc<dyn Settle> = Arc::new(QueueSettler {
        broker: broker.clone(),
        queue: queue.clone(),
    });

    loop {
        let Ok(permit) = tx.reserve().await else {
            break;
        };
        let message = tokio::select! {
            message = broker.next_ready(&queue) => message,
            _ = tx.closed() => None,
        };
        let Some(message) = message else {
            break;
        };
        permit.send(Delivery::new(message, settler.clone()));
    }

    debug!(queue = %queue.spec.name, "Consumer pump stopped");
}

/// In-memory broker.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                bindings: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                messages_published: AtomicU64::new(0),
                messages_dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    /// Close the broker. Consumers drain to `None`; publishes fail with `Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for queue in self.inner.queues.iter() {
            queue.notify.notify_waiters();
        }
        debug!("Broker closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Total publish calls, including unroutable ones.
    pub fn messages_published(&self) -> u64 {
        self.inner.messages_published.load(Ordering::Relaxed)
    }

    pub fn messages_dead_lettered(&self) -> u64 {
        self.inner.messages_dead_lettered.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let existing = self.inner.queues.get(&spec.name).map(|q| q.spec.clone());
        match existing {
            Some(current) if current != spec => {
                warn!(queue = %spec.name, "Queue redeclared with different arguments, keeping original");
            }
            Some(_) => {}
            None => {
                debug!(queue = %spec.name, "Queue declared");
                self.inner
                    .queues
                    .entry(spec.name.clone())
                    .or_insert_with(|| Arc::new(QueueState::new(spec)));
            }
        }
        Ok(())
    }

    async fn bind(&self, queue: &str, pattern: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.queue(queue)?;
        let mut bindings = self.inner.bindings.write();
        let binding = (pattern.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            debug!(queue = queue, pattern = pattern, "Queue bound");
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, routing_key: &str, mut message: Message) -> Result<usize, TransportError> {
        self.ensure_open()?;
        self.inner.messages_published.fetch_add(1, Ordering::Relaxed);
        message.routing_key = routing_key.to_string();

        let routed = self.inner.route(routing_key, message);
        if routed == 0 {
            warn!(routing_key = routing_key, "Message unroutable (no matching binding)");
        } else {
            debug!(routing_key = routing_key, queues = routed, "Message published");
        }
        Ok(routed)
    }

    async fn send_to_queue(&self, queue: &str, message: Message) -> Result<(), TransportError> {
        self.ensure_open()?;
        let state = self.inner.queue(queue)?;
        self.inner.messages_published.fetch_add(1, Ordering::Relaxed);
        self.inner.enqueue(&state, message);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, TransportError> {
        self.ensure_open()?;
        let state = self.inner.queue(queue)?;
        let (tx, rx) = mpsc::channel(DEFAULT_CONSUMER_BUFFER);
        tokio::spawn(pump(self.inner.clone(), state, tx));
        debug!(queue = queue, "Consumer started");
        Ok(Consumer::new(queue, rx))
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, TransportError> {
        let state = self.inner.queue(queue)?;
        self.inner.expire_head(&state);
        let depth = state.ready.lock().len();
        Ok(depth)
    }

    async fn peek(&self, queue: &str) -> Result<Vec<Message>, TransportError> {
        let state = self.inner.queue(queue)?;
        self.inner.expire_head(&state);
        let ready = state.ready.lock();
        Ok(ready.iter().map(|q| q.message.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn broker_with_queue(name: &str, pattern: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(QueueSpec::new(name)).await.unwrap();
        broker.bind(name, pattern).await.unwrap();
        broker
    }

    async fn with_dead_letter(broker: &InMemoryBroker, spec: QueueSpec, dlq: &str) {
        let key = spec.dead_letter_routing_key.clone().unwrap();
        broker.declare_queue(spec).await.unwrap();
        broker.declare_queue(QueueSpec::new(dlq)).await.unwrap();
        broker.bind(dlq, &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let broker = broker_with_queue("user.activate.user.queue", "user.activate.request").await;

        let routed = broker
            .publish("user.activate.request", Message::new("", "{}"))
            .await
            .unwrap();
        assert_eq!(routed, 1);
        assert_eq!(broker.queue_depth("user.activate.user.queue").await.unwrap(), 1);

        let peeked = broker.peek("user.activate.user.queue").await.unwrap();
        assert_eq!(peeked[0].routing_key, "user.activate.request");
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_not_an_error() {
        let broker = InMemoryBroker::new();
        let routed = broker.publish("nobody.home.request", Message::new("", "{}")).await;
        assert_eq!(routed, Ok(0));
        assert_eq!(broker.messages_published(), 1);
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_queues() {
        let broker = broker_with_queue("a.queue", "user.#").await;
        broker.declare_queue(QueueSpec::new("b.queue")).await.unwrap();
        broker.bind("b.queue", "user.activate.request").await.unwrap();
        // Duplicate binding is ignored
        broker.bind("b.queue", "user.activate.request").await.unwrap();

        let routed = broker
            .publish("user.activate.request", Message::new("", "{}"))
            .await
            .unwrap();
        assert_eq!(routed, 2);
        assert_eq!(broker.queue_depth("b.queue").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.send_to_queue("missing", Message::new("", "{}")).await,
            Err(TransportError::UnknownQueue(_))
        ));
        assert!(matches!(
            broker.consume("missing").await,
            Err(TransportError::UnknownQueue(_))
        ));
        assert!(matches!(
            broker.bind("missing", "#").await,
            Err(TransportError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let broker = broker_with_queue("q", "k").await;
        broker.publish("k", Message::new("", "hello")).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let delivery = timeout(Duration::from_secs(1), consumer.next())
            .await
            .expect("timeout")
            .expect("delivery");
        assert_eq!(&delivery.message().body[..], b"hello");
        assert!(!delivery.message().properties.redelivered);
        delivery.ack();

        assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let broker = broker_with_queue("q", "k").await;
        broker.publish("k", Message::new("", "again")).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let first = consumer.next().await.unwrap();
        let id = first.message().properties.message_id;
        drop(first);

        let second = timeout(Duration::from_secs(1), consumer.next())
            .await
            .expect("timeout")
            .expect("delivery");
        assert_eq!(second.message().properties.message_id, id);
        assert!(second.message().properties.redelivered);
        second.ack();
    }

    #[tokio::test]
    async fn test_reject_dead_letters_with_origin() {
        let broker = InMemoryBroker::new();
        let spec = QueueSpec::new("main.queue").with_dead_letter("dlq.user.activate");
        with_dead_letter(&broker, spec, "user.activate.dlq").await;
        broker.bind("main.queue", "user.activate.request").await.unwrap();

        broker
            .publish("user.activate.request", Message::new("", "{}"))
            .await
            .unwrap();
        let mut consumer = broker.consume("main.queue").await.unwrap();
        consumer.next().await.unwrap().reject("handler failed");

        let dead = broker.peek("user.activate.dlq").await.unwrap();
        assert_eq!(dead.len(), 1);
        let props = &dead[0].properties;
        assert_eq!(dead[0].routing_key, "dlq.user.activate");
        assert_eq!(props.origin_queue.as_deref(), Some("main.queue"));
        assert_eq!(props.origin_routing_key.as_deref(), Some("user.activate.request"));
        assert_eq!(
            props.death_reason,
            Some(DeathReason::Rejected("handler failed".into()))
        );
        assert_eq!(broker.messages_dead_lettered(), 1);
    }

    #[tokio::test]
    async fn test_reject_without_dead_letter_drops() {
        let broker = broker_with_queue("q", "k").await;
        broker.publish("k", Message::new("", "{}")).await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();
        consumer.next().await.unwrap().reject("nope");

        assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
        assert_eq!(broker.messages_dead_lettered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let spec = QueueSpec::new("ttl.queue")
            .with_dead_letter("dlq.ttl")
            .with_message_ttl(Duration::from_secs(60));
        with_dead_letter(&broker, spec, "ttl.dlq").await;

        broker.send_to_queue("ttl.queue", Message::new("k", "{}")).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let mut consumer = broker.consume("ttl.queue").await.unwrap();
        assert!(timeout(Duration::from_millis(50), consumer.next()).await.is_err());

        let dead = broker.peek("ttl.dlq").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].properties.death_reason, Some(DeathReason::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconsumed_queue_still_expires() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(QueueSpec::new("parked").with_message_ttl(Duration::from_secs(60)))
            .await
            .unwrap();

        broker.send_to_queue("parked", Message::new("k", "old")).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        broker.send_to_queue("parked", Message::new("k", "new")).await.unwrap();
        assert_eq!(broker.queue_depth("parked").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        let left = broker.peek("parked").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].body, "new");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(broker.queue_depth("parked").await.unwrap(), 0);
        broker.send_to_queue("parked", Message::new("k", "fresh")).await.unwrap();
        assert_eq!(broker.queue_depth("parked").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_length_drops_head() {
        let broker = InMemoryBroker::new();
        let spec = QueueSpec::new("bounded")
            .with_dead_letter("dlq.bounded")
            .with_max_length(2);
        with_dead_letter(&broker, spec, "bounded.dlq").await;

        for body in ["one", "two", "three"] {
            broker.send_to_queue("bounded", Message::new("k", body)).await.unwrap();
        }

        let ready = broker.peek("bounded").await.unwrap();
        let bodies: Vec<&[u8]> = ready.iter().map(|m| &m.body[..]).collect();
        assert_eq!(bodies, vec![&b"two"[..], &b"three"[..]]);

        let dead = broker.peek("bounded.dlq").await.unwrap();
        assert_eq!(&dead[0].body[..], b"one");
        assert_eq!(dead[0].properties.death_reason, Some(DeathReason::MaxLength));
    }

    #[tokio::test]
    async fn test_competing_consumers_share_work() {
        let broker = broker_with_queue("work", "job").await;
        for i in 0..10 {
            broker.publish("job", Message::new("", format!("{i}"))).await.unwrap();
        }

        let mut a = broker.consume("work").await.unwrap();
        let mut b = broker.consume("work").await.unwrap();
        let mut seen = Vec::new();
        while seen.len() < 10 {
            let delivery = tokio::select! {
                Some(d) = a.next() => d,
                Some(d) = b.next() => d,
            };
            seen.push(delivery.message().properties.message_id);
            delivery.ack();
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_close_ends_consumers_and_publishes() {
        let broker = broker_with_queue("q", "k").await;
        let mut consumer = broker.consume("q").await.unwrap();
        broker.close();

        let next = timeout(Duration::from_secs(1), consumer.next()).await.expect("timeout");
        assert!(next.is_none());
        assert_eq!(
            broker.publish("k", Message::new("", "{}")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_redeclare_is_idempotent() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(QueueSpec::new("q")).await.unwrap();
        broker.send_to_queue("q", Message::new("k", "{}")).await.unwrap();
        broker.declare_queue(QueueSpec::new("q")).await.unwrap();
        assert_eq!(broker.queue_depth("q").await.unwrap(), 1);
    }
}
