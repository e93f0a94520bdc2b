//! # Dead-Letter Flow Tests
//!
//! ```text
//! notification.send-email.request ──► main queue ──reject──► dlq.notification.send-email
//!                                         ▲                          │
//!                                         └──── retry (attempt+1) ◄──┤
//!                                                                    └──► poison.notification.send-email
//! ```
//!
//! Uses short fixed backoff so the whole escalation runs in milliseconds.

#[cfg(test)]
mod tests {
    use cr_02_rpc_dispatcher::{
        handler_fn, Binding, Dispatcher, DispatcherConfig, HandlerError, HandlerRegistry,
        RequestContext,
    };
    use cr_04_reliability::{DeadLetterConsumer, PoisonInspector, QueueTopology, RetryPolicy};
    use serde_json::{json, Value};
    use shared_bus::{InMemoryBroker, Message, Transport};
    use shared_types::{CorrelationId, DeathReason, Envelope, Header, RouteKey};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn route() -> RouteKey {
        RouteKey::new("notification", "send-email").unwrap()
    }

    struct Harness {
        broker: InMemoryBroker,
        topology: QueueTopology,
        dispatcher: Dispatcher,
        dead_letters: DeadLetterConsumer,
        invocations: Arc<AtomicU32>,
    }

    impl Harness {
        /// Serve `notification.send-email`, failing the first `failures`
        /// invocations with `code`.
        async fn start(failures: u32, code: i32) -> Self {
            let broker = InMemoryBroker::new();
            let topology = QueueTopology::for_route(&route(), "notification");
            topology.declare(&broker).await.unwrap();

            let dead_letters = DeadLetterConsumer::spawn(
                Arc::new(broker.clone()),
                topology.clone(),
                RetryPolicy::fixed(3, Duration::from_millis(5), Duration::from_millis(20)),
            )
            .await
            .unwrap();

            let invocations = Arc::new(AtomicU32::new(0));
            let handler = {
                let invocations = Arc::clone(&invocations);
                handler_fn(move |_ctx: RequestContext, _payload: Value| {
                    let call = invocations.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call < failures {
                            Err(HandlerError::new(code, "smtp unavailable"))
                        } else {
                            Ok(Value::Null)
                        }
                    }
                })
            };
            let registry = HandlerRegistry::new()
                .with(
                    Binding::command(route(), "notification", handler)
                        .with_queue_spec(topology.main.clone()),
                )
                .unwrap();
            let dispatcher = Dispatcher::start(
                Arc::new(broker.clone()),
                registry,
                DispatcherConfig::new("notification"),
            )
            .await
            .unwrap();

            Self {
                broker,
                topology,
                dispatcher,
                dead_letters,
                invocations,
            }
        }

        async fn send(&self) {
            let header = Header::request(CorrelationId::new(), "", "user", "notification");
            let message = Message::from_envelope(
                route().request_key(),
                &Envelope::new(header, json!({"to": "a@b.com", "subject": "Welcome"})),
            )
            .unwrap();
            self.broker.publish(&route().request_key(), message).await.unwrap();
        }

        async fn wait_for_poison(&self, count: usize) {
            for _ in 0..300 {
                if PoisonInspector::count(&self.broker).await.unwrap() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("poison queue never reached {count}");
        }

        async fn wait_for_invocations(&self, count: u32) {
            for _ in 0..300 {
                if self.invocations.load(Ordering::SeqCst) >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("handler never reached {count} invocations");
        }

        async fn stop(self) {
            self.dispatcher.shutdown().await;
            self.dead_letters.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_always_failing_command_is_poisoned_after_retries() {
        let harness = Harness::start(u32::MAX, 500).await;
        harness.send().await;

        harness.wait_for_poison(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // First delivery plus three retries
        assert_eq!(harness.invocations.load(Ordering::SeqCst), 4);
        assert_eq!(
            harness.broker.queue_depth(harness.topology.main_queue()).await.unwrap(),
            0
        );
        assert_eq!(
            harness.broker.queue_depth(harness.topology.dead_letter_queue()).await.unwrap(),
            0
        );

        let poisoned = PoisonInspector::list(&harness.broker).await.unwrap();
        assert_eq!(poisoned.len(), 1);
        assert_eq!(poisoned[0].attempts(), 3);
        assert_eq!(poisoned[0].dead_letter.routing_key, route().request_key());
        assert_eq!(
            poisoned[0].reason(),
            Some(&DeathReason::Rejected("500: smtp unavailable".into()))
        );

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_without_poison() {
        let harness = Harness::start(2, 500).await;
        harness.send().await;

        harness.wait_for_invocations(3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(harness.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(PoisonInspector::count(&harness.broker).await.unwrap(), 0);
        assert_eq!(
            harness.broker.queue_depth(harness.topology.main_queue()).await.unwrap(),
            0
        );

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_bad_request_command_is_poisoned_without_retry() {
        let harness = Harness::start(u32::MAX, 400).await;
        harness.send().await;

        harness.wait_for_poison(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.invocations.load(Ordering::SeqCst), 1);
        let poisoned = PoisonInspector::list(&harness.broker).await.unwrap();
        assert_eq!(poisoned[0].attempts(), 0);
        assert!(poisoned[0].dead_letter.is_malformed());

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_message_never_reaches_handler() {
        let harness = Harness::start(0, 500).await;
        harness
            .broker
            .publish(&route().request_key(), Message::new("", "{not json"))
            .await
            .unwrap();

        harness.wait_for_poison(1).await;

        assert_eq!(harness.invocations.load(Ordering::SeqCst), 0);
        let poisoned = PoisonInspector::list(&harness.broker).await.unwrap();
        assert!(poisoned[0].dead_letter.is_malformed());
        assert_eq!(poisoned[0].body, "{not json");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_independent_messages_escalate_independently() {
        let harness = Harness::start(u32::MAX, 500).await;
        for _ in 0..3 {
            harness.send().await;
        }

        harness.wait_for_poison(3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(harness.invocations.load(Ordering::SeqCst), 12);
        let poisoned = PoisonInspector::list(&harness.broker).await.unwrap();
        let mut ids: Vec<_> = poisoned.iter().map(|p| p.dead_letter.message_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        harness.stop().await;
    }
}
