//! # RPC Flow Tests
//!
//! Client and dispatcher talking through the broker:
//!
//! ```text
//! [RpcClient] ──<d>.<a>.request──► [Dispatcher] ──replyTo──► <svc>.reply.queue ──► [ReplyListener]
//! ```
//!
//! 1. **Happy path**: the runtime's `user.activate`
//! 2. **Timeouts**: slow handler, late reply discarded
//! 3. **Stray replies**: unknown correlation IDs are dropped
//! 4. **Outcomes**: every concurrent call resolves exactly once

#[cfg(test)]
mod tests {
    use cr_01_rpc_client::{ClientConfig, RpcClient, RpcError};
    use cr_02_rpc_dispatcher::{
        handler_fn, Binding, Dispatcher, DispatcherConfig, HandlerError, HandlerRegistry,
        RequestContext,
    };
    use serde_json::{json, Value};
    use service_runtime::{RuntimeConfig, ServiceRuntime};
    use shared_bus::{InMemoryBroker, Message, Transport};
    use shared_types::{CorrelationId, Envelope, Header, ResponseEnvelope, RouteKey};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn slow_route() -> RouteKey {
        RouteKey::new("report", "build").unwrap()
    }

    /// Dispatcher serving `report.build`, sleeping `millis` from the payload.
    async fn sleepy_dispatcher(broker: &InMemoryBroker) -> Dispatcher {
        let handler = handler_fn(|ctx: RequestContext, payload: Value| async move {
            let millis = payload["millis"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, HandlerError>(json!({
                "millis": millis,
                "hadDeadline": ctx.deadline().is_some(),
            }))
        });
        let registry = HandlerRegistry::new()
            .with(Binding::rpc(slow_route(), "report", handler))
            .unwrap();
        Dispatcher::start(Arc::new(broker.clone()), registry, DispatcherConfig::new("report"))
            .await
            .unwrap()
    }

    async fn client(broker: &InMemoryBroker) -> RpcClient {
        named_client(broker, "gateway").await
    }

    async fn named_client(broker: &InMemoryBroker, service: &str) -> RpcClient {
        RpcClient::start(Arc::new(broker.clone()), ClientConfig::new(service))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_user_activate_round_trip() {
        let broker = InMemoryBroker::new();
        let runtime = ServiceRuntime::start(Arc::new(broker.clone()), RuntimeConfig::for_service("user"))
            .await
            .unwrap();
        let caller = client(&broker).await;

        let data: Value = caller
            .call(
                &RouteKey::new("user", "activate").unwrap(),
                &json!({"email": "a@b.com"}),
                None,
            )
            .await
            .unwrap();

        assert_eq!(data, json!({"email": "a@b.com", "status": "active"}));
        assert_eq!(caller.pending_count(), 0);
        assert_eq!(caller.registry().stats().total_completed.load(Ordering::Relaxed), 1);

        caller.shutdown().await;
        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out_and_late_reply_is_discarded() {
        let broker = InMemoryBroker::new();
        let dispatcher = sleepy_dispatcher(&broker).await;
        let caller = client(&broker).await;

        let started = tokio::time::Instant::now();
        let result: Result<Value, _> = caller
            .call(&slow_route(), &json!({"millis": 5_000}), Some(Duration::from_millis(200)))
            .await;

        match result {
            Err(RpcError::Timeout { target, elapsed_ms, .. }) => {
                assert_eq!(target, "report");
                assert!(elapsed_ms >= 200);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(caller.pending_count(), 0);

        // The handler finishes later; its reply matches nothing
        tokio::time::sleep(Duration::from_secs(6)).await;
        let stats = caller.registry().stats();
        assert_eq!(stats.total_timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_discarded.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_completed.load(Ordering::Relaxed), 0);

        caller.shutdown().await;
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_reply_is_discarded_and_client_keeps_working() {
        let broker = InMemoryBroker::new();
        let dispatcher = sleepy_dispatcher(&broker).await;
        let caller = client(&broker).await;

        let stray = Header::request(CorrelationId::new(), caller.reply_queue(), "gateway", "report")
            .reply("report", shared_types::ReplyStatus::Success);
        let message =
            Message::from_envelope("", &Envelope::new(stray, ResponseEnvelope::success(json!({}))))
                .unwrap();
        broker.send_to_queue(caller.reply_queue(), message).await.unwrap();

        let data: Value = caller
            .call(&slow_route(), &json!({"millis": 0}), None)
            .await
            .unwrap();
        assert_eq!(data["hadDeadline"], true);

        let stats = caller.registry().stats();
        assert_eq!(stats.total_discarded.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_completed.load(Ordering::Relaxed), 1);
        assert_eq!(broker.queue_depth(caller.reply_queue()).await.unwrap(), 0);

        caller.shutdown().await;
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_concurrent_call_has_exactly_one_outcome() {
        let broker = InMemoryBroker::new();
        let dispatcher = sleepy_dispatcher(&broker).await;
        let caller = Arc::new(client(&broker).await);

        // Half finish well inside the timeout, half well outside it
        let calls = (0..20u64).map(|i| {
            let caller = Arc::clone(&caller);
            tokio::spawn(async move {
                let millis = if i % 2 == 0 { 10 } else { 1_000 };
                caller
                    .call::<_, Value>(&slow_route(), &json!({"millis": millis}), Some(Duration::from_millis(300)))
                    .await
            })
        });
        let results = futures::future::join_all(calls).await;

        let mut ok = 0;
        let mut timed_out = 0;
        for result in results {
            match result.unwrap() {
                Ok(_) => ok += 1,
                Err(RpcError::Timeout { .. }) => timed_out += 1,
                Err(e) => panic!("unexpected outcome {e}"),
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(timed_out, 10);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = caller.registry().stats();
        assert_eq!(stats.total_registered.load(Ordering::Relaxed), 20);
        assert_eq!(
            stats.total_completed.load(Ordering::Relaxed) + stats.total_timeouts.load(Ordering::Relaxed),
            20
        );
        assert_eq!(stats.total_discarded.load(Ordering::Relaxed), 10);
        assert_eq!(caller.pending_count(), 0);

        caller.shutdown().await;
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_nested_call_inherits_remaining_budget() {
        let broker = InMemoryBroker::new();
        let _inner = sleepy_dispatcher(&broker).await;
        let inner_client = Arc::new(named_client(&broker, "edge").await);

        // `edge.forward` calls `report.build` with the caller's deadline
        let forward = {
            let inner_client = Arc::clone(&inner_client);
            handler_fn(move |ctx: RequestContext, payload: Value| {
                let inner_client = Arc::clone(&inner_client);
                async move {
                    let result: Result<Value, _> = inner_client
                        .call_with_context(&ctx.header, &slow_route(), &payload, Some(Duration::from_secs(30)))
                        .await;
                    match result {
                        Ok(value) => Ok(value),
                        Err(RpcError::Timeout { elapsed_ms, .. }) => {
                            Err(HandlerError::new(504, format!("inner call timed out after {elapsed_ms} ms")))
                        }
                        Err(e) => Err(HandlerError::internal(e.to_string())),
                    }
                }
            })
        };
        let registry = HandlerRegistry::new()
            .with(Binding::rpc(RouteKey::new("edge", "forward").unwrap(), "edge", forward))
            .unwrap();
        let _edge = Dispatcher::start(Arc::new(broker.clone()), registry, DispatcherConfig::new("edge"))
            .await
            .unwrap();
        let caller = client(&broker).await;

        // The inner timeout would be 30 s; the outer 300 ms budget wins
        let started = std::time::Instant::now();
        let result: Result<Value, _> = caller
            .call(
                &RouteKey::new("edge", "forward").unwrap(),
                &json!({"millis": 2_000}),
                Some(Duration::from_millis(300)),
            )
            .await;

        // Both sides share one deadline, so either side may notice first
        assert!(matches!(
            result,
            Err(RpcError::Timeout { .. }) | Err(RpcError::Remote { code: 504, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The inner client gave up within the same budget
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            inner_client.registry().stats().total_timeouts.load(Ordering::Relaxed),
            1
        );
    }
}
