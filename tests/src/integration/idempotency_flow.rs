//! # Idempotency Flow Tests
//!
//! At-least-once delivery means handlers see duplicates. These tests drive
//! duplicates through the broker and check that side effects happen once.

#[cfg(test)]
mod tests {
    use cr_02_rpc_dispatcher::{
        handler_fn, Binding, Dispatcher, DispatcherConfig, HandlerError, HandlerRegistry,
        RequestContext,
    };
    use cr_03_idempotency::{IdempotencyConfig, IdempotencyService, InMemoryIdempotencyStore, Outcome};
    use serde_json::{json, Value};
    use service_runtime::handlers::{activate_route, ActivateUser, ActivatedUser};
    use service_runtime::{RuntimeConfig, ServiceRuntime};
    use shared_bus::{InMemoryBroker, Message, Transport};
    use shared_types::{CorrelationId, Envelope, Header, RouteKey};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn service() -> IdempotencyService {
        IdempotencyService::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let idempotency = service();

        let claims = (0..2).map(|_| {
            let idempotency = idempotency.clone();
            tokio::spawn(async move { idempotency.claim_first("create-user:alice@x.com").await })
        });
        let won: Vec<bool> = futures::future::join_all(claims)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(won.iter().filter(|w| **w).count(), 1);
        assert!(idempotency.is_processing("create-user:alice@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_executions_share_one_result() {
        let idempotency = service();
        let runs = Arc::new(AtomicU32::new(0));

        let calls = (0..8).map(|_| {
            let idempotency = idempotency.clone();
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                idempotency
                    .execute_once("create-user:alice@x.com", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(json!({"id": 42, "email": "alice@x.com"}))
                    })
                    .await
                    .unwrap()
            })
        });
        let outcomes: Vec<Outcome<Value>> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.is_duplicate()).count(), 1);
        for outcome in outcomes {
            assert_eq!(
                outcome.into_result().unwrap(),
                json!({"id": 42, "email": "alice@x.com"})
            );
        }
    }

    #[tokio::test]
    async fn test_redelivered_command_has_one_side_effect() {
        let broker = InMemoryBroker::new();
        let idempotency = service();
        let side_effects = Arc::new(AtomicU32::new(0));
        let invocations = Arc::new(AtomicU32::new(0));
        let route = RouteKey::new("ledger", "credit").unwrap();

        let handler = {
            let side_effects = Arc::clone(&side_effects);
            let invocations = Arc::clone(&invocations);
            handler_fn(move |ctx: RequestContext, _payload: Value| {
                let idempotency = idempotency.clone();
                let side_effects = Arc::clone(&side_effects);
                let invocations = Arc::clone(&invocations);
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    idempotency
                        .execute_once(&format!("ledger.credit:{}", ctx.message_id), || async {
                            side_effects.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, String>(())
                        })
                        .await?
                        .into_result()
                        .map_err(HandlerError::internal)?;
                    Ok::<_, HandlerError>(Value::Null)
                }
            })
        };
        let registry = HandlerRegistry::new()
            .with(Binding::command(route.clone(), "ledger", handler))
            .unwrap();
        let dispatcher = Dispatcher::start(Arc::new(broker.clone()), registry, DispatcherConfig::new("ledger"))
            .await
            .unwrap();

        // Same broker message delivered three times
        let header = Header::request(CorrelationId::new(), "", "bank", "ledger");
        let message = Message::from_envelope(route.request_key(), &Envelope::new(header, json!({"amount": 5})))
            .unwrap();
        for _ in 0..3 {
            broker.publish(&route.request_key(), message.clone()).await.unwrap();
        }

        for _ in 0..200 {
            if invocations.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(side_effects.load(Ordering::SeqCst), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_activations_reply_identically() {
        let broker = InMemoryBroker::new();
        let runtime = Arc::new(
            ServiceRuntime::start(Arc::new(broker.clone()), RuntimeConfig::for_service("user"))
                .await
                .unwrap(),
        );

        let calls = (0..5).map(|_| {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                runtime
                    .client()
                    .call::<_, ActivatedUser>(
                        &activate_route().unwrap(),
                        &ActivateUser {
                            email: "alice@x.com".into(),
                        },
                        None,
                    )
                    .await
            })
        });
        let replies: Vec<ActivatedUser> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(replies.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(runtime.directory().len(), 1);

        let outbox = Arc::clone(runtime.outbox());
        for _ in 0..200 {
            if outbox.sent_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(outbox.sent_count(), 1);

        runtime.shutdown().await;
    }
}
