//! # Courier Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | shared-bus | topic matching, envelope encode/decode |
//! | cr-01 | correlation register + complete |
//! | cr-01/cr-02 | full in-process round trip |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cr_01_rpc_client::{ClientConfig, CorrelationRegistry, RpcClient};
use cr_02_rpc_dispatcher::{
    handler_fn, Binding, Dispatcher, DispatcherConfig, HandlerError, HandlerRegistry,
    RequestContext,
};
use serde_json::{json, Value};
use shared_bus::{decode_raw, encode, topic_matches, InMemoryBroker};
use shared_types::{CorrelationId, Envelope, Header, ResponseEnvelope, RouteKey};
use std::sync::Arc;
use std::time::Duration;

fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared-bus-topic");

    let cases = [
        ("exact", "user.activate.request", "user.activate.request"),
        ("star", "user.*.request", "user.activate.request"),
        ("hash", "poison.#", "poison.notification.send-email"),
        ("miss", "dlq.user.*", "user.activate.request"),
    ];
    for (name, pattern, key) in cases {
        group.bench_function(name, |b| {
            b.iter(|| black_box(topic_matches(black_box(pattern), black_box(key))))
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared-bus-codec");

    for size in [16usize, 256, 4096] {
        let header = Header::request(CorrelationId::new(), "gateway.reply.queue", "gateway", "user");
        let envelope = Envelope::new(
            header,
            ResponseEnvelope::success(json!({ "blob": "x".repeat(size) })),
        );
        let bytes = encode(&envelope).unwrap_or_default();

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &envelope, |b, envelope| {
            b.iter(|| black_box(encode(envelope)))
        });
        group.bench_with_input(BenchmarkId::new("decode_raw", size), &bytes, |b, bytes| {
            b.iter(|| black_box(decode_raw(bytes)))
        });
    }

    group.finish();
}

fn bench_correlation_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("cr-01-registry");
    let registry = Arc::new(CorrelationRegistry::new());
    let route = RouteKey::new("user", "activate").ok();
    let reply = decode_raw(
        &encode(&Envelope::new(
            Header::request(CorrelationId::new(), "q", "a", "b"),
            ResponseEnvelope::success(Value::Null),
        ))
        .unwrap_or_default(),
    )
    .ok();

    if let (Some(route), Some(reply)) = (route, reply) {
        group.bench_function("register_complete", |b| {
            b.iter(|| {
                let id = CorrelationId::new();
                let mut handle = registry.register(id, &route).ok();
                black_box(registry.complete(id, reply.clone()));
                black_box(handle.as_mut().and_then(|h| h.try_take()))
            })
        });
    }

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("cr-rpc-round-trip");
    group.measurement_time(Duration::from_secs(10));

    let Ok(rt) = tokio::runtime::Runtime::new() else {
        return;
    };
    let setup = rt.block_on(async {
        let broker = InMemoryBroker::new();
        let route = RouteKey::new("echo", "ping").ok()?;
        let handler = handler_fn(|_ctx: RequestContext, payload: Value| async move {
            Ok::<_, HandlerError>(payload)
        });
        let registry = HandlerRegistry::new()
            .with(Binding::rpc(route.clone(), "echo", handler))
            .ok()?;
        let dispatcher = Dispatcher::start(Arc::new(broker.clone()), registry, DispatcherConfig::new("echo"))
            .await
            .ok()?;
        let client = RpcClient::start(Arc::new(broker), ClientConfig::new("bench"))
            .await
            .ok()?;
        Some((route, dispatcher, client))
    });

    if let Some((route, _dispatcher, client)) = setup {
        group.bench_function("call_echo", |b| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        client
                            .call::<_, Value>(&route, &json!({"n": 1}), None)
                            .await
                            .is_ok(),
                    )
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_topic_matching,
    bench_codec,
    bench_correlation_registry,
    bench_round_trip,
);

criterion_main!(benches);
