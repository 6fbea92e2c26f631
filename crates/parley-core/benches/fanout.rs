//! Fan-out benchmarks for the session registry.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_core::{event_queue, Conversation, EventReceiver, SessionRegistry};
use parley_protocol::ServerEvent;
use std::sync::Arc;

fn populate(connections: usize, devices: usize) -> (SessionRegistry, Vec<EventReceiver>) {
    let registry = SessionRegistry::new();
    let mut receivers = Vec::with_capacity(connections);

    for i in 0..connections {
        // Large enough that nothing is dropped during a measurement batch
        let (tx, rx) = event_queue(1 << 16);
        let user = format!("user_{}", i / devices);
        if registry.bind(format!("conn_{i}").into(), user, tx).is_ok() {
            receivers.push(rx);
        }
    }

    (registry, receivers)
}

fn drain(receivers: &mut [EventReceiver]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// Presence broadcast to every connected session.
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for connections in [10, 100, 1000] {
        let (registry, mut receivers) = populate(connections, 1);
        let event = Arc::new(ServerEvent::online("user_0", Utc::now()));

        group.throughput(Throughput::Elements(connections as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(connections),
            &connections,
            |b, _| {
                b.iter(|| {
                    let fan_out = registry.broadcast(black_box(&event));
                    drain(&mut receivers);
                    fan_out
                })
            },
        );
    }

    group.finish();
}

/// Direct message delivery to two users with several devices each.
fn bench_direct(c: &mut Criterion) {
    let mut group = c.benchmark_group("direct");

    for devices in [1, 4, 16] {
        let (registry, mut receivers) = populate(devices * 100, devices);
        let event = Arc::new(ServerEvent::sent("m1", Utc::now()));

        group.throughput(Throughput::Elements((devices * 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, _| {
            b.iter(|| {
                let fan_out = registry.send_to_users(["user_0", "user_1"], black_box(&event));
                drain(&mut receivers);
                fan_out
            })
        });
    }

    group.finish();
}

/// Bind and unbind churn.
fn bench_churn(c: &mut Criterion) {
    c.bench_function("bind_unbind", |b| {
        let registry = SessionRegistry::new();
        let mut i = 0u64;
        b.iter(|| {
            let (tx, _rx) = event_queue(8);
            let id = format!("conn_{i}");
            i += 1;
            if registry.bind(id.clone().into(), "user", tx).is_ok() {
                registry.unbind(&id.into());
            }
        })
    });
}

fn bench_conversation_parse(c: &mut Criterion) {
    c.bench_function("conversation_parse", |b| {
        b.iter(|| Conversation::parse(black_box("user_b#user_a")))
    });
}

criterion_group!(
    benches,
    bench_broadcast,
    bench_direct,
    bench_churn,
    bench_conversation_parse
);
criterion_main!(benches);
