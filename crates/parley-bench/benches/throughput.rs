//! Throughput benchmarks for Parley.
//!
//! These benchmarks measure how fast the core fans events out to rooms.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_core::{outbound_queue, Hub, OutboundReceiver, Room, Rooms, Router};
use parley_protocol::{ConnectionId, Envelope, ServerEvent, TypingIndicator};
use serde_json::json;
use std::sync::Arc;

fn typing_event() -> ServerEvent {
    ServerEvent::UserTyping(TypingIndicator {
        user_id: "sender".into(),
        conversation_id: "bench".into(),
        is_typing: true,
    })
}

/// A hub with `members` connections in one conversation room.
fn hub_with_room(members: usize) -> (Hub, Room, Vec<OutboundReceiver>) {
    let rooms = Arc::new(Rooms::new());
    let hub = Hub::new(Arc::clone(&rooms));
    let room = Room::conversation("bench");

    let receivers = (0..members)
        .map(|i| {
            let id = ConnectionId::new(format!("conn-{}", i));
            let (tx, rx) = outbound_queue(1024);
            hub.attach(&id, tx);
            rooms.join(&id, room.clone());
            rx
        })
        .collect();

    (hub, room, receivers)
}

/// Benchmark room fan-out at different room sizes.
fn bench_room_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_fanout");

    for members in [1, 10, 100, 1000] {
        let (hub, room, mut receivers) = hub_with_room(members);
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                let delivered = hub.send_to_room(black_box(&room), typing_event(), None);
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
                delivered
            });
        });
    }

    group.finish();
}

/// Benchmark message relay through the router, parse to enqueue.
fn bench_message_relay(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_relay");

    for members in [2, 10, 100] {
        let router = Router::new();
        let mut receivers: Vec<(ConnectionId, OutboundReceiver)> = (0..members)
            .map(|i| {
                let id = ConnectionId::new(format!("conn-{}", i));
                let rx = router.connect(&id).unwrap();
                router
                    .dispatch(&id, Envelope::new("join", json!(format!("user-{}", i))))
                    .unwrap();
                router
                    .dispatch(&id, Envelope::new("join-conversation", json!("bench")))
                    .unwrap();
                (id, rx)
            })
            .collect();
        let sender = receivers[0].0.clone();
        let payload = json!({"conversationId": "bench", "content": "x".repeat(64)});

        group.throughput(Throughput::Elements(members as u64 - 1));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                router
                    .dispatch(&sender, Envelope::new("send-message", payload.clone()))
                    .unwrap();
                for (_, rx) in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
            });
        });
    }

    group.finish();
}

/// Benchmark connection churn: connect, join, disconnect.
fn bench_connection_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("connection_churn");
    let router = Router::new();
    let mut i = 0u64;

    group.throughput(Throughput::Elements(1));
    group.bench_function("connect_join_disconnect", |b| {
        b.iter(|| {
            let id = ConnectionId::new(format!("conn-{}", i));
            i += 1;
            let _rx = router.connect(&id).unwrap();
            router
                .dispatch(&id, Envelope::new("join", json!("churn-user")))
                .unwrap();
            router.disconnect(&id, "bench").unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_room_fanout,
    bench_message_relay,
    bench_connection_churn,
);
criterion_main!(benches);
