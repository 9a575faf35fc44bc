//! Codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parley_protocol::codec::{self, Encoding};
use parley_protocol::{ChatMessage, ClientEvent, ServerEvent};

fn sample_message() -> ServerEvent {
    ServerEvent::NewMessage(ChatMessage {
        id: "msg_1".into(),
        conversation_id: "conversation-42".into(),
        sender_id: "user-7".into(),
        content: "x".repeat(256),
        kind: "text".into(),
        timestamp: 1_700_000_000_000,
        recipient_id: None,
        metadata: None,
    })
}

fn bench_encode(c: &mut Criterion) {
    let event = sample_message();

    c.bench_function("encode_json", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::Json))
    });

    c.bench_function("encode_msgpack", |b| {
        b.iter(|| codec::encode(black_box(&event), Encoding::MessagePack))
    });
}

fn bench_parse(c: &mut Criterion) {
    let text = r#"{"event":"send-message","data":{"conversationId":"c1","content":"hello there"}}"#;

    c.bench_function("decode_and_parse_json", |b| {
        b.iter(|| {
            let envelope = codec::decode_json(black_box(text)).unwrap();
            ClientEvent::from_envelope(envelope).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_parse);
criterion_main!(benches);
