/// Benchmarks for inbound frame parsing and outbound envelope serialization, the per-message hot
/// paths of a connection.
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use resilient_ws::types::Message;
use serde_json::json;

fn bench_inbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope/inbound");

    let envelope = r#"{
        "type": "price",
        "data": {"symbol": "BTCUSDT", "value": 64012.5, "bids": [[64012.0, 1.5], [64011.5, 3.0]]},
        "timestamp": 1700000000000,
        "id": "01890f3e-7f2a-7cc4-9d7b-2f1c0d6e4a11"
    }"#;
    group.throughput(Throughput::Bytes(envelope.len() as u64));
    group.bench_function("Message::from_frame/envelope", |b| {
        b.iter(|| Message::from_frame(std::hint::black_box(envelope)));
    });

    let plain = "server heartbeat acknowledged";
    group.throughput(Throughput::Bytes(plain.len() as u64));
    group.bench_function("Message::from_frame/raw", |b| {
        b.iter(|| Message::from_frame(std::hint::black_box(plain)));
    });

    group.throughput(Throughput::Bytes(envelope.len() as u64));
    group.bench_function("Message::peek_type", |b| {
        b.iter(|| Message::peek_type(std::hint::black_box(envelope)));
    });

    let binary = vec![0xff_u8; 256];
    group.throughput(Throughput::Bytes(binary.len() as u64));
    group.bench_function("Message::from_binary/opaque", |b| {
        b.iter(|| Message::from_binary(std::hint::black_box(&binary)));
    });

    group.finish();
}

fn bench_outbound(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope/outbound");

    let message = Message::new("order", json!({"side": "buy", "size": 10, "price": 0.55}));
    group.bench_function("Message::to_json", |b| {
        b.iter(|| {
            std::hint::black_box(&message)
                .to_json()
                .expect("Serialization should succeed")
        });
    });

    group.bench_function("Message::new", |b| {
        b.iter(|| Message::new("order", std::hint::black_box(json!(1))));
    });

    group.finish();
}

criterion_group!(envelope_benches, bench_inbound, bench_outbound);
criterion_main!(envelope_benches);
