/// Benchmarks for decoding protocol frames.
///
/// Every frame the service sends passes through [`Frame::parse`], which decodes the
/// envelope and then the string-encoded `data` inside it.
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pusher_client_sdk::connection::Frame;
use serde_json::json;

fn bench_frame_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/parse");

    let established = json!({
        "event": "pusher:connection_established",
        "data": json!({ "socket_id": "123.456", "activity_timeout": 120 }).to_string(),
    })
    .to_string();
    group.throughput(Throughput::Bytes(established.len() as u64));
    group.bench_function("connection_established", |b| {
        b.iter(|| Frame::parse(std::hint::black_box(&established)).expect("frame should parse"));
    });

    let plain = json!({
        "event": "update",
        "channel": "prices",
        "data": "not json at all",
    })
    .to_string();
    group.throughput(Throughput::Bytes(plain.len() as u64));
    group.bench_function("string_data", |b| {
        b.iter(|| Frame::parse(std::hint::black_box(&plain)).expect("frame should parse"));
    });

    for members in [10_usize, 100, 1000] {
        let hash: serde_json::Map<String, serde_json::Value> = (0..members)
            .map(|id| (id.to_string(), json!({ "name": format!("user {id}") })))
            .collect();
        let subscription = json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": "presence-room",
            "data": json!({ "presence": { "hash": hash, "count": members } }).to_string(),
        })
        .to_string();

        group.throughput(Throughput::Bytes(subscription.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("presence_subscription", members),
            &subscription,
            |b, text| {
                b.iter(|| Frame::parse(std::hint::black_box(text)).expect("frame should parse"));
            },
        );
    }

    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame/encode");

    let frame = Frame::new(
        "client-typing",
        json!({ "user": "42", "text": "hello there" }),
        Some("private-chat".to_owned()),
    );
    group.bench_function("client_event", |b| {
        b.iter(|| std::hint::black_box(&frame).encode().expect("frame should encode"));
    });

    group.finish();
}

criterion_group!(benches, bench_frame_parse, bench_frame_encode);
criterion_main!(benches);
