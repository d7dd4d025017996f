// Criterion benchmarks for the wisprpc-common codec layer
//
// Run benchmarks with:
//   cargo bench -p wisprpc-common

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};
use wisprpc_common::{CodecKind, Header};

#[derive(Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
    label: String,
}

fn sample_args() -> Args {
    Args {
        num1: 123_456,
        num2: 654_321,
        label: "bench-payload".to_string(),
    }
}

fn bench_header_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_encode");
    let header = Header::request("Arith.Sum", 42);

    group.bench_function("postcard", |b| {
        b.iter(|| CodecKind::Postcard.encode(black_box(&header)).unwrap());
    });

    group.bench_function("json", |b| {
        b.iter(|| CodecKind::Json.encode(black_box(&header)).unwrap());
    });

    group.finish();
}

fn bench_body_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("body_round_trip");
    let args = sample_args();

    group.bench_function("postcard", |b| {
        b.iter(|| {
            let bytes = CodecKind::Postcard.encode(black_box(&args)).unwrap();
            let decoded: Args = CodecKind::Postcard.decode(&bytes).unwrap();
            decoded
        });
    });

    group.bench_function("json", |b| {
        b.iter(|| {
            let bytes = CodecKind::Json.encode(black_box(&args)).unwrap();
            let decoded: Args = CodecKind::Json.decode(&bytes).unwrap();
            decoded
        });
    });

    group.finish();
}

criterion_group!(benches, bench_header_encode, bench_body_round_trip);
criterion_main!(benches);
