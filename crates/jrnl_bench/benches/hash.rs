//! Payload hashing and compression benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jrnl_bench::random_data;
use jrnl_core::{jenkins_hash64, siphash24, Codec, Lz4Codec};

/// Benchmark both payload hash functions.
fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash");
    let key = [7u8; 16];

    for size in [16, 64, 256, 4096].iter() {
        let data = random_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("jenkins", size), &data, |b, data| {
            b.iter(|| black_box(jenkins_hash64(black_box(data))));
        });
        group.bench_with_input(BenchmarkId::new("siphash", size), &data, |b, data| {
            b.iter(|| black_box(siphash24(&key, black_box(data))));
        });
    }
    group.finish();
}

/// Benchmark LZ4 on a compressible payload.
fn bench_lz4(c: &mut Criterion) {
    let mut group = c.benchmark_group("lz4");
    let data = "MESSAGE=connection from 10.0.0.1 accepted ".repeat(100).into_bytes();
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("compress", |b| {
        b.iter(|| black_box(Lz4Codec.compress(black_box(&data))));
    });

    let compressed = Lz4Codec.compress(&data).unwrap();
    group.bench_function("decompress", |b| {
        b.iter(|| black_box(Lz4Codec.decompress(black_box(&compressed), data.len()).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_hash, bench_lz4);
criterion_main!(benches);
