use crate::support::{lz4_literals, lz4_run, pattern};
use criterion::{Criterion, Throughput};
use libota::rx::lz4::decompress_into;
use std::hint::black_box;

const BLOCK: usize = 4096;

pub fn bench_lz4_literals(c: &mut Criterion) {
    let data = pattern(BLOCK, 7);
    let block = lz4_literals(&data);
    let mut out = vec![0u8; BLOCK];

    let mut group = c.benchmark_group("lz4");
    group.throughput(Throughput::Bytes(BLOCK as u64));
    group.bench_function("literals", |b| {
        b.iter(|| decompress_into(black_box(&block), &mut out).expect("decode"))
    });
    group.finish();
}

pub fn bench_lz4_runs(c: &mut Criterion) {
    let block = lz4_run(0xA5, BLOCK);
    let mut out = vec![0u8; BLOCK];

    let mut group = c.benchmark_group("lz4");
    group.throughput(Throughput::Bytes(BLOCK as u64));
    group.bench_function("runs", |b| {
        b.iter(|| decompress_into(black_box(&block), &mut out).expect("decode"))
    });
    group.finish();
}

pub fn bench_checksum(c: &mut Criterion) {
    let data = pattern(64 * 1024, 3);

    let mut group = c.benchmark_group("verify");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("crc32", |b| {
        b.iter(|| {
            let mut hasher = crc32fast::Hasher::new();
            for chunk in data.chunks(512) {
                hasher.update(black_box(chunk));
            }
            hasher.finalize()
        })
    });
    group.finish();
}
