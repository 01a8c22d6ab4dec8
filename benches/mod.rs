use criterion::{criterion_group, criterion_main};

#[path = "../tests/support/mod.rs"]
mod support;

mod rx;

criterion_group!(
    benches,
    rx::bench_lz4_literals,
    rx::bench_lz4_runs,
    rx::bench_checksum,
    upgrade::bench_full_upgrade,
    upgrade::bench_resume
);
criterion_main!(benches);
