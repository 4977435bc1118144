use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use datachannel::{Channel, LogChannel, MemoryChannel};

// Every log append msyncs, so keep batches small.
const LOG_APPENDS_PER_ITER: usize = 1_000;
const MEMORY_MESSAGES_PER_ITER: usize = 10_000;

fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let channel = LogChannel::open(dir.path().join("bench_log")).expect("log");
                    let payload = vec![b'x'; size];
                    (dir, channel, payload)
                },
                |(_dir, channel, payload)| {
                    for _ in 0..LOG_APPENDS_PER_ITER {
                        channel.send(black_box(&payload)).expect("send");
                    }
                    channel.close().expect("close");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_memory_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_round_trip");
    for &size in &[64_usize, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let channel = MemoryChannel::unbounded();
            let payload = vec![b'x'; size];
            b.iter(|| {
                for _ in 0..MEMORY_MESSAGES_PER_ITER {
                    channel.send(black_box(&payload)).expect("send");
                }
                for _ in 0..MEMORY_MESSAGES_PER_ITER {
                    black_box(channel.receive().expect("receive"));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_log_append, bench_memory_round_trip);
criterion_main!(benches);
