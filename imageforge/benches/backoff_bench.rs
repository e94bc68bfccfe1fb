//! Benchmarks for retry backoff computation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use imageforge::retry::{JitterStrategy, RetryPolicy};

fn backoff_benchmark(c: &mut Criterion) {
    let policy = RetryPolicy::new()
        .with_max_attempts(10)
        .with_initial_delay_ms(100)
        .with_max_delay_ms(30_000);

    c.bench_function("delay_schedule", |b| {
        b.iter(|| black_box(&policy).total_delay())
    });

    let jittered = policy.with_jitter(JitterStrategy::Equal);
    c.bench_function("jittered_delay", |b| {
        b.iter(|| {
            for attempt in 1..=10 {
                black_box(jittered.jittered_delay(black_box(attempt)));
            }
        })
    });
}

criterion_group!(benches, backoff_benchmark);
criterion_main!(benches);
