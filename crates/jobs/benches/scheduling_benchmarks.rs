//! Benchmarks for the scheduling hot path.
//!
//! Measures:
//! - Candidate selection and claim throughput on the in-memory store
//! - Dependency resolution over batches of chained jobs
//! - Retry delay computation

use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use tidepool_jobs::{
    BatchId, ClaimOrder, DependencyResolver, InMemoryJobStore, Job, JobKind, JobStore, Priority,
    RetryPolicy, TenantId,
};

fn seeded_store(count: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let tenant_id = TenantId::new();
    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
    for i in 0..count {
        let job = Job::new(
            tenant_id,
            JobKind::normalize_record("contact"),
            serde_json::json!({ "record": i }),
        )
        .with_priority(priorities[i % priorities.len()]);
        store.insert(job).unwrap();
    }
    store
}

/// `chains` batches, each a linear chain of `length` jobs.
fn chained_store(chains: usize, length: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let tenant_id = TenantId::new();
    for _ in 0..chains {
        let batch_id = BatchId::new();
        let mut previous = None;
        for step in 0..length {
            let job = Job::new(
                tenant_id,
                JobKind::derive_insight("pipeline"),
                serde_json::json!({ "step": step }),
            )
            .in_batch(batch_id)
            .depends_on(previous);
            previous = Some(store.insert(job).unwrap());
        }
    }
    store
}

fn bench_claim_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_throughput");

    for queue_size in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(64));
        group.bench_with_input(
            BenchmarkId::new("queued_then_claim", queue_size),
            queue_size,
            |b, &size| {
                b.iter_batched(
                    || seeded_store(size),
                    |store| {
                        let now = Utc::now();
                        let candidates = store
                            .queued(now, ClaimOrder::PriorityThenSchedule, None, 256)
                            .unwrap();
                        let ids: Vec<_> = candidates.iter().map(|j| j.id).collect();
                        black_box(
                            store
                                .claim_ready(&ids, 64, ClaimOrder::PriorityThenSchedule, now)
                                .unwrap(),
                        );
                    },
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_dependency_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_resolution");

    for chains in [1, 10, 50].iter() {
        let store = chained_store(*chains, 20);
        let candidates = store
            .queued(Utc::now(), ClaimOrder::PriorityThenSchedule, None, usize::MAX)
            .unwrap();
        group.throughput(Throughput::Elements(candidates.len() as u64));

        group.bench_with_input(BenchmarkId::new("cold_views", chains), &candidates, |b, jobs| {
            b.iter(|| {
                let mut resolver = DependencyResolver::new(Duration::from_secs(30));
                black_box(resolver.resolve(&store, jobs, Instant::now()).unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("cached_views", chains), &candidates, |b, jobs| {
            let mut resolver = DependencyResolver::new(Duration::from_secs(3600));
            resolver.resolve(&store, jobs, Instant::now()).unwrap();
            b.iter(|| {
                black_box(resolver.resolve(&store, jobs, Instant::now()).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_retry_delay(c: &mut Criterion) {
    let policy = RetryPolicy::default();

    c.bench_function("retry_delay_with_jitter", |b| {
        b.iter(|| {
            for attempt in 1..=policy.max_attempts {
                black_box(policy.delay_for_attempt(black_box(attempt)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_claim_throughput,
    bench_dependency_resolution,
    bench_retry_delay
);
criterion_main!(benches);
