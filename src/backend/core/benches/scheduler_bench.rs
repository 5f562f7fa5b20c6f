//! Benchmarks for the grouped job scheduler
//!
//! Run with: cargo bench

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use apex_jobs::jobs::{
    GroupedJobInitializer, GroupedJobInitializerManager, JobContext, JobExecutor, JobGroupPath,
    JobHandler, JobRegistry, JobResult, Request,
};

struct NoopJob {
    group: Option<JobGroupPath>,
}

#[async_trait]
impl JobHandler for NoopJob {
    fn job_type(&self) -> &str {
        "noop"
    }

    fn group_path(&self, _request: &Request) -> Option<JobGroupPath> {
        self.group.clone()
    }

    async fn run_internal(&self, _ctx: &JobContext) -> JobResult {
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Benchmark prefix conflict checks between group paths.
fn bench_group_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_conflicts");

    for depth in [1usize, 4, 16].iter() {
        let deep = JobGroupPath::new((0..*depth).map(|i| format!("segment-{}", i)));
        let sibling = deep
            .parent()
            .unwrap_or_else(JobGroupPath::root)
            .child("other");

        group.bench_with_input(BenchmarkId::new("prefix", depth), &deep, |b, deep| {
            let root = JobGroupPath::new(["segment-0"]);
            b.iter(|| black_box(root.conflicts(black_box(deep))));
        });
        group.bench_with_input(BenchmarkId::new("disjoint", depth), &deep, |b, deep| {
            b.iter(|| black_box(sibling.conflicts(black_box(deep))));
        });
    }
    group.finish();
}

/// Benchmark initializer lookup with and without the cache.
fn bench_initializer_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("initializer_lookup");
    let path = JobGroupPath::new(["install", "app", "plugins", "theme"]);

    for capacity in [0usize, 256].iter() {
        let manager = GroupedJobInitializerManager::new(
            GroupedJobInitializer::new(1, std::time::Duration::from_secs(60)),
            *capacity,
        );
        manager.configure(
            JobGroupPath::new(["install"]),
            GroupedJobInitializer::new(1, std::time::Duration::from_secs(5)),
        );

        group.bench_with_input(BenchmarkId::from_parameter(capacity), &path, |b, path| {
            b.iter(|| black_box(manager.get_grouped_job_initializer(black_box(path))));
        });
    }
    group.finish();
}

/// Benchmark end-to-end scheduling of many small jobs.
fn bench_scheduling(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    let mut group = c.benchmark_group("scheduling");

    for job_count in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*job_count as u64));

        group.bench_with_input(BenchmarkId::new("disjoint_groups", job_count), job_count, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let executor = JobExecutor::new(Arc::new(JobRegistry::new()));
                for i in 0..count {
                    let handler = Arc::new(NoopJob {
                        group: Some(JobGroupPath::new(["bench".to_string(), i.to_string()])),
                    });
                    let _ = executor.execute_handler(handler, Request::new());
                }
                executor.join_all().await;
            });
        });

        group.bench_with_input(BenchmarkId::new("single_group", job_count), job_count, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let executor = JobExecutor::new(Arc::new(JobRegistry::new()));
                for _ in 0..count {
                    let handler = Arc::new(NoopJob {
                        group: Some(JobGroupPath::new(["bench"])),
                    });
                    let _ = executor.execute_handler(handler, Request::new());
                }
                executor.join_all().await;
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_group_conflicts,
    bench_initializer_lookup,
    bench_scheduling,
);

criterion_main!(benches);
