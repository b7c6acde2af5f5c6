//! Benchmarks for admission and the dispatch cycle.
//!
//! Benchmarks cover:
//! - Pure parallel / sequence selection over task tables of growing size
//! - In-memory and SQLite store admission queries
//! - A full process cycle on the in-memory store

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::hint::black_box;
use std::sync::Arc;

use prometheus_task_lot::core::{
    select_parallel, select_sequence, Activity, ActivityMode, NewTask, NewTaskRequest, Scheduler,
    SchedulerOptions, Spawn, TaskRecord, TaskStatus, TaskStore,
};
use prometheus_task_lot::infra::{InMemoryTaskStore, SqliteTaskStore};
use prometheus_task_lot::util::Priority;

use tokio::runtime::Runtime;

// ============================================================================
// Helpers
// ============================================================================

#[derive(Clone)]
struct TokioHereSpawner;

impl Spawn for TokioHereSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut);
    }
}

const CODES: [&str; 8] = ["a", "b", "c", "d", "e", "f", "g", "h"];

fn codes() -> Vec<String> {
    CODES.iter().map(|c| (*c).to_string()).collect()
}

fn random_table(size: usize) -> Vec<TaskRecord> {
    let mut rng = rand::rng();
    (0..size)
        .map(|i| {
            let mut task = TaskRecord::from_new(
                NewTask {
                    activity_code: CODES[rng.random_range(0..CODES.len())].to_string(),
                    input: serde_json::json!({ "i": i }),
                    priority: Priority::new(rng.random_range(0..=9)).unwrap(),
                    max_retry_times: None,
                },
                i as u64,
            );
            task.status = match rng.random_range(0..10) {
                0 => TaskStatus::Running,
                1 => TaskStatus::TemporarilyFailed,
                2 => TaskStatus::Finished,
                _ => TaskStatus::Idle,
            };
            if task.status == TaskStatus::TemporarilyFailed {
                task.failed_at = Some(i as u64 + 10);
            }
            task
        })
        .collect()
}

// ============================================================================
// Pure selection
// ============================================================================

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");
    let codes = codes();
    for size in [100usize, 1_000, 10_000] {
        let table = random_table(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("parallel", size), &table, |b, table| {
            b.iter(|| black_box(select_parallel(table.iter(), &codes, 5)));
        });
        group.bench_with_input(BenchmarkId::new("sequence", size), &table, |b, table| {
            b.iter(|| black_box(select_sequence(table.iter(), &codes, 5)));
        });
    }
    group.finish();
}

// ============================================================================
// Store admission queries
// ============================================================================

fn bench_store_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("store_admission");
    let codes = codes();

    let memory: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let sqlite: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
    let table = random_table(5_000);
    rt.block_on(async {
        for task in &table {
            memory.insert_task(task.clone()).await.unwrap();
            sqlite.insert_task(task.clone()).await.unwrap();
        }
    });

    for (name, store) in [("memory", &memory), ("sqlite", &sqlite)] {
        group.bench_function(BenchmarkId::new("parallel", name), |b| {
            b.to_async(&rt)
                .iter(|| async { black_box(store.parallel_tasks(&codes, 5).await.unwrap()) });
        });
        group.bench_function(BenchmarkId::new("sequence", name), |b| {
            b.to_async(&rt)
                .iter(|| async { black_box(store.sequence_tasks(&codes, 5).await.unwrap()) });
        });
    }
    group.finish();
}

// ============================================================================
// End-to-end cycle
// ============================================================================

fn bench_process_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("process_cycle");
    group.throughput(Throughput::Elements(50));

    group.bench_function("memory_50_tasks", |b| {
        b.to_async(&rt).iter(|| async {
            let scheduler = Scheduler::new(
                Arc::new(InMemoryTaskStore::new()),
                TokioHereSpawner,
                SchedulerOptions {
                    task_limit: 50,
                    ..SchedulerOptions::default()
                },
            );
            scheduler
                .register(
                    Activity::builder("work")
                        .mode(ActivityMode::Parallel)
                        .process_fn(|task| async move { Ok(task.input) })
                        .build()
                        .unwrap(),
                )
                .unwrap();
            for i in 0..50 {
                scheduler
                    .create_task(NewTaskRequest::new("work", serde_json::json!(i)))
                    .await
                    .unwrap();
            }
            black_box(scheduler.process_and_wait().await.unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_selection, bench_store_admission, bench_process_cycle);
criterion_main!(benches);
