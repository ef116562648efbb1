//! Queue and quota benchmarks for performance testing
//!
//! Run with: cargo bench --bench queue_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;
use url::Url;

use boss_dl::core::{Requester, TaskPriority};
use boss_dl::download::{QueueManager, QuotaLimits, QuotaManager};

fn urls(count: usize) -> Vec<Url> {
    (0..count)
        .map(|i| Url::parse(&format!("https://media.example/clip/{}.mp4", i)).unwrap())
        .collect()
}

fn runtime() -> Runtime {
    Runtime::new().unwrap()
}

fn benchmark_queue_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_enqueue");

    for size in [10, 100, 1000].iter() {
        let batch = urls(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| {
                let batch = &batch;
                async move {
                    let queue = QueueManager::new(size, 10);
                    for (i, url) in batch.iter().enumerate() {
                        let _ = queue.enqueue(url.clone(), Requester((i % 7) as u64)).await;
                    }
                    black_box(queue.len().await)
                }
            })
        });
    }

    group.finish();
}

fn benchmark_queue_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_drain");

    for size in [10, 100, 1000].iter() {
        let batch = urls(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| {
                let batch = &batch;
                async move {
                    let queue = QueueManager::new(size, size);
                    for url in batch.iter() {
                        let _ = queue.enqueue(url.clone(), Requester(1)).await;
                    }
                    let mut count = 0;
                    while queue.dequeue_next().await.is_some() {
                        count += 1;
                    }
                    black_box(count)
                }
            })
        });
    }

    group.finish();
}

fn benchmark_priority_ordering(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("priority_ordering");
    let batch = urls(110);

    // High priority items jump ahead of 100 normal ones
    group.bench_function("insert_high_priority", |b| {
        b.to_async(&rt).iter(|| {
            let batch = &batch;
            async move {
                let queue = QueueManager::new(200, 10);
                for url in &batch[..100] {
                    let _ = queue.enqueue(url.clone(), Requester(1)).await;
                }
                for url in &batch[100..] {
                    let _ = queue
                        .enqueue_with_priority(url.clone(), Requester(2), TaskPriority::High)
                        .await;
                }
                black_box(queue.len().await)
            }
        })
    });

    group.finish();
}

fn benchmark_concurrent_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent_access");
    let batch = Arc::new(urls(400));

    group.bench_function("4_tasks_enqueue", |b| {
        b.to_async(&rt).iter(|| {
            let batch = Arc::clone(&batch);
            async move {
                let queue = Arc::new(QueueManager::new(400, 10));
                let handles: Vec<_> = (0..4)
                    .map(|task_id| {
                        let queue = Arc::clone(&queue);
                        let batch = Arc::clone(&batch);
                        tokio::spawn(async move {
                            for url in batch.iter().skip(task_id * 100).take(100) {
                                let _ = queue.enqueue(url.clone(), Requester(task_id as u64)).await;
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.await;
                }
                black_box(queue.len().await)
            }
        })
    });

    group.finish();
}

fn benchmark_quota_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("quota");

    group.bench_function("reserve_commit_100", |b| {
        b.to_async(&rt).iter(|| async {
            let quota = QuotaManager::new(QuotaLimits {
                max_file_bytes: 1 << 30,
                max_user_bytes: u64::MAX,
                max_user_concurrent: 1,
            });
            for i in 0..100u64 {
                if let Ok(reservation) = quota.reserve(Requester(i % 10), 4096).await {
                    quota.commit(&reservation, 4000).await;
                }
            }
            black_box(quota.usage(Requester(0)).await.bytes_used)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_queue_enqueue,
    benchmark_queue_drain,
    benchmark_priority_ordering,
    benchmark_concurrent_enqueue,
    benchmark_quota_cycle,
);
criterion_main!(benches);
