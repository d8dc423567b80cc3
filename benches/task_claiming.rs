//! Benchmarks the queue's claim path (`dequeue`) under concurrent demand:
//! a single claim and ten workers contending for the same ready set.

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;
use workflow_core::queue::{EnqueueRequest, InMemoryTaskQueue, TaskQueue};

fn bench_claim_single_ready_message(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();

    c.bench_function("dequeue_single_ready_message", |b| {
        b.to_async(&runtime).iter_batched(
            || {
                let queue = InMemoryTaskQueue::new(30);
                let queue = Arc::new(queue);
                let q = Arc::clone(&queue);
                runtime.block_on(async move {
                    q.enqueue(EnqueueRequest {
                        execution_id: uuid::Uuid::new_v4(),
                        payload: json!({}),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                });
                queue
            },
            |queue| async move {
                queue.dequeue(Duration::from_millis(50)).await.unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_claim_under_contention(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();

    c.bench_function("dequeue_ten_workers_contending", |b| {
        b.to_async(&runtime).iter_batched(
            || {
                let queue = Arc::new(InMemoryTaskQueue::new(30));
                let q = Arc::clone(&queue);
                runtime.block_on(async move {
                    for _ in 0..10 {
                        q.enqueue(EnqueueRequest {
                            execution_id: uuid::Uuid::new_v4(),
                            payload: json!({}),
                            ..Default::default()
                        })
                        .await
                        .unwrap();
                    }
                });
                queue
            },
            |queue| async move {
                let mut handles = Vec::with_capacity(10);
                for _ in 0..10 {
                    let queue = Arc::clone(&queue);
                    handles.push(tokio::spawn(async move {
                        queue.dequeue(Duration::from_millis(50)).await.unwrap()
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_claim_single_ready_message, bench_claim_under_contention);
criterion_main!(benches);
