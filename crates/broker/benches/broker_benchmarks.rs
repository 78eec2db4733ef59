use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use rmb_broker::{ExponentialBackoff, InMemoryMessageRepository, MessageRepository, ThrottlingStrategy};
use rmb_core::{ConsumerId, QueueId};
use std::time::Duration;

fn ids() -> (QueueId, Vec<ConsumerId>) {
    let queue = QueueId::new("orders").unwrap();
    let consumers = vec![
        ConsumerId::new("billing").unwrap(),
        ConsumerId::new("shipping").unwrap(),
    ];
    (queue, consumers)
}

/// Publish, claim and complete one message for one consumer.
fn bench_message_round_trip(c: &mut Criterion) {
    let (queue, consumers) = ids();
    let repository = InMemoryMessageRepository::new();
    let payload = br#"{"order_id":1}"#.to_vec();

    c.bench_function("in_memory_add_claim_complete", |b| {
        b.iter(|| {
            repository.add(&queue, &consumers[..1], payload.clone()).unwrap();
            let claimed = repository
                .take_for_processing(&queue, &consumers[0], 1)
                .unwrap()
                .remove(0);
            let completed = claimed.update.completed(Utc::now()).unwrap();
            black_box(repository.update(&completed).unwrap());
        });
        repository.remove_processed().unwrap();
    });
}

/// Claim a batch out of a backlog, the path every poll cycle takes.
fn bench_claim_from_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_claim_batch");
    let (queue, consumers) = ids();

    for backlog in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(16));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    let repository = InMemoryMessageRepository::new();
                    for n in 0..backlog {
                        repository
                            .add(&queue, &consumers, format!("{{\"order_id\":{n}}}").into_bytes())
                            .unwrap();
                    }
                    repository
                },
                |repository| {
                    black_box(repository.take_for_processing(&queue, &consumers[1], 16).unwrap())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_backoff_delay(c: &mut Criterion) {
    let strategy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60));

    c.bench_function("exponential_backoff_delay", |b| {
        b.iter(|| {
            for retry in 0..64u32 {
                black_box(strategy.delay(black_box(retry)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_message_round_trip,
    bench_claim_from_backlog,
    bench_backoff_delay
);
criterion_main!(benches);
