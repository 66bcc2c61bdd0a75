//! Performance benchmarks for a3s-fabric
//!
//! Run with: cargo bench

use a3s_fabric::config::{CUSTOM_TEST_SOURCE, INTERNAL_BUS, STRIPE_EVENT_QUEUE};
use a3s_fabric::{DurableQueue, Event, EventPattern, Fabric, FabricConfig, QueueOptions};
use criterion::{criterion_group, criterion_main, Criterion};

fn sample_event() -> Event {
    Event::new(
        "aws.partner/stripe.com/ed_test_61",
        "charge.created",
        serde_json::json!({"object": {"id": "ch_1", "amount": 2000, "currency": "usd"}}),
    )
}

fn bench_pattern_matching(c: &mut Criterion) {
    let event = sample_event();

    let exact = EventPattern::source_in(["custom.stripe.test", "custom.other"]);
    c.bench_function("pattern exact (miss)", |b| {
        b.iter(|| exact.matches(&event));
    });

    let prefix = EventPattern::source_prefix("aws.partner/stripe.com");
    c.bench_function("pattern prefix (hit)", |b| {
        b.iter(|| prefix.matches(&event));
    });

    let nested = EventPattern::from_json(&serde_json::json!({
        "source": [{"prefix": "aws.partner/stripe.com"}],
        "detail-type": ["charge.created", "charge.updated"],
        "detail": {"object": {"currency": ["usd", "eur"]}}
    }))
    .unwrap();
    c.bench_function("pattern nested detail (hit)", |b| {
        b.iter(|| nested.matches(&event));
    });
}

fn bench_topology_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let fabric =
        Fabric::from_config(FabricConfig::partner_topology("aws.partner/stripe.com/ed_test_61"))
            .unwrap();
    let queue = fabric.queue(STRIPE_EVENT_QUEUE).unwrap();

    c.bench_function("publish partner -> processing -> queue", |b| {
        b.to_async(&rt).iter(|| async {
            let receipt = fabric.ingest_partner(sample_event()).await.unwrap();
            let batch = queue.dequeue_batch(receipt.queued().len()).await.unwrap();
            for message in batch {
                queue.ack(&message.message_id, &message.receipt_handle).await;
            }
        });
    });

    c.bench_function("publish internal (dropped)", |b| {
        b.to_async(&rt).iter(|| async {
            fabric
                .publish(
                    INTERNAL_BUS,
                    Event::new("unrelated.thing", "noise", serde_json::json!({})),
                )
                .await
                .unwrap()
        });
    });

    c.bench_function("publish internal -> queue", |b| {
        b.to_async(&rt).iter(|| async {
            let receipt = fabric
                .publish(
                    INTERNAL_BUS,
                    Event::new(CUSTOM_TEST_SOURCE, "test", serde_json::json!({"id": 1})),
                )
                .await
                .unwrap();
            let batch = queue.dequeue_batch(receipt.queued().len()).await.unwrap();
            for message in batch {
                queue.ack(&message.message_id, &message.receipt_handle).await;
            }
        });
    });
}

fn bench_queue_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("queue_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} messages", count), |b| {
            b.to_async(&rt).iter(|| async {
                let queue = DurableQueue::new("bench", QueueOptions::default());
                for i in 0..count {
                    queue
                        .enqueue(Event::new(
                            CUSTOM_TEST_SOURCE,
                            "test",
                            serde_json::json!({"i": i}),
                        ))
                        .await
                        .unwrap();
                }
                loop {
                    let batch = queue.dequeue_batch(10).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    for message in batch {
                        queue.ack(&message.message_id, &message.receipt_handle).await;
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_pattern_matching,
    bench_topology_publish,
    bench_queue_throughput,
);
criterion_main!(benches);
