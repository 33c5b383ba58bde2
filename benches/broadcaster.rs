//! Broadcaster fan-out benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;

use parley::broadcast::{EventBroadcaster, SessionFilter, Subscription};

fn subscribers(broadcaster: &EventBroadcaster, n: usize) -> Vec<Subscription> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                broadcaster.subscribe(SessionFilter::Any, ["tool.*"])
            } else {
                broadcaster.subscribe(SessionFilter::Only(format!("s{}", i)), ["*"])
            }
        })
        .collect()
}

fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");
    for n in [1usize, 16, 128] {
        let broadcaster = EventBroadcaster::new(1024);
        let subs = subscribers(&broadcaster, n);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let delivered = broadcaster.publish(
                    "tool.progress",
                    Some("s1"),
                    json!({"call_id": "c1", "percent": 50}),
                );
                for sub in &subs {
                    sub.drain();
                }
                black_box(delivered)
            })
        });
    }
    group.finish();
}

fn bench_full_queue_drops_oldest(c: &mut Criterion) {
    let broadcaster = EventBroadcaster::new(64);
    let _subs = subscribers(&broadcaster, 8);
    c.bench_function("publish_into_full_queues", |b| {
        b.iter(|| {
            black_box(broadcaster.publish(
                "tool.completed",
                Some("s1"),
                json!({"call_id": "c1", "status": "succeeded"}),
            ))
        })
    });
}

fn bench_async_recv(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let broadcaster = EventBroadcaster::new(1024);
    let sub = broadcaster.subscribe(SessionFilter::Any, ["*"]);
    c.bench_function("publish_then_recv", |b| {
        b.to_async(&rt).iter(|| async {
            broadcaster.publish("session.state", Some("s1"), json!({"to": "ready"}));
            black_box(sub.recv().await)
        })
    });
}

criterion_group!(
    benches,
    bench_publish_fanout,
    bench_full_queue_drops_oldest,
    bench_async_recv
);
criterion_main!(benches);
