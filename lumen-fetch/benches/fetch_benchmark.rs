use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lumen_fetch::queue::{DispatchQueues, QueuedRequest};
use lumen_fetch::{
    AcceptFilter, FetchPipeline, FetchRequest, InFlightRegistry, MemoryTransport, PipelineConfig,
    Priority, RequestId, Requester, ResourceKey, Waiter, IMAGE_ACCEPT,
};
use std::sync::Arc;

fn bench_queue_drain(c: &mut Criterion) {
    let items: Vec<QueuedRequest> = (0..1_000u64)
        .map(|i| QueuedRequest {
            id: RequestId(i),
            key: ResourceKey::new(format!("https://x/{i}.png")),
            accept: AcceptFilter::any(),
            priority: if i % 3 == 0 { Priority::High } else { Priority::Normal },
        })
        .collect();

    c.bench_function("queue_enqueue_drain_1k", |b| {
        b.iter(|| {
            let mut queues = DispatchQueues::new();
            for item in &items {
                queues.enqueue(item.clone());
            }
            while let Some(item) = queues.dequeue() {
                black_box(item);
            }
        })
    });
}

fn bench_registry_cycle(c: &mut Criterion) {
    let registry = InFlightRegistry::new();
    let key = ResourceKey::new("https://x/a.png");

    c.bench_function("registry_register_begin_finish", |b| {
        b.iter(|| {
            let (tx, _rx) = tokio::sync::oneshot::channel();
            registry.register_or_attach(&key, Waiter::new(RequestId(1), AcceptFilter::any(), None, tx));
            let guard = registry.begin(&key, RequestId(1)).unwrap();
            black_box(guard.finish());
        })
    });
}

fn bench_accept_filter(c: &mut Criterion) {
    let filter = AcceptFilter::parse(IMAGE_ACCEPT);

    c.bench_function("accept_filter_match", |b| {
        b.iter(|| {
            black_box(filter.accepts(black_box(Some("image/GIF; charset=binary"))));
            black_box(filter.accepts(black_box(Some("text/html"))));
        })
    });
}

fn bench_pipeline_round_trip(c: &mut Criterion) {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert("https://x/a.png", "image/png", vec![0u8; 4096]);
    let pipeline = FetchPipeline::spawn(PipelineConfig::default(), transport).unwrap();

    c.bench_function("pipeline_round_trip_4KB", |b| {
        b.iter(|| {
            let handle = pipeline.request(FetchRequest::new("https://x/a.png").accept("image/png"));
            black_box(handle.wait());
        })
    });
}

criterion_group!(
    benches,
    bench_queue_drain,
    bench_registry_cycle,
    bench_accept_filter,
    bench_pipeline_round_trip,
);
criterion_main!(benches);
