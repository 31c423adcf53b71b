use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use futures::StreamExt;
use micro_async::generator::channel;
use micro_async::timeout::with_timeout;
use micro_async::{Deferred, EventLoop};
use std::time::Duration;

fn bench_timers(c: &mut Criterion) {
    c.bench_function("fire 1000 timers", |b| {
        b.iter_batched(
            || {
                let event_loop = EventLoop::virtual_time();
                for i in 0..1000u64 {
                    event_loop.set_timeout(Duration::from_millis(i % 37), || {});
                }
                event_loop
            },
            |event_loop| {
                event_loop.run();
                black_box(event_loop.now())
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_promise_settlement(c: &mut Criterion) {
    c.bench_function("settle with 16 observers", |b| {
        b.iter(|| {
            let deferred = Deferred::new();
            let promise = deferred.promise();
            for _ in 0..16 {
                promise.on_settle(|outcome| {
                    black_box(outcome.is_ok());
                });
            }
            deferred.resolve(black_box(1u64));
        });
    });
}

fn bench_with_timeout(c: &mut Criterion) {
    c.bench_function("with_timeout fast path", |b| {
        let event_loop = EventLoop::virtual_time();
        b.iter(|| {
            let guarded = with_timeout(&event_loop, Duration::from_secs(1), "bench", async { Ok(black_box(7u32)) });
            event_loop.run_until_stalled();
            black_box(guarded.outcome())
        });
    });
}

fn bench_generator(c: &mut Criterion) {
    c.bench_function("generator 1000 items", |b| {
        let event_loop = EventLoop::virtual_time();
        b.iter(|| {
            let (emitter, generator) = channel();
            for i in 0..1000u32 {
                emitter.emit(i);
            }
            emitter.close();
            event_loop.block_on(async move { Ok(generator.count().await) })
        });
    });
}

criterion_group!(benches, bench_timers, bench_promise_settlement, bench_with_timeout, bench_generator);
criterion_main!(benches);
