use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use eventcore::{
    flag_equals, flags, CallbackPolicy, Combinator, Dispatcher, Event, Flag, Flags, MatchStream,
    Subscriber, ValueType,
};

fn make_fanout(subscribers: usize) -> (Dispatcher, Event, Vec<MatchStream>) {
    let dispatcher = Dispatcher::new();
    let event = Event::builder(&dispatcher)
        .id("bench")
        .data_type(ValueType::Int)
        .flag(Flag::new("kind", ValueType::String))
        .build()
        .unwrap();
    let streams = (0..subscribers)
        .map(|_| {
            Subscriber::builder(&dispatcher)
                .member((&event, flag_equals("kind", "tick")))
                .queue_capacity(1)
                .build()
                .unwrap()
                .stream(1)
        })
        .collect();
    (dispatcher, event, streams)
}

fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch/publish_fanout");
    for subscribers in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_function(format!("{subscribers}_subscribers"), |b| {
            b.iter_custom(|iters| {
                let (_dispatcher, event, _streams) = make_fanout(subscribers);
                let start = Instant::now();
                for i in 0..iters {
                    event.set(i as i64, flags([("kind", "tick")])).unwrap();
                }
                start.elapsed()
            });
        });
    }
    group.finish();
}

fn bench_and_compound(c: &mut Criterion) {
    c.bench_function("dispatch/and_compound", |b| {
        b.iter_custom(|iters| {
            let dispatcher = Dispatcher::new();
            let left = Event::builder(&dispatcher).id("left").build().unwrap();
            let right = Event::builder(&dispatcher).id("right").build().unwrap();
            let sub = Subscriber::builder(&dispatcher)
                .members([&left, &right])
                .combinator(Combinator::And)
                .callback_policy(CallbackPolicy::Inline)
                .callback(|m| {
                    criterion::black_box(m.matched_positions().len());
                })
                .build()
                .unwrap();

            let start = Instant::now();
            for i in 0..iters {
                left.set(i as i64, Flags::new()).unwrap();
                right.set(i as i64, Flags::new()).unwrap();
            }
            let elapsed = start.elapsed();
            sub.stop();
            elapsed
        });
    });
}

criterion_group!(dispatch, bench_publish_fanout, bench_and_compound);
criterion_main!(dispatch);
