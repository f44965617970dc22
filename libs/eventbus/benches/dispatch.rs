//! Event Bus Dispatch Benchmarks
//!
//! Measures:
//! - Address resolution and round-robin selection in the registry
//! - Local body hand-off (Arc clone, no serialization)
//! - Request/reply round trip across contexts for several pool sizes
//! - Codec cost paid only when an envelope leaves the node

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventbus::{
    ActorSystem, Body, BodyCodec, BusConfig, BytesCodec, DeliveryOptions, JsonCodec,
};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::time::Duration;
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Quote {
    instrument_id: u64,
    bid_price: i64,
    ask_price: i64,
    timestamp_ns: u64,
}

fn system(pool_size: usize) -> ActorSystem {
    ActorSystem::new(BusConfig {
        pool_size,
        ..BusConfig::default()
    })
    .expect("actor system")
}

fn register_echo(system: &ActorSystem, address: &str, consumers: usize) {
    for _ in 0..consumers {
        let consumer = system
            .event_bus()
            .consumer(address, |msg| {
                if msg.reply_address().is_some() {
                    msg.reply(())?;
                }
                Ok(())
            })
            .expect("consumer");
        let (tx, rx) = mpsc::channel();
        consumer.completion_handler(move |r| {
            let _ = tx.send(r);
        });
        rx.recv_timeout(TIMEOUT).expect("registration").expect("registered");
    }
}

fn bench_registry_round_robin(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let rt = Runtime::new().unwrap();

    for consumers in [1usize, 8, 32] {
        let system = system(4);
        register_echo(&system, "bench.rr", consumers);
        let registry = system.event_bus().registry();

        group.bench_with_input(BenchmarkId::new("next_round_robin", consumers), &consumers, |b, _| {
            b.iter(|| black_box(registry.next_round_robin("bench.rr")));
        });
        group.bench_with_input(BenchmarkId::new("resolve", consumers), &consumers, |b, _| {
            b.iter(|| black_box(registry.resolve("bench.rr")));
        });

        rt.block_on(system.shutdown()).unwrap();
    }
    group.finish();
}

fn bench_body_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("body");
    let quote = Body::new(Quote {
        instrument_id: 12345,
        bid_price: 4500_00000000,
        ask_price: 4501_00000000,
        timestamp_ns: 1234567890,
    });
    let payload = Body::from(vec![0u8; 16]);

    group.bench_function("local_clone", |b| {
        b.iter(|| black_box(quote.clone()));
    });

    let bytes = BytesCodec;
    group.bench_function("bytes_codec_crossing", |b| {
        b.iter(|| {
            let frame = bytes.encode(&payload).unwrap();
            black_box(bytes.decode(&frame).unwrap())
        });
    });

    let json = JsonCodec::<Quote>::new();
    group.bench_function("json_codec_crossing", |b| {
        b.iter(|| {
            let frame = json.encode(&quote).unwrap();
            black_box(json.decode(&frame).unwrap())
        });
    });
    group.finish();
}

fn bench_request_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_reply");
    group.throughput(Throughput::Elements(1));
    let rt = Runtime::new().unwrap();

    for pool_size in [1usize, 4] {
        let system = system(pool_size);
        register_echo(&system, "bench.echo", pool_size);
        let bus = system.event_bus().clone();

        group.bench_with_input(BenchmarkId::new("future", pool_size), &pool_size, |b, _| {
            b.iter(|| {
                rt.block_on(bus.request("bench.echo", vec![0u8; 16], TIMEOUT))
                    .unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("handler", pool_size), &pool_size, |b, _| {
            b.iter(|| {
                let (tx, rx) = mpsc::channel();
                bus.send_with_reply("bench.echo", vec![0u8; 16], DeliveryOptions::default(), move |r| {
                    let _ = tx.send(r.is_ok());
                })
                .unwrap();
                assert!(rx.recv_timeout(TIMEOUT).unwrap());
            });
        });

        rt.block_on(system.shutdown()).unwrap();
    }
    group.finish();
}

fn bench_fire_and_forget(c: &mut Criterion) {
    let mut group = c.benchmark_group("send");
    let rt = Runtime::new().unwrap();
    let system = system(2);
    register_echo(&system, "bench.sink", 2);
    let bus = system.event_bus().clone();

    group.bench_function("point_to_point", |b| {
        b.iter(|| bus.send("bench.sink", ()).unwrap());
    });
    group.bench_function("publish", |b| {
        b.iter(|| bus.publish("bench.sink", ()).unwrap());
    });

    // let the queued deliveries drain before the contexts close
    std::thread::sleep(Duration::from_millis(200));
    rt.block_on(system.shutdown()).unwrap();
    group.finish();
}

criterion_group!(
    benches,
    bench_registry_round_robin,
    bench_body_handoff,
    bench_request_reply,
    bench_fire_and_forget
);
criterion_main!(benches);
