use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lrpc::ring::{RingBuffer, MAX_MSG_SIZE};
use std::{sync::Arc, thread};

fn benchmark_single_threaded_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("FramedRing_SingleThreaded");

    for payload_size in [16usize, 256, 1024, MAX_MSG_SIZE].iter() {
        group.throughput(Throughput::Bytes(*payload_size as u64 * 100));
        group.bench_with_input(
            BenchmarkId::new("write_read_100", payload_size),
            payload_size,
            |b, &payload_size| {
                let ring = RingBuffer::new(1024 * 1024).unwrap();
                let payload = vec![0xA5u8; payload_size];
                let mut out = vec![0u8; MAX_MSG_SIZE];

                b.iter(|| {
                    for _ in 0..100 {
                        assert!(ring.try_write(&payload));
                    }
                    for _ in 0..100 {
                        ring.try_read(&mut out).unwrap().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn benchmark_spsc_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("FramedRing_SPSC");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("ping_10k_64B", |b| {
        b.iter(|| {
            let ring = Arc::new(RingBuffer::new(256 * 1024).unwrap());
            let producer_ring = ring.clone();

            let producer = thread::spawn(move || {
                let payload = [0x5Au8; 64];
                let mut sent = 0u32;
                while sent < 10_000 {
                    if producer_ring.try_write(&payload) {
                        sent += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });

            let mut out = vec![0u8; MAX_MSG_SIZE];
            let mut received = 0u32;
            while received < 10_000 {
                if ring.try_read(&mut out).unwrap().is_some() {
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            producer.join().unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_single_threaded_throughput,
    benchmark_spsc_threads
);
criterion_main!(benches);
