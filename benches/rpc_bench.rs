use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use wirerpc::packet::{PktHdr, PktKind};
use wirerpc::wheel::{TimerEntry, TimingWheel};
use wirerpc::{BufferPool, PoolConfig};

fn bench_pool(c: &mut Criterion) {
    let mut pool = BufferPool::new(&PoolConfig {
        max_msg_size: 8192,
        slots_per_class: 128,
    })
    .unwrap();

    c.bench_function("pool_alloc_free_64", |b| {
        b.iter(|| {
            let buf = pool.alloc(64).unwrap();
            pool.free(buf);
        })
    });

    c.bench_function("pool_alloc_free_4096", |b| {
        b.iter(|| {
            let buf = pool.alloc(4096).unwrap();
            pool.free(buf);
        })
    });
}

fn bench_wheel(c: &mut Criterion) {
    c.bench_function("wheel_insert_advance_64", |b| {
        b.iter_batched(
            || {
                let mut wheel = TimingWheel::new(256, 100);
                wheel.init(0);
                wheel
            },
            |mut wheel| {
                for i in 0..64u64 {
                    wheel.insert(TimerEntry {
                        session: 0,
                        slot: i as usize % 32,
                        req_num: i,
                        fire_at_us: 100 + i * 37,
                    });
                }
                let mut out = Vec::with_capacity(64);
                wheel.advance_into(5000, &mut out);
                out
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_packet(c: &mut Criterion) {
    let hdr = PktHdr::new(1, 7, 4096, PktKind::Req, 3, 0xBEEF_CAFE);

    c.bench_function("pkt_hdr_encode", |b| b.iter(|| hdr.to_bytes()));

    let bytes = hdr.to_bytes();
    c.bench_function("pkt_hdr_decode", |b| {
        b.iter(|| PktHdr::from_bytes(&bytes).unwrap())
    });
}

criterion_group!(benches, bench_pool, bench_wheel, bench_packet);
criterion_main!(benches);
