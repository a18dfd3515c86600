use criterion::{black_box, criterion_group, criterion_main, Criterion};

use quince::{qsbr, GrampaMap, LeapfrogMap, LinearMap};

const PREFILL: u64 = 1 << 16;

macro_rules! bench_variant {
    ($group:expr, $name:literal, $map:ty) => {{
        let ctx = qsbr::default().create_context();
        let map = <$map>::with_capacity(PREFILL as usize);
        for k in 1..=PREFILL {
            map.assign(k, k | 2);
        }
        qsbr::default().update(ctx);

        $group.bench_function(concat!($name, "/get"), |b| {
            let mut k = 1u64;
            b.iter(|| {
                k = k % PREFILL + 1;
                black_box(map.get(k))
            })
        });

        $group.bench_function(concat!($name, "/assign"), |b| {
            let mut k = 1u64;
            b.iter(|| {
                k = k % PREFILL + 1;
                black_box(map.assign(k, k | 2))
            })
        });

        $group.bench_function(concat!($name, "/erase_assign"), |b| {
            let mut k = 1u64;
            b.iter(|| {
                k = k % PREFILL + 1;
                map.erase(k);
                black_box(map.assign(k, k | 2))
            })
        });

        qsbr::default().update(ctx);
        qsbr::default().destroy_context(ctx);
    }};
}

fn single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread");
    bench_variant!(group, "linear", LinearMap<u64, u64>);
    bench_variant!(group, "leapfrog", LeapfrogMap<u64, u64>);
    bench_variant!(group, "grampa", GrampaMap<u64, u64>);
    group.finish();
}

fn growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("growth");
    group.sample_size(10);

    group.bench_function("leapfrog/insert_64k", |b| {
        b.iter(|| {
            let ctx = qsbr::default().create_context();
            let map: LeapfrogMap<u64, u64> = LeapfrogMap::with_capacity(8);
            for k in 1..=PREFILL {
                map.assign(k, k | 2);
            }
            qsbr::default().update(ctx);
            qsbr::default().destroy_context(ctx);
            black_box(map)
        })
    });

    group.finish();
}

criterion_group!(benches, single_thread, growth);
criterion_main!(benches);
