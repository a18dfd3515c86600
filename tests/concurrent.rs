mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use common::{for_each_map, threads, MapUnderTest};
use quince::qsbr;
use rand::prelude::*;

fn concurrent_insert_distinct_keys<M: MapUnderTest>() {
    const PER_THREAD: u64 = 4_000;

    let map = M::with_capacity(8);
    let workers = threads() as u64;
    let barrier = Barrier::new(workers as usize);

    thread::scope(|s| {
        for t in 0..workers {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                barrier.wait();
                let base = t * PER_THREAD;
                for i in 0..PER_THREAD {
                    let key = base + i + 1;
                    map.assign(key, key << 3);
                }
                qsbr::default().update(ctx);
                for i in 0..PER_THREAD {
                    let key = base + i + 1;
                    assert_eq!(map.get(key), key << 3, "{}", M::NAME);
                }
                qsbr::default().destroy_context(ctx);
            });
        }
    });

    for key in 1..=workers * PER_THREAD {
        assert_eq!(map.get(key), key << 3, "{}", M::NAME);
    }
}

#[test]
fn insert_distinct_keys() {
    for_each_map!(concurrent_insert_distinct_keys);
}

fn concurrent_same_key_churn<M: MapUnderTest>() {
    const KEYS: u64 = 16;
    const OPS: usize = 20_000;

    let map = M::with_capacity(8);
    let workers = threads();
    let barrier = Barrier::new(workers);

    thread::scope(|s| {
        for _ in 0..workers {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                let mut rng = rand::thread_rng();
                barrier.wait();
                for op in 0..OPS {
                    let key = rng.gen_range(1..=KEYS);
                    if rng.gen_bool(0.3) {
                        let previous = map.erase(key);
                        assert!(previous == 0 || previous >= 100, "{}", M::NAME);
                    } else {
                        let value = 100 + rng.gen_range(0..1000u64);
                        let previous = map.assign(key, value);
                        assert!(previous == 0 || previous >= 100, "{}", M::NAME);
                    }
                    if op % 1024 == 0 {
                        qsbr::default().update(ctx);
                    }
                }
                qsbr::default().destroy_context(ctx);
            });
        }
    });

    // Whatever survived, reads are coherent: never a reserved word.
    for key in 1..=KEYS {
        let value = map.get(key);
        assert!(value == 0 || value >= 100, "{}", M::NAME);
    }
}

#[test]
fn same_key_churn() {
    for_each_map!(concurrent_same_key_churn);
}

// A writer keeps updating one key while another thread floods unrelated
// keys to force migrations out from under it. The writer's last value must
// survive every redirect.
fn redirect_follow_correctness<M: MapUnderTest>() {
    const WRITES: u64 = 30_000;
    const TARGET: u64 = 777;

    let map = M::with_capacity(4);
    let done = AtomicBool::new(false);
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        let writer = {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                barrier.wait();
                let mut last = 0;
                for i in 0..WRITES {
                    last = 100 + i;
                    map.assign(TARGET, last);
                    if i % 4096 == 0 {
                        qsbr::default().update(ctx);
                    }
                }
                qsbr::default().destroy_context(ctx);
                last
            })
        };

        {
            let map = &map;
            let done = &done;
            let barrier = &barrier;
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                barrier.wait();
                let mut key = 10_000u64;
                while !done.load(Ordering::Relaxed) {
                    for _ in 0..512 {
                        key += 1;
                        map.assign(key, key);
                    }
                    qsbr::default().update(ctx);
                }
                qsbr::default().destroy_context(ctx);
            });
        }

        let last = writer.join().unwrap();
        done.store(true, Ordering::Relaxed);

        // The flooder may still be mid-batch; hold a context so nothing is
        // reclaimed under this read.
        let ctx = qsbr::default().create_context();
        // The writer is the only thread touching TARGET, so the map must
        // hold its final write: never 0, never a sentinel.
        assert_eq!(map.get(TARGET), last, "{}", M::NAME);
        qsbr::default().destroy_context(ctx);
    });
}

#[test]
fn redirect_follow() {
    for_each_map!(redirect_follow_correctness);
}

fn concurrent_erase_vs_insert<M: MapUnderTest>() {
    const KEYS: u64 = 512;

    let map = M::with_capacity(8);
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                barrier.wait();
                for k in 1..=KEYS {
                    map.assign(k, k + 50);
                }
                qsbr::default().destroy_context(ctx);
            });
        }
        {
            let map = &map;
            let barrier = &barrier;
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                barrier.wait();
                for k in 1..=KEYS {
                    map.erase(k);
                }
                qsbr::default().destroy_context(ctx);
            });
        }
    });

    // Each key holds either the inserted value or nothing.
    for k in 1..=KEYS {
        let value = map.get(k);
        assert!(value == 0 || value == k + 50, "{}: key {k} held {value}", M::NAME);
    }
}

#[test]
fn erase_vs_insert() {
    for_each_map!(concurrent_erase_vs_insert);
}
