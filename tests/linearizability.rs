// Small litmus tests in the store-buffer and IRIW shapes. Individual map
// operations are linearizable, so the non-SC outcomes must never show up,
// no matter how the threads interleave. These are probabilistic: each
// shape runs many trials with fresh keys.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;
use std::thread;

use common::{for_each_map, MapUnderTest};
use quince::qsbr;

const TRIALS: u64 = 2_000;

fn store_buffer<M: MapUnderTest>() {
    let map = M::with_capacity(1 << 14);
    let start = Barrier::new(2);
    let finish = Barrier::new(2);
    let r1 = AtomicU64::new(0);
    let r2 = AtomicU64::new(0);

    thread::scope(|s| {
        {
            let (map, start, finish, r1) = (&map, &start, &finish, &r1);
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                for trial in 0..TRIALS {
                    let x = trial * 2 + 1;
                    let y = trial * 2 + 2;
                    start.wait();
                    map.assign(x, 2);
                    r1.store(map.get(y), Ordering::Relaxed);
                    finish.wait();
                }
                qsbr::default().destroy_context(ctx);
            });
        }
        {
            let (map, start, finish, r1, r2) = (&map, &start, &finish, &r1, &r2);
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                for trial in 0..TRIALS {
                    let x = trial * 2 + 1;
                    let y = trial * 2 + 2;
                    start.wait();
                    map.assign(y, 2);
                    r2.store(map.get(x), Ordering::Relaxed);
                    finish.wait();

                    // Check the outcome after both threads are done with
                    // the trial: at least one read must see the other's
                    // write.
                    let (a, b) = (r1.load(Ordering::Relaxed), r2.load(Ordering::Relaxed));
                    assert!(
                        !(a == 0 && b == 0),
                        "{}: store-buffer outcome on trial {trial}",
                        M::NAME
                    );
                }
                qsbr::default().destroy_context(ctx);
            });
        }
    });
}

#[test]
fn store_buffer_litmus() {
    for_each_map!(store_buffer);
}

fn iriw<M: MapUnderTest>() {
    let map = M::with_capacity(1 << 14);
    let start = Barrier::new(4);
    let finish = Barrier::new(4);
    // (a, b) read by the third thread, (c, d) by the fourth.
    let reads = [
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
        AtomicU64::new(0),
    ];

    thread::scope(|s| {
        for role in 0..4usize {
            let (map, start, finish, reads) = (&map, &start, &finish, &reads);
            s.spawn(move || {
                let ctx = qsbr::default().create_context();
                for trial in 0..TRIALS {
                    let x = trial * 2 + 1;
                    let y = trial * 2 + 2;
                    start.wait();
                    match role {
                        0 => {
                            map.assign(x, 2);
                        }
                        1 => {
                            map.assign(y, 2);
                        }
                        2 => {
                            reads[0].store(map.get(x), Ordering::Relaxed);
                            reads[1].store(map.get(y), Ordering::Relaxed);
                        }
                        _ => {
                            reads[2].store(map.get(y), Ordering::Relaxed);
                            reads[3].store(map.get(x), Ordering::Relaxed);
                        }
                    }
                    finish.wait();
                    if role == 0 {
                        // Both readers agreeing on opposite orders of the
                        // two independent writes would be non-linearizable.
                        let a = reads[0].load(Ordering::Relaxed);
                        let b = reads[1].load(Ordering::Relaxed);
                        let c = reads[2].load(Ordering::Relaxed);
                        let d = reads[3].load(Ordering::Relaxed);
                        assert!(
                            !(a == 2 && b == 0 && c == 2 && d == 0),
                            "{}: IRIW outcome on trial {trial}",
                            M::NAME
                        );
                    }
                }
                qsbr::default().destroy_context(ctx);
            });
        }
    });
}

#[test]
fn iriw_litmus() {
    for_each_map!(iriw);
}
