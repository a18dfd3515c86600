mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{for_each_map, MapUnderTest};
use quince::{qsbr, qsbr::Qsbr, LeapfrogMap};

unsafe fn bump(arg: *mut ()) {
    let counter = unsafe { &*(arg as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::Relaxed);
}

// An action enqueued in one quiescence interval runs only after every
// context has been seen quiescent again, and exactly once.
#[test]
fn deferred_action_runs_exactly_once() {
    let registry = Qsbr::new();
    let ran = AtomicUsize::new(0);

    let a = registry.create_context();
    let b = registry.create_context();
    unsafe { registry.enqueue(bump, &ran as *const _ as *mut ()) };

    registry.update(a);
    registry.update(b);
    assert_eq!(ran.load(Ordering::Relaxed), 0, "ran before the second interval");

    registry.update(a);
    registry.update(b);
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    registry.update(a);
    registry.update(b);
    registry.update(a);
    registry.update(b);
    assert_eq!(ran.load(Ordering::Relaxed), 1, "ran more than once");

    registry.destroy_context(a);
    registry.destroy_context(b);
}

// A context that never updates holds every deferred action back.
#[test]
fn unquiesced_context_blocks_reclamation() {
    let registry = Qsbr::new();
    let ran = AtomicUsize::new(0);

    let active = registry.create_context();
    let idle = registry.create_context();
    unsafe { registry.enqueue(bump, &ran as *const _ as *mut ()) };

    for _ in 0..10 {
        registry.update(idle);
    }
    assert_eq!(ran.load(Ordering::Relaxed), 0);

    // Destroying the hold-out releases the interval; one more full
    // interval runs the action.
    registry.destroy_context(active);
    registry.update(idle);
    assert_eq!(ran.load(Ordering::Relaxed), 1);

    registry.destroy_context(idle);
}

#[test]
fn flush_runs_everything_outstanding() {
    let registry = Qsbr::new();
    let ran = AtomicUsize::new(0);

    let ctx = registry.create_context();
    unsafe { registry.enqueue(bump, &ran as *const _ as *mut ()) };
    registry.update(ctx);
    unsafe { registry.enqueue(bump, &ran as *const _ as *mut ()) };

    registry.destroy_context(ctx);
    registry.flush();
    assert_eq!(ran.load(Ordering::Relaxed), 2);
}

// Declaring a quiescent state while holding a Mutator would let the cell
// be freed mid-use; the registry traps it instead.
#[test]
#[should_panic(expected = "Mutator is live")]
fn update_with_live_mutator_asserts() {
    let registry = Qsbr::new();
    let ctx = registry.create_context();

    let map: LeapfrogMap<u64, u64> = LeapfrogMap::with_capacity(8);
    let _mutator = map.insert_or_find(5);
    registry.update(ctx);
}

// Drive all three variants through enough migrations to retire a pile of
// tables, declaring quiescent states along the way. Under a sanitizer this
// is the use-after-free probe for the whole retire path.
fn migrations_with_active_reclamation<M: MapUnderTest>() {
    let ctx = qsbr::default().create_context();
    let map = M::with_capacity(4);

    for round in 0..8u64 {
        for k in 1..=1_500u64 {
            map.assign(k, (k << 4) | round | 2);
        }
        qsbr::default().update(ctx);
        for k in 1..=1_500u64 {
            assert_eq!(map.get(k), (k << 4) | round | 2, "{}", M::NAME);
        }
        qsbr::default().update(ctx);
    }

    qsbr::default().destroy_context(ctx);
}

#[test]
fn reclamation_under_migration_load() {
    for_each_map!(migrations_with_active_reclamation);
}
