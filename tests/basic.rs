mod common;

use common::{for_each_map, with_context, MapUnderTest};
use quince::{GrampaMap, LeapfrogMap};

fn sequential_basics<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(4);
        assert_eq!(map.assign(5, 0x50), 0, "{}", M::NAME);
        assert_eq!(map.assign(9, 0x90), 0, "{}", M::NAME);
        assert_eq!(map.assign(13, 0xD0), 0, "{}", M::NAME);

        assert_eq!(map.get(5), 0x50, "{}", M::NAME);
        assert_eq!(map.get(9), 0x90, "{}", M::NAME);
        assert_eq!(map.get(13), 0xD0, "{}", M::NAME);
        assert_eq!(map.get(17), 0, "{}", M::NAME);

        assert_eq!(map.erase(9), 0x90, "{}", M::NAME);
        assert_eq!(map.get(9), 0, "{}", M::NAME);

        let mut pairs = map.pairs();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(5, 0x50), (13, 0xD0)], "{}", M::NAME);
    });
}

#[test]
fn basics() {
    for_each_map!(sequential_basics);
}

fn overwrite_returns_previous<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(8);
        assert_eq!(map.assign(7, 70), 0, "{}", M::NAME);
        assert_eq!(map.assign(7, 71), 70, "{}", M::NAME);
        assert_eq!(map.assign(7, 72), 71, "{}", M::NAME);
        assert_eq!(map.get(7), 72, "{}", M::NAME);
    });
}

#[test]
fn overwrite() {
    for_each_map!(overwrite_returns_previous);
}

fn erase_round_trips<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(8);
        map.assign(3, 33);
        assert_eq!(map.erase(3), 33, "{}", M::NAME);
        assert_eq!(map.get(3), 0, "{}", M::NAME);
        // Idempotent.
        assert_eq!(map.erase(3), 0, "{}", M::NAME);
        // Erasing a never-inserted key is a no-op.
        assert_eq!(map.erase(44), 0, "{}", M::NAME);

        // The tombstone does not break reinsertion.
        assert_eq!(map.assign(3, 34), 0, "{}", M::NAME);
        assert_eq!(map.get(3), 34, "{}", M::NAME);
    });
}

#[test]
fn erase() {
    for_each_map!(erase_round_trips);
}

fn reserved_inputs_panic<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(8);
        for result in [
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| map.assign(0, 5))),
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| map.assign(5, 0))),
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| map.assign(5, 1))),
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| map.get(0))),
        ] {
            assert!(result.is_err(), "{}: misuse must assert", M::NAME);
        }
    });
}

#[test]
fn reserved_inputs() {
    for_each_map!(reserved_inputs_panic);
}

#[test]
fn mutator_inspect_then_update() {
    with_context(|| {
        let map: LeapfrogMap<u64, u64> = LeapfrogMap::with_capacity(8);

        let mut mutator = map.insert_or_find(21);
        assert_eq!(mutator.value(), 0);
        assert_eq!(mutator.exchange_value(210), 0);
        assert_eq!(mutator.value(), 210);
        drop(mutator);
        assert_eq!(map.get(21), 210);

        let mut mutator = map.find(21);
        assert_eq!(mutator.value(), 210);
        assert_eq!(mutator.erase_value(), 210);
        drop(mutator);
        assert_eq!(map.get(21), 0);

        // A find on a missing key yields a null-valued mutator whose erase
        // is a no-op.
        let mut missing = map.find(99);
        assert_eq!(missing.value(), 0);
        assert_eq!(missing.erase_value(), 0);
    });
}

#[test]
fn grampa_lazy_construction() {
    with_context(|| {
        let map: GrampaMap<u64, u64> = GrampaMap::new();
        // No table exists yet; reads and erases see an empty map.
        assert_eq!(map.get(12), 0);
        assert_eq!(map.erase(12), 0);
        assert_eq!(map.iter().count(), 0);

        // The first insert allocates.
        assert_eq!(map.assign(12, 120), 0);
        assert_eq!(map.get(12), 120);
        assert_eq!(map.iter().count(), 1);
    });
}

fn iterator_skips_erased<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(16);
        for k in 1..=10u64 {
            map.assign(k, k * 10);
        }
        for k in (2..=10u64).step_by(2) {
            map.erase(k);
        }
        let mut pairs = map.pairs();
        pairs.sort_unstable();
        let expected: Vec<(u64, u64)> = (1..=10u64).step_by(2).map(|k| (k, k * 10)).collect();
        assert_eq!(pairs, expected, "{}", M::NAME);
    });
}

#[test]
fn iterator_contents() {
    for_each_map!(iterator_skips_erased);
}
