mod common;

use common::{for_each_map, with_context, MapUnderTest};
use quince::qsbr;

fn forced_resize<M: MapUnderTest>() {
    with_context(|| {
        // Capacity 4 forces several migrations on the way to 100 entries.
        let map = M::with_capacity(4);
        for k in 1..=100u64 {
            map.assign(k, k << 2);
        }
        for k in 1..=100u64 {
            assert_eq!(map.get(k), k << 2, "{}: key {k}", M::NAME);
        }
        assert_eq!(map.pairs().len(), 100, "{}", M::NAME);
    });
}

#[test]
fn resize_from_minimum_capacity() {
    for_each_map!(forced_resize);
}

fn growth_preserves_entries<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(8);
        for k in 1..=10_000u64 {
            map.assign(k, k.wrapping_mul(31) | 2);
        }
        for k in 1..=10_000u64 {
            assert_eq!(map.get(k), k.wrapping_mul(31) | 2, "{}: key {k}", M::NAME);
        }
    });
}

#[test]
fn growth_through_many_migrations() {
    for_each_map!(growth_preserves_entries);
}

fn tombstones_reclaimed_by_migration<M: MapUnderTest>() {
    let ctx = qsbr::default().create_context();
    let map = M::with_capacity(8);

    // Fill, erase everything, and refill repeatedly. The erased cells
    // remain tombstones until a migration copies only the live pairs, so
    // this keeps working only if migrations reclaim them.
    for round in 0..20u64 {
        for k in 1..=500u64 {
            map.assign(k, (k << 8) | round | 2);
        }
        for k in 1..=500u64 {
            assert_eq!(map.get(k), (k << 8) | round | 2, "{}", M::NAME);
        }
        for k in 1..=500u64 {
            map.erase(k);
        }
        for k in 1..=500u64 {
            assert_eq!(map.get(k), 0, "{}", M::NAME);
        }
        // Quiescent between rounds; no mutators are held here.
        qsbr::default().update(ctx);
    }

    qsbr::default().destroy_context(ctx);
}

#[test]
fn tombstone_reclamation() {
    for_each_map!(tombstones_reclaimed_by_migration);
}

fn interleaved_insert_erase<M: MapUnderTest>() {
    with_context(|| {
        let map = M::with_capacity(4);
        for k in 1..=2_000u64 {
            map.assign(k, k + 100);
            if k % 3 == 0 {
                map.erase(k / 3);
            }
        }
        for k in 1..=2_000u64 {
            let expected = if k <= 666 { 0 } else { k + 100 };
            assert_eq!(map.get(k), expected, "{}: key {k}", M::NAME);
        }
    });
}

#[test]
fn interleaving() {
    for_each_map!(interleaved_insert_erase);
}
