//! Leaf tables and the two-level migration machinery.
//!
//! A leaf is a leapfrog-probed table that covers a contiguous slice of the
//! hash space, described by `base_hash` and a range shift. While the whole
//! map fits in one table the root points at it directly (tagged word, low
//! bit clear); once a migration splits past the leaf size the root becomes
//! a flat tree (low bit set) and later migrations replace individual
//! leaves, growing the tree itself when a subtree no longer fits.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{
    AtomicIsize, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

use parking_lot::Mutex;

use crate::coordinator::{Job, JobCoordinator};
use crate::qsbr;
use crate::sync::ManualResetEvent;
use crate::traits::{NULL_HASH, NULL_VALUE, REDIRECT};

use super::flat_tree::{self, FlatTree, FlatTreeMigration, REDIRECT_FLAT_TREE};

pub(crate) const MIN_TABLE_SIZE: usize = 8;
const MIGRATION_UNIT_SIZE: usize = 32;
const LINEAR_SEARCH_LIMIT: usize = 128;
const CELLS_IN_USE_SAMPLE: usize = LINEAR_SEARCH_LIMIT;
const HASH_BITS: usize = 64;

pub(crate) const LEAF_SIZE_BITS: usize = 10;
/// Tables larger than this split into sibling leaves instead of growing.
pub(crate) const LEAF_SIZE: usize = 1 << LEAF_SIZE_BITS;

#[repr(C)]
pub(crate) struct Cell {
    pub(crate) hash: AtomicU64,
    pub(crate) value: AtomicU64,
}

#[repr(C)]
pub(crate) struct CellGroup {
    deltas: [AtomicU8; 8],
    cells: [Cell; 4],
}

/// Leaf-table header; `size >> 2` cell groups trail it.
#[repr(C)]
pub(super) struct Table {
    size_mask: usize,
    /// Lowest hash this table covers.
    pub(super) base_hash: u64,
    /// The table covers `1 << unsafe_range_shift` hashes. "Unsafe" because
    /// the value may be 64, which must not be used as a shift amount.
    pub(super) unsafe_range_shift: usize,
    /// Set once this table has been stored into the root or a flat tree.
    /// Prevents publishing a subtree before its parent is published.
    pub(super) is_published: ManualResetEvent,
    mutex: Mutex<()>,
    pub(super) coordinator: JobCoordinator,
}

impl Table {
    fn layout(size: usize) -> (Layout, usize) {
        Layout::new::<Table>()
            .extend(Layout::array::<CellGroup>(size >> 2).unwrap())
            .unwrap()
    }

    pub(super) fn create(size: usize, base_hash: u64, unsafe_range_shift: usize) -> *mut Table {
        assert!(size.is_power_of_two() && size >= 4);
        assert!(unsafe_range_shift > 0 && unsafe_range_shift <= HASH_BITS);
        let (layout, offset) = Table::layout(size);
        unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            ptr.cast::<Table>().write(Table {
                size_mask: size - 1,
                base_hash,
                unsafe_range_shift,
                is_published: ManualResetEvent::new(),
                mutex: Mutex::new(()),
                coordinator: JobCoordinator::new(),
            });
            ptr.add(offset)
                .write_bytes(0, (size >> 2) * std::mem::size_of::<CellGroup>());
            ptr.cast()
        }
    }

    pub(super) unsafe fn destroy(table: *mut Table) {
        let (layout, _) = Table::layout(unsafe { (*table).size_mask } + 1);
        unsafe {
            ptr::drop_in_place(table);
            dealloc(table.cast(), layout);
        }
    }

    fn group(&self, idx: usize) -> &CellGroup {
        let base = unsafe { (self as *const Table).add(1).cast::<CellGroup>() };
        unsafe { &*base.add((idx & self.size_mask) >> 2) }
    }

    fn cell(&self, idx: usize) -> &Cell {
        &self.group(idx).cells[idx & 3]
    }

    fn num_migration_units(&self) -> usize {
        self.size_mask / MIGRATION_UNIT_SIZE + 1
    }
}

pub(super) enum InsertOutcome<'t> {
    Inserted(&'t Cell),
    Found(&'t Cell),
    /// Index one past the failed linear search, seeding the occupancy
    /// sample.
    Overflow(usize),
}

pub(super) fn find(hash: u64, table: &Table) -> Option<&Cell> {
    debug_assert!(hash != NULL_HASH);
    let size_mask = table.size_mask;

    // The hashed cell first; it may belong to another bucket.
    let mut idx = (hash as usize) & size_mask;
    let mut group = table.group(idx);
    let cell = &group.cells[idx & 3];
    let probe_hash = cell.hash.load(Ordering::Relaxed);
    if probe_hash == hash {
        return Some(cell);
    }
    if probe_hash == NULL_HASH {
        return None;
    }

    let mut delta = group.deltas[idx & 3].load(Ordering::Relaxed);
    while delta != 0 {
        idx = (idx + delta as usize) & size_mask;
        group = table.group(idx);
        let cell = &group.cells[idx & 3];
        // A racing insert's hash store may not be visible yet; keep
        // following the chain regardless.
        if cell.hash.load(Ordering::Relaxed) == hash {
            return Some(cell);
        }
        delta = group.deltas[(idx & 3) + 4].load(Ordering::Relaxed);
    }
    None
}

pub(super) fn insert_or_find(hash: u64, table: &Table) -> InsertOutcome<'_> {
    debug_assert!(hash != NULL_HASH);
    let size_mask = table.size_mask;
    let mut idx = hash as usize;

    let mut group = table.group(idx);
    let cell = &group.cells[idx & 3];
    let mut probe_hash = cell.hash.load(Ordering::Relaxed);
    if probe_hash == NULL_HASH {
        match cell
            .hash
            .compare_exchange(NULL_HASH, hash, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return InsertOutcome::Inserted(cell),
            Err(racing_hash) => probe_hash = racing_hash,
        }
    }
    if probe_hash == hash {
        return InsertOutcome::Found(cell);
    }

    // Indices are unmasked and may wrap; every access masks, and the
    // wrapping difference against `max_idx` still bounds the probe.
    let max_idx = idx.wrapping_add(size_mask);
    let mut link_level = 0usize;
    'follow: loop {
        let prev_link = &group.deltas[(idx & 3) + link_level];
        link_level = 4;
        let probe_delta = prev_link.load(Ordering::Relaxed);
        if probe_delta != 0 {
            idx = idx.wrapping_add(probe_delta as usize);
            group = table.group(idx);
            let cell = &group.cells[idx & 3];
            let mut probe_hash = cell.hash.load(Ordering::Relaxed);
            if probe_hash == NULL_HASH {
                // Linked but not yet visible; poll.
                loop {
                    probe_hash = cell.hash.load(Ordering::Acquire);
                    if probe_hash != NULL_HASH {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
            debug_assert_eq!((probe_hash ^ hash) & size_mask as u64, 0);
            if probe_hash == hash {
                return InsertOutcome::Found(cell);
            }
            continue 'follow;
        }

        let prev_link_idx = idx;
        let mut probes_remaining = max_idx.wrapping_sub(idx).min(LINEAR_SEARCH_LIMIT);
        while probes_remaining > 0 {
            probes_remaining -= 1;
            idx = idx.wrapping_add(1);
            group = table.group(idx);
            let cell = &group.cells[idx & 3];
            let mut probe_hash = cell.hash.load(Ordering::Relaxed);
            if probe_hash == NULL_HASH {
                match cell
                    .hash
                    .compare_exchange(NULL_HASH, hash, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let desired_delta = idx.wrapping_sub(prev_link_idx) as u8;
                        let old_delta = prev_link.swap(desired_delta, Ordering::Relaxed);
                        debug_assert!(old_delta == 0 || old_delta == desired_delta);
                        return InsertOutcome::Inserted(cell);
                    }
                    Err(racing_hash) => probe_hash = racing_hash,
                }
            }
            let diff = probe_hash ^ hash;
            if diff == 0 {
                return InsertOutcome::Found(cell);
            }
            if diff & size_mask as u64 == 0 {
                // Late-arriving cell in our bucket: link it on its behalf,
                // then re-walk the chain.
                let desired_delta = idx.wrapping_sub(prev_link_idx) as u8;
                let old_delta = prev_link.swap(desired_delta, Ordering::Relaxed);
                debug_assert!(old_delta == 0 || old_delta == desired_delta);
                continue 'follow;
            }
        }
        return InsertOutcome::Overflow(idx.wrapping_add(1));
    }
}

struct Source {
    table: AtomicPtr<Table>,
    index: AtomicUsize,
}

impl Source {
    fn new(table: *mut Table) -> Source {
        Source {
            table: AtomicPtr::new(table),
            index: AtomicUsize::new(0),
        }
    }
}

/// Drains source leaves into a subtree of destination leaves.
///
/// `safe_shift` positions the subtree in the hash space: a source hash
/// selects its destination as `(hash >> safe_shift) & (dsts - 1)`. A value
/// of zero means the subtree is a single table covering everything.
#[repr(C)]
pub(super) struct TableMigration {
    job: Job,
    map: *const Map,
    base_hash: u64,
    safe_shift: usize,
    worker_status: AtomicUsize,
    /// Destination index that overflowed, or -1.
    overflow_table_index: AtomicIsize,
    units_remaining: AtomicIsize,
    sources: Vec<Source>,
    /// Destination leaves; entries may repeat when a leaf spans several
    /// subtree slots.
    destinations: Vec<*mut Table>,
}

impl TableMigration {
    fn create(
        map: *const Map,
        base_hash: u64,
        safe_shift: usize,
        sources: Vec<Source>,
        destinations: Vec<*mut Table>,
    ) -> *mut TableMigration {
        let units: usize = sources
            .iter()
            .map(|source| unsafe { &*source.table.load(Ordering::Relaxed) }.num_migration_units())
            .sum();
        Box::into_raw(Box::new(TableMigration {
            job: Job {
                run: TableMigration::run_thunk,
            },
            map,
            base_hash,
            safe_shift,
            worker_status: AtomicUsize::new(0),
            overflow_table_index: AtomicIsize::new(-1),
            units_remaining: AtomicIsize::new(units as isize),
            sources,
            destinations,
        }))
    }

    unsafe fn run_thunk(job: *mut Job) {
        unsafe { (*(job as *mut TableMigration)).run() }
    }

    unsafe fn destroy_thunk(arg: *mut ()) {
        let migration = unsafe { Box::from_raw(arg as *mut TableMigration) };
        for source in &migration.sources {
            let table = source.table.load(Ordering::Relaxed);
            if !table.is_null() {
                unsafe { Table::destroy(table) };
            }
        }
    }

    fn as_job(&self) -> *mut Job {
        self as *const TableMigration as *mut Job
    }

    fn unsafe_shift(&self) -> usize {
        if self.safe_shift != 0 {
            self.safe_shift
        } else {
            HASH_BITS
        }
    }

    /// Migrates one unit. Returns the index of the destination that
    /// overflowed, or -1 on success.
    fn migrate_range(&self, src_table: &Table, start_idx: usize) -> isize {
        let src_size_mask = src_table.size_mask;
        let safe_shift = self.safe_shift;
        let dst_leaf_mask = self.destinations.len() - 1;
        let end_idx = (start_idx + MIGRATION_UNIT_SIZE).min(src_size_mask + 1);
        for src_idx in start_idx..end_idx {
            let src_cell = src_table.cell(src_idx);
            loop {
                let src_hash = src_cell.hash.load(Ordering::Relaxed);
                if src_hash == NULL_HASH {
                    // Unused cell: park a redirect so a late reservation
                    // diverts to the new leaves.
                    match src_cell.value.compare_exchange(
                        NULL_VALUE,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(REDIRECT) => break, // earlier incomplete migration
                        Err(_) => continue,     // cell just claimed; reread
                    }
                }
                let mut src_value = src_cell.value.load(Ordering::Relaxed);
                if src_value == NULL_VALUE {
                    match src_cell.value.compare_exchange(
                        NULL_VALUE,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(REDIRECT) => break,
                        Err(racing) => src_value = racing,
                    }
                } else if src_value == REDIRECT {
                    break;
                }

                // A live pair; pick the destination leaf by hash slice.
                let dst_leaf_index = ((src_hash >> safe_shift) as usize) & dst_leaf_mask;
                let dst_leaf = unsafe { &*self.destinations[dst_leaf_index] };
                let dst_cell = match insert_or_find(src_hash, dst_leaf) {
                    InsertOutcome::Inserted(cell) => cell,
                    // A hash lives in exactly one source and is moved by
                    // exactly one thread.
                    InsertOutcome::Found(_) => unreachable!("hash already present in destination"),
                    InsertOutcome::Overflow(_) => return dst_leaf_index as isize,
                };

                loop {
                    dst_cell.value.store(src_value, Ordering::Relaxed);
                    match src_cell.value.compare_exchange(
                        src_value,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(newer) => {
                            debug_assert!(newer != REDIRECT);
                            src_value = newer;
                        }
                    }
                }
                break;
            }
        }
        -1
    }

    fn run(&self) {
        let mut status = self.worker_status.load(Ordering::Relaxed);
        loop {
            if status & 1 != 0 {
                return;
            }
            match self.worker_status.compare_exchange_weak(
                status,
                status + 2,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => status = current,
            }
        }

        'work: {
            for source in &self.sources {
                let src_table = unsafe { &*source.table.load(Ordering::Relaxed) };
                loop {
                    if self.worker_status.load(Ordering::Relaxed) & 1 != 0 {
                        break 'work;
                    }
                    let start_idx = source.index.fetch_add(MIGRATION_UNIT_SIZE, Ordering::Relaxed);
                    if start_idx >= src_table.size_mask + 1 {
                        break;
                    }
                    let overflow_index = self.migrate_range(src_table, start_idx);
                    if overflow_index >= 0 {
                        // A destination overflowed. The claimed unit never
                        // completes, so success cannot be declared; flush
                        // the workers and let the last one chain a bigger
                        // migration. Racing stores of the index are fine,
                        // either winner works.
                        self.overflow_table_index
                            .store(overflow_index, Ordering::Relaxed);
                        self.worker_status.fetch_or(1, Ordering::Relaxed);
                        break 'work;
                    }
                    let prev_remaining = self.units_remaining.fetch_sub(1, Ordering::Relaxed);
                    debug_assert!(prev_remaining > 0);
                    if prev_remaining == 1 {
                        self.worker_status.fetch_or(1, Ordering::Relaxed);
                        break 'work;
                    }
                }
            }
        }

        let status = self.worker_status.fetch_sub(2, Ordering::AcqRel);
        if status >= 4 {
            return;
        }
        debug_assert_eq!(status, 3);

        let overflow_table_index = self.overflow_table_index.load(Ordering::Relaxed);
        if overflow_table_index < 0 {
            let map = unsafe { &*self.map };
            map.publish_table_migration(self);
            unsafe { &*self.sources[0].table.load(Ordering::Relaxed) }
                .coordinator
                .end();
        } else {
            self.chain_after_overflow(overflow_table_index as usize);
        }

        unsafe {
            qsbr::default().enqueue(
                TableMigration::destroy_thunk,
                self as *const TableMigration as *mut (),
            )
        };
    }

    /// Builds and publishes the successor migration after a destination
    /// overflow: the old sources plus the doomed destination, into a wider
    /// set of leaves.
    fn chain_after_overflow(&self, overflow_table_index: usize) {
        let orig_table = unsafe { &*self.sources[0].table.load(Ordering::Relaxed) };
        // Number of subtree slots spanned by the original table's range.
        let count = 1usize << (orig_table.unsafe_range_shift - self.unsafe_shift());
        let lo = overflow_table_index & !(count - 1);
        debug_assert!(lo + count <= self.destinations.len());

        let _guard = orig_table.mutex.lock();
        if orig_table.coordinator.load() != self.as_job() {
            // A successor was already started; our sources were transferred.
            return;
        }

        let overflowed_table = self.destinations[overflow_table_index];
        let base_hash;
        let safe_shift;
        let mut destinations: Vec<*mut Table>;

        if unsafe { &*overflowed_table }.size_mask + 1 < LEAF_SIZE {
            // The whole map is still one small table; just double it.
            let overflowed = unsafe { &*overflowed_table };
            debug_assert_eq!(overflowed.unsafe_range_shift, HASH_BITS);
            debug_assert_eq!(overflowed.base_hash, 0);
            debug_assert_eq!(self.destinations.len(), 1);
            debug_assert_eq!(self.base_hash, 0);
            base_hash = 0;
            safe_shift = 0;
            destinations = vec![Table::create(
                (overflowed.size_mask + 1) * 2,
                overflowed.base_hash,
                overflowed.unsafe_range_shift,
            )];
        } else {
            // The overflowed table is already leaf-sized: split the original
            // range into two half-range leaves, doubling the subtree first
            // if it only had one slot per source range.
            let mut count = count;
            if count == 1 {
                base_hash = self.base_hash;
                safe_shift = self.unsafe_shift() - 1;
                destinations = Vec::with_capacity(self.destinations.len() * 2);
                for &destination in &self.destinations {
                    destinations.push(destination);
                    destinations.push(destination);
                }
                count = 2;
            } else {
                base_hash = self.base_hash;
                safe_shift = self.safe_shift;
                destinations = self.destinations.clone();
            }
            let half_range_shift = orig_table.unsafe_range_shift - 1;
            let split_low = Table::create(LEAF_SIZE, orig_table.base_hash, half_range_shift);
            let half_num_hashes = 1u64 << half_range_shift;
            let split_high = Table::create(
                LEAF_SIZE,
                orig_table.base_hash.wrapping_add(half_num_hashes),
                half_range_shift,
            );
            for i in 0..count / 2 {
                destinations[lo + i] = split_low;
            }
            for i in count / 2..count {
                destinations[lo + i] = split_high;
            }
        }

        // Transfer the sources forward and append the doomed destination.
        let mut sources: Vec<Source> = self
            .sources
            .iter()
            .map(|source| Source::new(source.table.swap(ptr::null_mut(), Ordering::Relaxed)))
            .collect();
        sources.push(Source::new(overflowed_table));

        let successor = TableMigration::create(self.map, base_hash, safe_shift, sources, destinations);
        orig_table
            .coordinator
            .store_release(unsafe { (*successor).as_job() });
    }
}

pub(super) fn begin_table_migration(map: &Map, table: &Table, overflow_idx: usize) {
    // Estimate live occupancy from the cells behind the failed search.
    let size_mask = table.size_mask;
    let mut idx = overflow_idx.wrapping_sub(CELLS_IN_USE_SAMPLE);
    let mut in_use_cells = 0usize;
    for _ in 0..CELLS_IN_USE_SAMPLE {
        let value = table.cell(idx & size_mask).value.load(Ordering::Relaxed);
        if value == REDIRECT {
            // Someone already kicked off a migration; participate on return.
            return;
        }
        if value != NULL_VALUE {
            in_use_cells += 1;
        }
        idx = idx.wrapping_add(1);
    }
    let in_use_ratio = in_use_cells as f32 / CELLS_IN_USE_SAMPLE as f32;
    let estimated_in_use = (size_mask + 1) as f32 * in_use_ratio;
    let mut next_table_size = ((estimated_in_use * 2.0) as usize).next_power_of_two();
    // Never shrink.
    next_table_size = next_table_size.max(size_mask + 1);
    // Past the leaf size the table splits into sibling leaves instead.
    let mut split_shift = 0usize;
    while next_table_size > LEAF_SIZE {
        split_shift += 1;
        next_table_size >>= 1;
    }
    begin_table_migration_to_size(map, table, next_table_size, split_shift);
}

fn begin_table_migration_to_size(map: &Map, table: &Table, next_table_size: usize, split_shift: usize) {
    if !table.coordinator.load().is_null() {
        return;
    }
    let _guard = table.mutex.lock();
    if !table.coordinator.load().is_null() {
        return;
    }

    let num_destinations = 1usize << split_shift;
    // The destinations' range; may still span the whole hash space.
    let sub_range_shift = table.unsafe_range_shift - split_shift;
    let safe_shift = if sub_range_shift < HASH_BITS { sub_range_shift } else { 0 };
    let hash_offset_delta = if sub_range_shift < HASH_BITS {
        1u64 << sub_range_shift
    } else {
        0
    };
    let destinations = (0..num_destinations)
        .map(|i| {
            Table::create(
                next_table_size,
                table.base_hash.wrapping_add(hash_offset_delta * i as u64),
                sub_range_shift,
            )
        })
        .collect();
    let sources = vec![Source::new(table as *const Table as *mut Table)];
    let migration = TableMigration::create(map, table.base_hash, safe_shift, sources, destinations);
    table
        .coordinator
        .store_release(unsafe { (*migration).as_job() });
}

/// The raw map. The root is a tagged word: zero when lazily unallocated, a
/// `Table` pointer when the whole map is one table, or a `FlatTree`
/// pointer with the low bit set.
pub(crate) struct Map {
    root: AtomicUsize,
}

impl Map {
    pub(crate) fn new_lazy() -> Map {
        Map {
            root: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_capacity(size: usize) -> Map {
        Map {
            root: AtomicUsize::new(Table::create(size, 0, HASH_BITS) as usize),
        }
    }

    /// The table currently covering `hash`, or None before first insert.
    /// Chases flat-tree redirects, helping the tree migration along.
    fn locate_table(&self, hash: u64) -> Option<*mut Table> {
        let root = self.root.load(Ordering::Acquire);
        if root & 1 != 0 {
            let mut flat_tree = (root & !1) as *mut FlatTree;
            loop {
                let tree = unsafe { &*flat_tree };
                let leaf_idx = (hash >> tree.safe_shift) as usize;
                let table = tree.table_slot(leaf_idx).load(Ordering::Acquire);
                if table as usize != REDIRECT_FLAT_TREE {
                    return Some(table);
                }
                // The slot moved to a larger tree; help and chase it.
                let migration = flat_tree::get_existing_migration(flat_tree);
                unsafe {
                    (*migration).run();
                    (*migration).completed.wait();
                    flat_tree = (*migration).destination;
                }
            }
        } else if root == 0 {
            None
        } else {
            Some(root as *mut Table)
        }
    }

    fn create_initial_table(&self, size: usize) {
        if self.root.load(Ordering::Relaxed) == 0 {
            // No mutex here; the loser of the race just frees its table.
            let table = Table::create(size, 0, HASH_BITS);
            if self
                .root
                .compare_exchange(0, table as usize, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                unsafe { Table::destroy(table) };
            }
        }
    }

    /// Called by exactly one thread, after all workers of `migration` have
    /// finished. Installs the destination leaves into the root or the flat
    /// tree, growing the tree when the subtree does not fit.
    pub(super) fn publish_table_migration(&self, migration: &TableMigration) {
        if migration.safe_shift == 0 {
            // The migration replaces the entire map with a single table.
            debug_assert_eq!(migration.base_hash, 0);
            debug_assert_eq!(migration.destinations.len(), 1);
            let old_root = self.root.load(Ordering::Relaxed);
            let new_table = migration.destinations[0];
            self.root.store(new_table as usize, Ordering::Release);
            unsafe { &*new_table }.is_published.signal();
            if old_root & 1 == 0 {
                // The old single root is this migration's first source and
                // is reclaimed with it.
                debug_assert_eq!(
                    old_root,
                    migration.sources[0].table.load(Ordering::Relaxed) as usize
                );
            } else {
                // The whole previous flat tree is superseded.
                unsafe { FlatTree::garbage_collect((old_root & !1) as *mut FlatTree) };
            }
            return;
        }

        // Multiple destinations: there will be a flat tree when we return.
        debug_assert!(migration.safe_shift < HASH_BITS);
        let old_root = self.root.load(Ordering::Acquire);
        if old_root & 1 == 0 {
            // No flat tree yet, so this migration covers the full hash
            // range and there are no racing writes to the root. Build the
            // first tree.
            debug_assert_eq!(migration.base_hash, 0);
            debug_assert_eq!(
                (u64::MAX >> migration.safe_shift) as usize,
                migration.destinations.len() - 1
            );
            debug_assert_eq!(
                old_root,
                migration.sources[0].table.load(Ordering::Relaxed) as usize
            );
            let flat_tree = FlatTree::create(migration.safe_shift);
            let tree = unsafe { &*flat_tree };
            let mut prev_table: *mut Table = ptr::null_mut();
            for (i, &new_table) in migration.destinations.iter().enumerate() {
                tree.table_slot(i).store(new_table, Ordering::Relaxed);
                if new_table != prev_table {
                    unsafe { &*new_table }.is_published.signal();
                    prev_table = new_table;
                }
            }
            self.root.store(flat_tree as usize | 1, Ordering::Release);
            return;
        }

        // Publish a subtree into the existing flat tree. The loop restarts
        // whenever a redirected slot tells us the tree itself moved.
        let mut flat_tree = (old_root & !1) as *mut FlatTree;
        let table_to_replace = migration.sources[0].table.load(Ordering::Relaxed);
        // Only replace fully published tables; otherwise a subtree races
        // its own children.
        unsafe { &*table_to_replace }.is_published.wait();
        let mut subtree_entries_published = 0usize;
        let mut prev_table: *mut Table = ptr::null_mut();
        'publish: loop {
            let tree = unsafe { &*flat_tree };
            if migration.safe_shift < tree.safe_shift {
                // The tree is too small for this subtree; grow it first,
                // then retry. Creation fails benignly if a migration of the
                // same source already exists; we help it instead.
                let tree_migration =
                    flat_tree::create_migration(self, flat_tree, migration.safe_shift);
                unsafe {
                    (*table_to_replace)
                        .coordinator
                        .run_one((*tree_migration).as_job());
                    (*tree_migration).completed.wait();
                    flat_tree = (*tree_migration).destination;
                }
                continue 'publish;
            }

            let repeat = 1usize << (migration.safe_shift - tree.safe_shift);
            let dst_start = (migration.base_hash >> tree.safe_shift) as usize;
            debug_assert!(
                dst_start + migration.destinations.len() * repeat - 1
                    <= (u64::MAX >> tree.safe_shift) as usize
            );
            // Resume with the first entry that is not yet fully published;
            // earlier entries were finished before a redirect interrupted
            // us, and no one else writes this range.
            let mut dst = dst_start + subtree_entries_published * repeat;
            while subtree_entries_published < migration.destinations.len() {
                let src_table = migration.destinations[subtree_entries_published];
                for _ in 0..repeat {
                    let slot = tree.table_slot(dst);
                    loop {
                        match slot.compare_exchange(
                            table_to_replace,
                            src_table,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break,
                            Err(found) if found as usize == REDIRECT_FLAT_TREE => {
                                // Redirected mid-publish: help the tree
                                // migration and restart against the new tree.
                                let tree_migration =
                                    flat_tree::get_existing_migration(flat_tree);
                                unsafe {
                                    (*table_to_replace)
                                        .coordinator
                                        .run_one((*tree_migration).as_job());
                                    (*tree_migration).completed.wait();
                                    flat_tree = (*tree_migration).destination;
                                }
                                continue 'publish;
                            }
                            Err(found) => {
                                // A previous attempt was redirected after
                                // partially publishing this entry.
                                debug_assert_eq!(found, src_table);
                                break;
                            }
                        }
                    }
                    dst += 1;
                }
                if prev_table != src_table {
                    unsafe { &*src_table }.is_published.signal();
                    prev_table = src_table;
                }
                subtree_entries_published += 1;
            }
            // Subtree fully published; the replaced leaves are sources of
            // this migration and are reclaimed with it.
            break 'publish;
        }
    }

    /// Called by the last worker of a flat-tree migration; no racing root
    /// writes at that point.
    pub(super) fn publish_flat_tree_migration(&self, migration: &FlatTreeMigration) {
        debug_assert_eq!(
            self.root.load(Ordering::Relaxed),
            migration.source as usize | 1
        );
        // Make the destination tree's slots visible along with the root.
        self.root
            .store(migration.destination as usize | 1, Ordering::Release);
    }

    pub(crate) fn get(&self, hash: u64) -> u64 {
        loop {
            let Some(table_ptr) = self.locate_table(hash) else {
                return NULL_VALUE;
            };
            let table = unsafe { &*table_ptr };
            let Some(cell) = find(hash, table) else {
                return NULL_VALUE;
            };
            let value = cell.value.load(Ordering::Acquire);
            if value != REDIRECT {
                return value;
            }
            table.coordinator.participate();
        }
    }

    pub(crate) fn find(&self, hash: u64) -> Mutator<'_> {
        let guard = qsbr::MutatorGuard::acquire();
        loop {
            let Some(table_ptr) = self.locate_table(hash) else {
                return Mutator {
                    map: self,
                    table: ptr::null_mut(),
                    cell: ptr::null(),
                    value: NULL_VALUE,
                    _guard: guard,
                };
            };
            let table = unsafe { &*table_ptr };
            let Some(cell) = find(hash, table) else {
                return Mutator {
                    map: self,
                    table: table_ptr,
                    cell: ptr::null(),
                    value: NULL_VALUE,
                    _guard: guard,
                };
            };
            let value = cell.value.load(Ordering::Acquire);
            if value != REDIRECT {
                return Mutator {
                    map: self,
                    table: table_ptr,
                    cell,
                    value,
                    _guard: guard,
                };
            }
            table.coordinator.participate();
        }
    }

    pub(crate) fn insert_or_find(&self, hash: u64) -> Mutator<'_> {
        let guard = qsbr::MutatorGuard::acquire();
        loop {
            let Some(table_ptr) = self.locate_table(hash) else {
                self.create_initial_table(MIN_TABLE_SIZE);
                continue;
            };
            let table = unsafe { &*table_ptr };
            match insert_or_find(hash, table) {
                InsertOutcome::Inserted(cell) => {
                    return Mutator {
                        map: self,
                        table: table_ptr,
                        cell,
                        value: NULL_VALUE,
                        _guard: guard,
                    };
                }
                InsertOutcome::Found(cell) => {
                    let value = cell.value.load(Ordering::Acquire);
                    if value != REDIRECT {
                        return Mutator {
                            map: self,
                            table: table_ptr,
                            cell,
                            value,
                            _guard: guard,
                        };
                    }
                }
                InsertOutcome::Overflow(overflow_idx) => {
                    begin_table_migration(self, table, overflow_idx);
                }
            }
            table.coordinator.participate();
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        let root = self.root.load(Ordering::Acquire);
        if root & 1 != 0 {
            let flat_tree = (root & !1) as *mut FlatTree;
            let tree = unsafe { &*flat_tree };
            // Skip over slots redirected by a concurrent tree migration.
            let mut flat_tree_idx = 0;
            let mut table = tree.table_slot(0).load(Ordering::Acquire);
            while table as usize == REDIRECT_FLAT_TREE {
                flat_tree_idx += 1;
                if flat_tree_idx == tree.num_leaves() {
                    table = ptr::null_mut();
                    break;
                }
                table = tree.table_slot(flat_tree_idx).load(Ordering::Acquire);
            }
            Iter {
                flat_tree,
                flat_tree_idx,
                table,
                idx: 0,
                _guard: qsbr::MutatorGuard::acquire(),
                _map: PhantomData,
            }
        } else {
            Iter {
                flat_tree: ptr::null_mut(),
                flat_tree_idx: 0,
                table: root as *mut Table,
                idx: 0,
                _guard: qsbr::MutatorGuard::acquire(),
                _map: PhantomData,
            }
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        let root = *self.root.get_mut();
        if root & 1 != 0 {
            let flat_tree = (root & !1) as *mut FlatTree;
            let tree = unsafe { &*flat_tree };
            let mut last_destroyed: *mut Table = ptr::null_mut();
            for i in 0..tree.num_leaves() {
                let table = tree.table_slot(i).load(Ordering::Relaxed);
                debug_assert!(table as usize != REDIRECT_FLAT_TREE);
                if table != last_destroyed {
                    unsafe { Table::destroy(table) };
                    last_destroyed = table;
                }
            }
            unsafe { FlatTree::destroy(flat_tree) };
        } else if root != 0 {
            unsafe { Table::destroy(root as *mut Table) };
        }
    }
}

/// The raw mutator: a located `(table, cell, last seen value)` triple.
pub(crate) struct Mutator<'m> {
    map: &'m Map,
    table: *mut Table,
    cell: *const Cell,
    value: u64,
    _guard: qsbr::MutatorGuard,
}

impl Mutator<'_> {
    pub(crate) fn value(&self) -> u64 {
        self.value
    }

    pub(crate) fn exchange(&mut self, desired: u64) -> u64 {
        debug_assert!(desired != NULL_VALUE && desired != REDIRECT);
        assert!(!self.cell.is_null(), "exchange on a missed find");
        loop {
            let cell = unsafe { &*self.cell };
            match cell
                .value
                .compare_exchange(self.value, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let previous = self.value;
                    self.value = desired;
                    return previous;
                }
                Err(current) => {
                    self.value = current;
                    if current != REDIRECT {
                        // Racing write wins; ours logically landed first.
                        return desired;
                    }
                }
            }

            // Redirected; redo the insert wherever the hash lives now.
            let hash = cell.hash.load(Ordering::Relaxed);
            loop {
                unsafe { &*self.table }.coordinator.participate();
                let table_ptr = self
                    .map
                    .locate_table(hash)
                    .expect("map root cleared while following a redirect");
                self.table = table_ptr;
                let table = unsafe { &*table_ptr };
                self.value = NULL_VALUE;
                match insert_or_find(hash, table) {
                    InsertOutcome::Inserted(cell) => {
                        self.cell = cell;
                        break;
                    }
                    InsertOutcome::Found(cell) => {
                        self.cell = cell;
                        self.value = cell.value.load(Ordering::Acquire);
                        if self.value != REDIRECT {
                            break;
                        }
                    }
                    InsertOutcome::Overflow(overflow_idx) => {
                        begin_table_migration(self.map, table, overflow_idx);
                    }
                }
            }
        }
    }

    pub(crate) fn erase(&mut self) -> u64 {
        loop {
            if self.value == NULL_VALUE {
                return NULL_VALUE;
            }
            // A non-null last-seen value implies a located cell.
            let cell = unsafe { &*self.cell };
            match cell.value.compare_exchange(
                self.value,
                NULL_VALUE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let previous = self.value;
                    self.value = NULL_VALUE;
                    return previous;
                }
                Err(current) => {
                    self.value = current;
                    if current != REDIRECT {
                        // Racing write wins; treat the erase as overwritten.
                        return NULL_VALUE;
                    }
                }
            }

            let hash = cell.hash.load(Ordering::Relaxed);
            loop {
                unsafe { &*self.table }.coordinator.participate();
                let Some(table_ptr) = self.map.locate_table(hash) else {
                    self.cell = ptr::null();
                    self.value = NULL_VALUE;
                    return NULL_VALUE;
                };
                self.table = table_ptr;
                let Some(cell) = find(hash, unsafe { &*table_ptr }) else {
                    self.cell = ptr::null();
                    self.value = NULL_VALUE;
                    return NULL_VALUE;
                };
                self.cell = cell;
                self.value = cell.value.load(Ordering::Relaxed);
                if self.value != REDIRECT {
                    break;
                }
            }
        }
    }
}

/// Walks every unique leaf of the snapshotted root in slot order.
///
/// Holds the snapshot like a mutator does: declaring a quiescent state
/// while one is live is asserted against.
pub(crate) struct Iter<'m> {
    flat_tree: *mut FlatTree,
    flat_tree_idx: usize,
    /// Null when the map was never allocated.
    table: *mut Table,
    idx: usize,
    _guard: qsbr::MutatorGuard,
    _map: PhantomData<&'m Map>,
}

impl Iter<'_> {
    pub(crate) fn next(&mut self) -> Option<(u64, u64)> {
        'tables: loop {
            if self.table.is_null() {
                return None;
            }
            let table = unsafe { &*self.table };
            while self.idx <= table.size_mask {
                let cell = table.cell(self.idx);
                self.idx += 1;
                let hash = cell.hash.load(Ordering::Relaxed);
                if hash != NULL_HASH {
                    let value = cell.value.load(Ordering::Relaxed);
                    if value != NULL_VALUE && value != REDIRECT {
                        return Some((hash, value));
                    }
                }
            }
            // Past the end of this leaf; scan for the next unique one.
            if !self.flat_tree.is_null() {
                let tree = unsafe { &*self.flat_tree };
                self.flat_tree_idx += 1;
                while self.flat_tree_idx < tree.num_leaves() {
                    let next_table = tree.table_slot(self.flat_tree_idx).load(Ordering::Acquire);
                    // A slot redirected by a concurrent tree migration is
                    // skipped; the iterator is only weakly consistent.
                    if next_table != self.table && next_table as usize != REDIRECT_FLAT_TREE {
                        self.table = next_table;
                        self.idx = 0;
                        continue 'tables;
                    }
                    self.flat_tree_idx += 1;
                }
            }
            return None;
        }
    }
}
