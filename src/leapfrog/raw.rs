//! The bucketed table and its migration engine, in terms of raw hash/value
//! words.
//!
//! Cells are grouped four at a time with eight delta bytes per group. Every
//! cell in a probe chain lives in the table itself; `deltas[0..4]` give the
//! first hop out of a home cell and `deltas[4..8]` the hops after that, so
//! a lookup touches at most one chain of same-bucket cells instead of an
//! unbounded linear run.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::coordinator::{Job, JobCoordinator};
use crate::qsbr;
use crate::traits::{NULL_HASH, NULL_VALUE, REDIRECT};

pub(crate) const INITIAL_SIZE: usize = 8;
const MIGRATION_UNIT_SIZE: usize = 32;
/// Probe-chain extension gives up after this many cells; must fit in a
/// delta byte.
const LINEAR_SEARCH_LIMIT: usize = 128;
const CELLS_IN_USE_SAMPLE: usize = LINEAR_SEARCH_LIMIT;

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

/// Table header; `size >> 2` cell groups trail it in the same allocation.
#[repr(C)]
pub(crate) struct Table {
    size_mask: usize,
    /// Serializes creation of the migration published to `coordinator`.
    mutex: Mutex<()>,
    pub(crate) coordinator: JobCoordinator,
}

impl Table {
    fn layout(size: usize) -> (Layout, usize) {
        Layout::new::<Table>()
            .extend(Layout::array::<CellGroup>(size >> 2).unwrap())
            .unwrap()
    }

    pub(crate) fn create(size: usize) -> *mut Table {
        assert!(size.is_power_of_two() && size >= 4);
        let (layout, offset) = Table::layout(size);
        unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            ptr.cast::<Table>().write(Table {
                size_mask: size - 1,
                mutex: Mutex::new(()),
                coordinator: JobCoordinator::new(),
            });
            // All-zero groups are empty cells with no links.
            ptr.add(offset)
                .write_bytes(0, (size >> 2) * std::mem::size_of::<CellGroup>());
            ptr.cast()
        }
    }

    pub(crate) unsafe fn destroy(table: *mut Table) {
        let (layout, _) = Table::layout(unsafe { (*table).size_mask } + 1);
        unsafe {
            ptr::drop_in_place(table);
            dealloc(table.cast(), layout);
        }
    }

    /// The group holding cell `idx`. `idx` may be unmasked; only its bucket
    /// bits are used.
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

pub(crate) enum InsertOutcome<'t> {
    /// Reserved a fresh cell for this hash. Its value is still null.
    Inserted(&'t Cell),
    /// The hash already had a cell (possibly a tombstone).
    Found(&'t Cell),
    /// The probe chain could not be extended within the search limit; the
    /// payload is the index one past the failed search, used to seed the
    /// occupancy sample.
    Overflow(usize),
}

pub(crate) fn find(hash: u64, table: &Table) -> Option<&Cell> {
    debug_assert!(hash != NULL_HASH);
    let size_mask = table.size_mask;

    // Optimistically check the hashed cell, though it may belong to
    // another bucket.
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

    // Follow our bucket's probe chain.
    let mut delta = group.deltas[idx & 3].load(Ordering::Relaxed);
    while delta != 0 {
        idx = (idx + delta as usize) & size_mask;
        group = table.group(idx);
        let cell = &group.cells[idx & 3];
        // The hash may not be visible yet for a cell a racing insert just
        // linked; we don't check for null, just keep following the chain.
        if cell.hash.load(Ordering::Relaxed) == hash {
            return Some(cell);
        }
        delta = group.deltas[(idx & 3) + 4].load(Ordering::Relaxed);
    }
    None
}

pub(crate) fn insert_or_find(hash: u64, table: &Table) -> InsertOutcome<'_> {
    debug_assert!(hash != NULL_HASH);
    let size_mask = table.size_mask;
    let mut idx = hash as usize;

    // Check the hashed cell first, though it may not even belong to the
    // bucket.
    let mut group = table.group(idx);
    let cell = &group.cells[idx & 3];
    let mut probe_hash = cell.hash.load(Ordering::Relaxed);
    if probe_hash == NULL_HASH {
        match cell
            .hash
            .compare_exchange(NULL_HASH, hash, Ordering::Relaxed, Ordering::Relaxed)
        {
            // Home cell: there are no links to set.
            Ok(_) => return InsertOutcome::Inserted(cell),
            // Raced; check whether the winner reserved our hash.
            Err(racing_hash) => probe_hash = racing_hash,
        }
    }
    if probe_hash == hash {
        return InsertOutcome::Found(cell);
    }

    // Follow the link chain for this bucket. Indices are unmasked and may
    // wrap; every access masks, and the wrapping difference against
    // `max_idx` still bounds the total probe at one table's worth.
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
                // The cell is linked but its hash store is not visible yet;
                // poll until it is rather than paying for acquire/release
                // on every link.
                loop {
                    probe_hash = cell.hash.load(Ordering::Acquire);
                    if probe_hash != NULL_HASH {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
            // Only hashes in the same bucket can be linked.
            debug_assert_eq!((probe_hash ^ hash) & size_mask as u64, 0);
            if probe_hash == hash {
                return InsertOutcome::Found(cell);
            }
            continue 'follow;
        }

        // End of the chain. Linear-probe until we reserve a new cell or
        // discover a late-arriving cell in the same bucket.
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
                        // Reserved. Link it to the previous cell in the
                        // bucket; a racing insert may have set the link on
                        // our behalf already, in which case it must match.
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
                // A late-arriving cell in our bucket. Set its link on its
                // behalf; without this our own chain may not be well formed
                // by the time we return. Then re-walk the chain.
                let desired_delta = idx.wrapping_sub(prev_link_idx) as u8;
                let old_delta = prev_link.swap(desired_delta, Ordering::Relaxed);
                debug_assert!(old_delta == 0 || old_delta == desired_delta);
                continue 'follow;
            }
            // Another bucket's cell; continue the linear search.
        }
        // Table is too full to insert.
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

/// Drains one or more source tables into a fresh destination; see the
/// linear variant for the worker protocol, which is identical.
#[repr(C)]
pub(crate) struct TableMigration {
    job: Job,
    root: *const AtomicPtr<Table>,
    destination: *mut Table,
    worker_status: AtomicUsize,
    overflowed: AtomicBool,
    units_remaining: AtomicIsize,
    sources: Vec<Source>,
}

impl TableMigration {
    fn create(
        root: *const AtomicPtr<Table>,
        sources: Vec<Source>,
        destination: *mut Table,
    ) -> *mut TableMigration {
        let units: usize = sources
            .iter()
            .map(|source| unsafe { &*source.table.load(Ordering::Relaxed) }.num_migration_units())
            .sum();
        Box::into_raw(Box::new(TableMigration {
            job: Job {
                run: TableMigration::run_thunk,
            },
            root,
            destination,
            worker_status: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
            units_remaining: AtomicIsize::new(units as isize),
            sources,
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

    fn migrate_range(&self, src_table: &Table, start_idx: usize) -> bool {
        let src_size_mask = src_table.size_mask;
        let destination = unsafe { &*self.destination };
        let end_idx = (start_idx + MIGRATION_UNIT_SIZE).min(src_size_mask + 1);
        for src_idx in start_idx..end_idx {
            let src_cell = src_table.cell(src_idx);
            loop {
                let src_hash = src_cell.hash.load(Ordering::Relaxed);
                if src_hash == NULL_HASH {
                    // Unused cell: park a redirect in its value so a late
                    // reservation diverts to the new table.
                    match src_cell.value.compare_exchange(
                        NULL_VALUE,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(REDIRECT) => break, // earlier incomplete migration
                        // Somebody just claimed the cell; reread the hash.
                        Err(_) => continue,
                    }
                }
                let mut src_value = src_cell.value.load(Ordering::Relaxed);
                if src_value == NULL_VALUE {
                    // Tombstone, or a reservation whose value is pending.
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

                // A live pair; reserve its destination cell.
                let dst_cell = match insert_or_find(src_hash, destination) {
                    InsertOutcome::Inserted(cell) => cell,
                    // A hash lives in exactly one source and is moved by
                    // exactly one thread.
                    InsertOutcome::Found(_) => unreachable!("hash already present in destination"),
                    InsertOutcome::Overflow(_) => return false,
                };

                // Move the value, then seal the source with a redirect,
                // re-carrying any value a racing write slips in.
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
        true
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
                    if !self.migrate_range(src_table, start_idx) {
                        // Destination overflow: the claimed unit will never
                        // complete, so no one can declare success. Flush the
                        // workers; the last one chains a larger migration.
                        self.overflowed.store(true, Ordering::Relaxed);
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

        let orig_table = unsafe { &*self.sources[0].table.load(Ordering::Relaxed) };
        if !self.overflowed.load(Ordering::Relaxed) {
            let root = unsafe { &*self.root };
            debug_assert_eq!(root.load(Ordering::Relaxed), orig_table as *const Table as *mut Table);
            root.store(self.destination, Ordering::Release);
            orig_table.coordinator.end();
        } else {
            let _guard = orig_table.mutex.lock();
            if orig_table.coordinator.load() == self.as_job() {
                let mut sources: Vec<Source> = self
                    .sources
                    .iter()
                    .map(|source| Source::new(source.table.swap(ptr::null_mut(), Ordering::Relaxed)))
                    .collect();
                sources.push(Source::new(self.destination));
                let next_size = (unsafe { &*self.destination }.size_mask + 1) * 2;
                let successor = TableMigration::create(self.root, sources, Table::create(next_size));
                orig_table
                    .coordinator
                    .store_release(unsafe { (*successor).as_job() });
            }
        }

        unsafe {
            qsbr::default().enqueue(
                TableMigration::destroy_thunk,
                self as *const TableMigration as *mut (),
            )
        };
    }
}

/// Kicks off a migration of `table` unless one is already published,
/// sizing the destination from a sample of the cells near the failed
/// search.
pub(crate) fn begin_table_migration(root: &AtomicPtr<Table>, table: &Table, overflow_idx: usize) {
    // Estimate the number of cells in use from the failed search chain.
    let size_mask = table.size_mask;
    let mut idx = overflow_idx.wrapping_sub(CELLS_IN_USE_SAMPLE);
    let mut in_use_cells = 0usize;
    for _ in 0..CELLS_IN_USE_SAMPLE {
        let value = table.cell(idx & size_mask).value.load(Ordering::Relaxed);
        if value == REDIRECT {
            // Another thread already kicked off a migration; the caller
            // participates on return.
            return;
        }
        if value != NULL_VALUE {
            in_use_cells += 1;
        }
        idx = idx.wrapping_add(1);
    }
    let in_use_ratio = in_use_cells as f32 / CELLS_IN_USE_SAMPLE as f32;
    let estimated_in_use = (size_mask + 1) as f32 * in_use_ratio;
    let mut next_size = INITIAL_SIZE.max(((estimated_in_use * 2.0) as usize).next_power_of_two());
    // Never shrink, even when most sampled cells were tombstones.
    next_size = next_size.max(size_mask + 1);
    begin_table_migration_to_size(root, table, next_size);
}

fn begin_table_migration_to_size(root: &AtomicPtr<Table>, table: &Table, next_size: usize) {
    if !table.coordinator.load().is_null() {
        return;
    }
    let _guard = table.mutex.lock();
    if !table.coordinator.load().is_null() {
        return;
    }
    let sources = vec![Source::new(table as *const Table as *mut Table)];
    let migration = TableMigration::create(root, sources, Table::create(next_size));
    table
        .coordinator
        .store_release(unsafe { (*migration).as_job() });
}

/// The raw map: an atomic root table pointer plus the redirect-follow
/// protocol around the table primitives.
pub(crate) struct Map {
    root: AtomicPtr<Table>,
}

impl Map {
    pub(crate) fn with_capacity(size: usize) -> Map {
        Map {
            root: AtomicPtr::new(Table::create(size)),
        }
    }

    pub(crate) fn get(&self, hash: u64) -> u64 {
        loop {
            let table = unsafe { &*self.root.load(Ordering::Acquire) };
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
            let table_ptr = self.root.load(Ordering::Acquire);
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
            let table_ptr = self.root.load(Ordering::Acquire);
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
                    begin_table_migration(&self.root, table, overflow_idx);
                }
            }
            // A migration is in progress; help until it completes, then
            // retry on the latest root.
            table.coordinator.participate();
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            table: self.root.load(Ordering::Acquire),
            idx: 0,
            _guard: qsbr::MutatorGuard::acquire(),
            _map: PhantomData,
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        unsafe { Table::destroy(*self.root.get_mut()) }
    }
}

/// The raw mutator: a located `(table, cell, last seen value)` triple.
pub(crate) struct Mutator<'m> {
    map: &'m Map,
    table: *mut Table,
    /// Null when `find` missed.
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

            // Redirected. Help the migration, then redo the insert against
            // whatever root it leaves behind.
            let hash = cell.hash.load(Ordering::Relaxed);
            loop {
                unsafe { &*self.table }.coordinator.participate();
                let table_ptr = self.map.root.load(Ordering::Acquire);
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
                        begin_table_migration(&self.map.root, table, overflow_idx);
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
                let table_ptr = self.map.root.load(Ordering::Acquire);
                self.table = table_ptr;
                let table = unsafe { &*table_ptr };
                let Some(cell) = find(hash, table) else {
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

/// Storage-order walk of the table snapshotted at construction.
///
/// Holds the snapshot like a mutator does: declaring a quiescent state
/// while one is live is asserted against.
pub(crate) struct Iter<'m> {
    table: *mut Table,
    idx: usize,
    _guard: qsbr::MutatorGuard,
    _map: PhantomData<&'m Map>,
}

impl Iter<'_> {
    pub(crate) fn next(&mut self) -> Option<(u64, u64)> {
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
        None
    }
}
