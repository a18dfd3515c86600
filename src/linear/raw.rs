//! The linear-probed table and its migration engine, in terms of raw
//! hash/value words. The typed shell in the parent module layers key and
//! value conversion on top.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::coordinator::{Job, JobCoordinator};
use crate::qsbr;
use crate::traits::{NULL_HASH, NULL_VALUE, REDIRECT};

pub(crate) const INITIAL_SIZE: usize = 8;
const MIGRATION_UNIT_SIZE: usize = 32;
const CELLS_IN_USE_SAMPLE: usize = 256;

#[repr(C)]
pub(crate) struct Cell {
    pub(crate) hash: AtomicU64,
    pub(crate) value: AtomicU64,
}

/// Table header; `size_mask + 1` cells trail it in the same allocation.
#[repr(C)]
pub(crate) struct Table {
    size_mask: usize,
    /// Insertions take a unit from here before reserving a cell; the table
    /// refuses new cells past 75% occupancy.
    cells_remaining: AtomicIsize,
    /// Serializes creation of the migration published to `coordinator`.
    mutex: Mutex<()>,
    pub(crate) coordinator: JobCoordinator,
}

impl Table {
    fn layout(size: usize) -> (Layout, usize) {
        Layout::new::<Table>()
            .extend(Layout::array::<Cell>(size).unwrap())
            .unwrap()
    }

    pub(crate) fn create(size: usize) -> *mut Table {
        assert!(size.is_power_of_two());
        let (layout, offset) = Table::layout(size);
        unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            ptr.cast::<Table>().write(Table {
                size_mask: size - 1,
                cells_remaining: AtomicIsize::new((size - 1) as isize * 3 / 4),
                mutex: Mutex::new(()),
                coordinator: JobCoordinator::new(),
            });
            // All-zero cells are (null hash, null value): empty.
            ptr.add(offset).write_bytes(0, size * std::mem::size_of::<Cell>());
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

    /// The cell at `idx`, which must already be masked into range.
    unsafe fn cell(&self, idx: usize) -> &Cell {
        debug_assert!(idx <= self.size_mask);
        // The cell array begins right past the header; `Table`'s size is a
        // multiple of the cell alignment.
        unsafe { &*(self as *const Table).add(1).cast::<Cell>().add(idx) }
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
    /// The table is at its load cap; a migration is needed.
    Overflow,
}

pub(crate) fn find(hash: u64, table: &Table) -> Option<&Cell> {
    debug_assert!(hash != NULL_HASH);
    let size_mask = table.size_mask;
    let mut idx = hash as usize;
    loop {
        idx &= size_mask;
        let cell = unsafe { table.cell(idx) };
        let probe_hash = cell.hash.load(Ordering::Relaxed);
        if probe_hash == hash {
            return Some(cell);
        }
        if probe_hash == NULL_HASH {
            return None;
        }
        idx += 1;
    }
}

pub(crate) fn insert_or_find(hash: u64, table: &Table) -> InsertOutcome<'_> {
    debug_assert!(hash != NULL_HASH);
    let size_mask = table.size_mask;
    let mut idx = hash as usize;
    loop {
        idx &= size_mask;
        let cell = unsafe { table.cell(idx) };
        let probe_hash = cell.hash.load(Ordering::Relaxed);
        if probe_hash == hash {
            return InsertOutcome::Found(cell);
        }
        if probe_hash == NULL_HASH {
            // Take a unit of occupancy before trying to reserve the cell.
            let prev_remaining = table.cells_remaining.fetch_sub(1, Ordering::Relaxed);
            if prev_remaining <= 0 {
                table.cells_remaining.fetch_add(1, Ordering::Relaxed);
                return InsertOutcome::Overflow;
            }
            match cell
                .hash
                .compare_exchange(NULL_HASH, hash, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return InsertOutcome::Inserted(cell),
                Err(racing_hash) => {
                    // Another thread reserved the cell from under us.
                    table.cells_remaining.fetch_add(1, Ordering::Relaxed);
                    if racing_hash == hash {
                        return InsertOutcome::Found(cell);
                    }
                }
            }
        }
        // Occupied by another hash; try the next cell.
        idx += 1;
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

/// A migration drains one or more source tables into a fresh destination.
/// Any thread that trips over the stalled table participates; the last
/// worker out publishes (or, on destination overflow, chains a larger
/// successor migration).
#[repr(C)]
pub(crate) struct TableMigration {
    job: Job,
    root: *const AtomicPtr<Table>,
    destination: *mut Table,
    /// Worker count in the high bits, end flag in bit 0.
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

    /// Retirement record target: frees the sources this migration still
    /// owns, then the migration itself.
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

    /// Migrates one unit of `MIGRATION_UNIT_SIZE` source cells. Returns
    /// false if the destination overflowed.
    fn migrate_range(&self, src_table: &Table, start_idx: usize) -> bool {
        let src_size_mask = src_table.size_mask;
        let destination = unsafe { &*self.destination };
        let end_idx = (start_idx + MIGRATION_UNIT_SIZE).min(src_size_mask + 1);
        for src_idx in start_idx..end_idx {
            let src_cell = unsafe { src_table.cell(src_idx & src_size_mask) };
            loop {
                let src_hash = src_cell.hash.load(Ordering::Relaxed);
                if src_hash == NULL_HASH {
                    // Unused cell: try to park a redirect in its value.
                    match src_cell.value.compare_exchange(
                        NULL_VALUE,
                        REDIRECT,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(REDIRECT) => break, // left over from an earlier failed pass
                        // Somebody just claimed the cell; reread the hash.
                        Err(_) => continue,
                    }
                }
                let mut src_value = src_cell.value.load(Ordering::Relaxed);
                if src_value == NULL_VALUE {
                    // Tombstone (or reserved, value still pending).
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
                    // Already moved by an earlier incomplete migration.
                    break;
                }

                // A live pair. Reserve its destination cell.
                let dst_cell = match insert_or_find(src_hash, destination) {
                    InsertOutcome::Inserted(cell) => cell,
                    // Each hash lives in exactly one source and is moved by
                    // exactly one thread, so it cannot already be present.
                    InsertOutcome::Found(_) => unreachable!("hash already present in destination"),
                    InsertOutcome::Overflow => return false,
                };

                // Move the value, then seal the source with a redirect.
                // A racing write beats the seal, so adopt it and retry.
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
                            // A late write or erase landed; carry it over.
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
        // Join as a worker unless the end flag is already up.
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
                        // This source is fully claimed; move to the next.
                        break;
                    }
                    if !self.migrate_range(src_table, start_idx) {
                        // Destination overflow. The unit we claimed will never
                        // complete, so `units_remaining` cannot reach zero and
                        // no one can declare success; flush the workers and
                        // let the last one chain a bigger migration.
                        self.overflowed.store(true, Ordering::Relaxed);
                        self.worker_status.fetch_or(1, Ordering::Relaxed);
                        break 'work;
                    }
                    let prev_remaining = self.units_remaining.fetch_sub(1, Ordering::Relaxed);
                    debug_assert!(prev_remaining > 0);
                    if prev_remaining == 1 {
                        // That was the last unit; the migration succeeded.
                        self.worker_status.fetch_or(1, Ordering::Relaxed);
                        break 'work;
                    }
                }
            }
        }

        // Leave; AcqRel makes this worker's writes visible to the last one.
        let status = self.worker_status.fetch_sub(2, Ordering::AcqRel);
        if status >= 4 {
            return;
        }
        debug_assert_eq!(status, 3);

        // Last worker out: publish on success, chain on failure.
        let orig_table = unsafe { &*self.sources[0].table.load(Ordering::Relaxed) };
        if !self.overflowed.load(Ordering::Relaxed) {
            let root = unsafe { &*self.root };
            debug_assert_eq!(root.load(Ordering::Relaxed), orig_table as *const Table as *mut Table);
            root.store(self.destination, Ordering::Release);
            orig_table.coordinator.end();
        } else {
            let _guard = orig_table.mutex.lock();
            if orig_table.coordinator.load() == self.as_job() {
                // Build the successor: same sources plus the doomed
                // destination, into a table twice its size.
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
            // Otherwise a successor was already published; our sources have
            // been transferred to it.
        }

        unsafe {
            qsbr::default().enqueue(
                TableMigration::destroy_thunk,
                self as *const TableMigration as *mut (),
            )
        };
    }
}

/// Kicks off a migration of `table` unless one is already published.
///
/// `must_double` skips occupancy estimation and doubles outright; the shell
/// sets it after a post-redirect overflow so repeated underestimates cannot
/// livelock.
pub(crate) fn begin_table_migration(
    root: &AtomicPtr<Table>,
    table: &Table,
    must_double: bool,
) {
    let next_size = if must_double {
        (table.size_mask + 1) * 2
    } else {
        // Estimate live occupancy from a small sample.
        let sample = (table.size_mask + 1).min(CELLS_IN_USE_SAMPLE);
        let mut in_use_cells = 0usize;
        for idx in 0..sample {
            let value = unsafe { table.cell(idx) }.value.load(Ordering::Relaxed);
            if value == REDIRECT {
                // Another thread already kicked off a migration; the caller
                // will participate on return.
                return;
            }
            if value != NULL_VALUE {
                in_use_cells += 1;
            }
        }
        let in_use_ratio = in_use_cells as f32 / sample as f32;
        let estimated_in_use = (table.size_mask + 1) as f32 * in_use_ratio;
        INITIAL_SIZE.max(((estimated_in_use * 2.0) as usize).next_power_of_two())
    };
    begin_table_migration_to_size(root, table, next_size);
}

/// The raw map: an atomic root table pointer and the redirect-follow
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
            // The cell moved; help finish the migration, then retry against
            // the new root.
            table.coordinator.participate();
        }
    }

    /// Locates the cell for `hash` without inserting.
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

    /// Locates the cell for `hash`, inserting a reservation if absent.
    pub(crate) fn insert_or_find(&self, hash: u64) -> Mutator<'_> {
        let guard = qsbr::MutatorGuard::acquire();
        let mut must_double = false;
        loop {
            let table_ptr = self.root.load(Ordering::Acquire);
            let table = unsafe { &*table_ptr };
            match insert_or_find(hash, table) {
                InsertOutcome::Inserted(cell) => {
                    // Fresh reservation; its value is null by construction.
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
                    // Redirected: participate below, then retry.
                }
                InsertOutcome::Overflow => {
                    begin_table_migration(&self.root, table, must_double);
                }
            }
            // A migration is in progress (started by us or someone else);
            // help until it completes, then retry on the latest root. If we
            // overflow again after that, force the next table to double so
            // repeated underestimates cannot loop forever.
            table.coordinator.participate();
            must_double = true;
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

    /// CASes `desired` into the cell. A losing race against a non-redirect
    /// write returns `desired` (our write logically landed first and was
    /// overwritten); a losing race against a redirect follows the migration
    /// and retries in the new table.
    pub(crate) fn exchange(&mut self, desired: u64) -> u64 {
        debug_assert!(desired != NULL_VALUE && desired != REDIRECT);
        assert!(!self.cell.is_null(), "exchange on a missed find");
        let mut must_double = false;
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
                        // A racing write (or erase) beat us; let it win as
                        // if it overwrote our value.
                        return desired;
                    }
                }
            }

            // Redirected. Help the migration along, then re-run the insert
            // against whatever root it leaves behind.
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
                        // Redirected again; keep helping.
                    }
                    InsertOutcome::Overflow => {
                        begin_table_migration(&self.map.root, table, must_double);
                    }
                }
                must_double = true;
            }
        }
    }

    /// CASes the cell's value back to null. Race semantics mirror
    /// [`exchange`](Self::exchange).
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
                        // A racing write landed; treat our erase as a no-op
                        // that it overwrote.
                        return NULL_VALUE;
                    }
                }
            }

            // Redirected; find the cell again in the latest table.
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
            let cell = unsafe { table.cell(self.idx) };
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

fn begin_table_migration_to_size(root: &AtomicPtr<Table>, table: &Table, next_size: usize) {
    // Double-checked creation: the load is cheap, the lock serializes the
    // actual allocation and publication.
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
