//! The top-level index from high-order hash bits to leaf tables.
//!
//! A flat tree is an array of `2^(64 - safe_shift)` leaf pointers; the
//! leaf for a hash is `tables[hash >> safe_shift]`. Adjacent slots may
//! share a leaf when the leaf covers a wider range than one slot. The
//! tree itself grows by migration: slots of the old tree are exchanged
//! with a redirect sentinel and copied (repeated) into a tree with a
//! smaller shift.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::coordinator::Job;
use crate::qsbr;
use crate::sync::ManualResetEvent;

use super::raw::{Map, Table};

/// Slot sentinel: this slot has moved to a larger flat tree.
pub(super) const REDIRECT_FLAT_TREE: usize = 1;

const FLAT_TREE_MIGRATION_UNIT_SIZE: usize = 32;

/// Header; the leaf-pointer array trails it in the same allocation.
#[repr(C)]
pub(super) struct FlatTree {
    pub(super) safe_shift: usize,
    /// The in-progress migration of this tree, if any.
    migration: Mutex<*mut FlatTreeMigration>,
}

impl FlatTree {
    fn layout(num_leaves: usize) -> (Layout, usize) {
        Layout::new::<FlatTree>()
            .extend(Layout::array::<AtomicPtr<Table>>(num_leaves).unwrap())
            .unwrap()
    }

    /// Allocates a tree with null slots; the caller fills them before
    /// publication.
    pub(super) fn create(safe_shift: usize) -> *mut FlatTree {
        // A flat tree always has at least two leaves.
        assert!(safe_shift < 64);
        let num_leaves = ((u64::MAX >> safe_shift) as usize) + 1;
        let (layout, offset) = FlatTree::layout(num_leaves);
        unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            ptr.cast::<FlatTree>().write(FlatTree {
                safe_shift,
                migration: Mutex::new(ptr::null_mut()),
            });
            ptr.add(offset)
                .write_bytes(0, num_leaves * std::mem::size_of::<AtomicPtr<Table>>());
            ptr.cast()
        }
    }

    pub(super) unsafe fn destroy(flat_tree: *mut FlatTree) {
        let (layout, _) = FlatTree::layout(unsafe { (*flat_tree).num_leaves() });
        unsafe {
            ptr::drop_in_place(flat_tree);
            dealloc(flat_tree.cast(), layout);
        }
    }

    unsafe fn destroy_thunk(arg: *mut ()) {
        unsafe { FlatTree::destroy(arg as *mut FlatTree) }
    }

    pub(super) unsafe fn garbage_collect(flat_tree: *mut FlatTree) {
        unsafe { qsbr::default().enqueue(FlatTree::destroy_thunk, flat_tree as *mut ()) }
    }

    pub(super) fn num_leaves(&self) -> usize {
        ((u64::MAX >> self.safe_shift) as usize) + 1
    }

    pub(super) fn table_slot(&self, idx: usize) -> &AtomicPtr<Table> {
        debug_assert!(idx < self.num_leaves());
        let base = unsafe { (self as *const FlatTree).add(1).cast::<AtomicPtr<Table>>() };
        unsafe { &*base.add(idx) }
    }

    fn num_migration_units(&self) -> usize {
        (u64::MAX >> self.safe_shift) as usize / FLAT_TREE_MIGRATION_UNIT_SIZE + 1
    }
}

/// Grows a flat tree. Same worker protocol as a table migration, but the
/// "cells" are leaf-pointer slots and there is no failure path.
#[repr(C)]
pub(super) struct FlatTreeMigration {
    job: Job,
    map: *const Map,
    pub(super) source: *mut FlatTree,
    pub(super) destination: *mut FlatTree,
    worker_status: AtomicUsize,
    source_index: AtomicUsize,
    units_remaining: AtomicIsize,
    /// Signaled once the destination tree has been stored into the root.
    pub(super) completed: ManualResetEvent,
}

impl FlatTreeMigration {
    fn create(map: *const Map, source: *mut FlatTree, safe_shift: usize) -> *mut FlatTreeMigration {
        let units = unsafe { &*source }.num_migration_units();
        Box::into_raw(Box::new(FlatTreeMigration {
            job: Job {
                run: FlatTreeMigration::run_thunk,
            },
            map,
            source,
            destination: FlatTree::create(safe_shift),
            worker_status: AtomicUsize::new(0),
            source_index: AtomicUsize::new(0),
            units_remaining: AtomicIsize::new(units as isize),
            completed: ManualResetEvent::new(),
        }))
    }

    pub(super) fn as_job(&self) -> *mut Job {
        self as *const FlatTreeMigration as *mut Job
    }

    unsafe fn run_thunk(job: *mut Job) {
        unsafe { (*(job as *mut FlatTreeMigration)).run() }
    }

    unsafe fn destroy_thunk(arg: *mut ()) {
        let migration = unsafe { Box::from_raw(arg as *mut FlatTreeMigration) };
        unsafe { FlatTree::destroy(migration.source) };
    }

    pub(super) fn run(&self) {
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

        let source = unsafe { &*self.source };
        let destination = unsafe { &*self.destination };
        let src_size = source.num_leaves();
        debug_assert!(destination.safe_shift < source.safe_shift);
        let repeat = 1usize << (source.safe_shift - destination.safe_shift);

        loop {
            let src_start = self
                .source_index
                .fetch_add(FLAT_TREE_MIGRATION_UNIT_SIZE, Ordering::Relaxed);
            if src_start >= src_size {
                break;
            }
            let src_end = src_size.min(src_start + FLAT_TREE_MIGRATION_UNIT_SIZE);
            let mut dst = src_start * repeat;
            for src in src_start..src_end {
                // Source slots can change under us from concurrent subtree
                // publishes, so exchange a redirect in; the publisher will
                // chase us to the new tree.
                let table = source
                    .table_slot(src)
                    .swap(REDIRECT_FLAT_TREE as *mut Table, Ordering::Relaxed);
                debug_assert!(table as usize != REDIRECT_FLAT_TREE);
                for _ in 0..repeat {
                    destination.table_slot(dst).store(table, Ordering::Relaxed);
                    dst += 1;
                }
            }
            let prev_remaining = self.units_remaining.fetch_sub(1, Ordering::Relaxed);
            if prev_remaining == 1 {
                // That was the last unit.
                self.worker_status.fetch_or(1, Ordering::Relaxed);
                break;
            }
        }

        // Leave; AcqRel makes this worker's stores visible to the last one.
        let status = self.worker_status.fetch_sub(2, Ordering::AcqRel);
        if status >= 4 {
            return;
        }
        debug_assert_eq!(status, 3);

        let map = unsafe { &*self.map };
        map.publish_flat_tree_migration(self);
        self.completed.signal();

        unsafe {
            qsbr::default().enqueue(
                FlatTreeMigration::destroy_thunk,
                self as *const FlatTreeMigration as *mut (),
            )
        };
    }
}

/// Returns the migration growing `flat_tree` to `safe_shift`, creating it
/// if none exists yet. A racing creation with a different shift loses; the
/// loser helps the existing migration and retries at its caller.
pub(super) fn create_migration(
    map: *const Map,
    flat_tree: *mut FlatTree,
    safe_shift: usize,
) -> *mut FlatTreeMigration {
    let tree = unsafe { &*flat_tree };
    let mut slot = tree.migration.lock();
    if slot.is_null() {
        *slot = FlatTreeMigration::create(map, flat_tree, safe_shift);
    }
    *slot
}

/// The already-created migration of `flat_tree`. Used after observing a
/// redirect sentinel in one of its slots, which implies the migration
/// exists.
pub(super) fn get_existing_migration(flat_tree: *mut FlatTree) -> *mut FlatTreeMigration {
    let tree = unsafe { &*flat_tree };
    let slot = tree.migration.lock();
    debug_assert!(!slot.is_null());
    *slot
}
