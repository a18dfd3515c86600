//! The single-slot job coordinator.
//!
//! Each table carries one coordinator. When the table stalls (overflow or
//! redirect), a migration job is published into the slot and every thread
//! that trips over the stall calls [`JobCoordinator::participate`], running
//! the job and any chained successors until the coordinator is ended.
//!
//! Jobs are type-erased as a [`Job`] header embedded as the first field of
//! the concrete migration struct: one dispatch word pointing at a thunk
//! that re-derives the concrete type. Everything here may be called from
//! inside a running job; recursive participation is part of the protocol
//! (a subtree publication drives the flat-tree migration this way).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync;

/// Sentinel published by [`JobCoordinator::end`].
const END: usize = 1;

/// Type-erased job header. Concrete jobs embed this as their first field
/// (`#[repr(C)]`) so the thunk can cast the header pointer back.
pub(crate) struct Job {
    pub(crate) run: unsafe fn(*mut Job),
}

pub(crate) struct JobCoordinator {
    job: AtomicUsize,
}

impl JobCoordinator {
    pub(crate) fn new() -> JobCoordinator {
        JobCoordinator {
            job: AtomicUsize::new(0),
        }
    }

    /// The published slot word as a pointer: null when nothing was ever
    /// published, the END sentinel after [`end`](Self::end), otherwise the
    /// job. An ended coordinator is NOT null; a stalled table stays claimed
    /// forever so no one starts a second migration of it. `Acquire` pairs
    /// with the store in [`store_release`](Self::store_release).
    pub(crate) fn load(&self) -> *mut Job {
        self.job.load(Ordering::Acquire) as *mut Job
    }

    /// Publishes `job` and wakes every participant blocked on this
    /// coordinator.
    pub(crate) fn store_release(&self, job: *mut Job) {
        let pair = sync::pair_for(self);
        {
            let _guard = pair.mutex.lock();
            self.job.store(job as usize, Ordering::Release);
        }
        pair.condvar.notify_all();
    }

    /// Runs the published job (blocking until one appears), then any jobs
    /// chained after it, returning once the coordinator is ended.
    pub(crate) fn participate(&self) {
        let pair = sync::pair_for(self);
        let mut prev_job = 0usize;
        loop {
            let mut job = self.job.load(Ordering::Acquire);
            if job == prev_job {
                let mut guard = pair.mutex.lock();
                loop {
                    job = self.job.load(Ordering::Relaxed);
                    if job != prev_job {
                        break;
                    }
                    pair.condvar.wait(&mut guard);
                }
            }
            if job == END {
                return;
            }
            let job_ptr = job as *mut Job;
            unsafe { ((*job_ptr).run)(job_ptr) };
            prev_job = job;
        }
    }

    /// Publishes `job` and runs it on the calling thread. Used when the
    /// caller needs the job's completion before it can proceed.
    pub(crate) fn run_one(&self, job: *mut Job) {
        debug_assert!(job as usize != self.job.load(Ordering::Relaxed));
        self.store_release(job);
        unsafe { ((*job).run)(job) };
    }

    /// Tells all current and future participants to return.
    pub(crate) fn end(&self) {
        let pair = sync::pair_for(self);
        {
            let _guard = pair.mutex.lock();
            self.job.store(END, Ordering::Release);
        }
        pair.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[repr(C)]
    struct CountingJob {
        job: Job,
        runs: AtomicUsize,
        coordinator: *const JobCoordinator,
    }

    unsafe fn run_counting(job: *mut Job) {
        let this = unsafe { &*(job as *mut CountingJob) };
        this.runs.fetch_add(1, Ordering::Relaxed);
        unsafe { (*this.coordinator).end() };
    }

    #[test]
    fn participants_run_the_published_job() {
        let coordinator = JobCoordinator::new();
        let mut job = CountingJob {
            job: Job { run: run_counting },
            runs: AtomicUsize::new(0),
            coordinator: &coordinator,
        };
        let job_ptr = &mut job as *mut CountingJob as *mut Job;

        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| coordinator.participate());
            }
            coordinator.store_release(job_ptr);
        });

        assert!(job.runs.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn ended_coordinator_releases_participants() {
        let coordinator = JobCoordinator::new();
        coordinator.end();
        coordinator.participate();
    }
}
