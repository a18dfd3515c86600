//! Quiescent-state-based reclamation.
//!
//! Every thread that touches map internals registers a [`Context`] and
//! periodically calls [`Qsbr::update`] to declare that it holds no
//! references into any table. Destruction of retired tables and migration
//! objects is deferred through [`Qsbr::enqueue`] until every registered
//! context has been seen quiescent, then run.
//!
//! Actions are buffered in two phases (deferred, then pending): an action
//! enqueued during one quiescence interval runs no earlier than the end of
//! the next, which covers the window between a retiring store and the
//! retiring thread's own quiescent declaration.
//!
//! A process-wide registry is available through [`default`]; maps enqueue
//! retired objects there.

use std::cell::Cell;

use parking_lot::Mutex;

/// A registered thread's slot in the registry.
///
/// Contexts are plain indices; creating and destroying them is cheap
/// enough to do per worker thread at startup and shutdown.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Context(u16);

/// A deferred destruction: one dispatch word and one payload word.
///
/// The function knows the concrete type of the object behind the pointer;
/// the registry only stores and invokes the pair.
struct Action {
    func: unsafe fn(*mut ()),
    arg: *mut (),
}

// Actions move to whichever thread happens to tip the registry over into
// a new interval. The objects they destroy are unreachable by then.
unsafe impl Send for Action {}

impl Action {
    unsafe fn run(self) {
        unsafe { (self.func)(self.arg) }
    }
}

struct Status {
    in_use: bool,
    was_idle: bool,
    next_free: i16,
}

impl Status {
    const fn new() -> Status {
        Status {
            in_use: true,
            was_idle: false,
            next_free: 0,
        }
    }
}

struct State {
    statuses: Vec<Status>,
    free_index: i16,
    num_contexts: usize,
    /// Contexts not yet seen quiescent in the current interval.
    remaining: usize,
    deferred: Vec<Action>,
    pending: Vec<Action>,
}

impl State {
    /// Close the current interval: promote deferred actions to pending,
    /// hand the previous pending batch to the caller to run, and reset the
    /// quiescence count. Must be called with the registry locked.
    fn on_all_quiescent(&mut self) -> Vec<Action> {
        let ready = std::mem::take(&mut self.pending);
        self.pending = std::mem::take(&mut self.deferred);
        self.remaining = self.num_contexts;
        for status in &mut self.statuses {
            status.was_idle = false;
        }
        ready
    }
}

/// A reclamation registry.
pub struct Qsbr {
    state: Mutex<State>,
}

impl Qsbr {
    pub const fn new() -> Qsbr {
        Qsbr {
            state: Mutex::new(State {
                statuses: Vec::new(),
                free_index: -1,
                num_contexts: 0,
                remaining: 0,
                deferred: Vec::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Registers the calling thread. The context should live for the
    /// thread's whole working life; see [`Qsbr::destroy_context`].
    pub fn create_context(&self) -> Context {
        let mut state = self.state.lock();
        state.num_contexts += 1;
        state.remaining += 1;
        assert!(state.num_contexts < (1 << 14), "too many QSBR contexts");

        let index = state.free_index;
        if index >= 0 {
            debug_assert!(!state.statuses[index as usize].in_use);
            state.free_index = state.statuses[index as usize].next_free;
            state.statuses[index as usize] = Status::new();
            Context(index as u16)
        } else {
            state.statuses.push(Status::new());
            Context((state.statuses.len() - 1) as u16)
        }
    }

    /// Deregisters a context. If this was the last context holding up the
    /// current interval, the ready actions run on this thread.
    pub fn destroy_context(&self, context: Context) {
        let ready = {
            let mut state = self.state.lock();
            let index = context.0 as usize;
            assert!(index < state.statuses.len() && state.statuses[index].in_use);

            if !state.statuses[index].was_idle {
                debug_assert!(state.remaining > 0);
                state.remaining -= 1;
            }
            state.statuses[index].in_use = false;
            state.statuses[index].next_free = state.free_index;
            state.free_index = context.0 as i16;
            state.num_contexts -= 1;

            if state.remaining == 0 {
                state.on_all_quiescent()
            } else {
                Vec::new()
            }
        };
        for action in ready {
            unsafe { action.run() }
        }
    }

    /// Defers a destruction until all live contexts have quiesced.
    ///
    /// # Safety
    ///
    /// `func(arg)` must be safe to call exactly once from any thread, and
    /// `arg` must stay valid until it runs.
    pub unsafe fn enqueue(&self, func: unsafe fn(*mut ()), arg: *mut ()) {
        let mut state = self.state.lock();
        state.deferred.push(Action { func, arg });
    }

    /// Declares that the calling thread holds no references into any map.
    ///
    /// Must not be called while a `Mutator` is live on this thread: the
    /// mutator's cell could be freed mid-use. That misuse is caught by an
    /// assertion.
    pub fn update(&self, context: Context) {
        assert!(
            live_mutators() == 0,
            "qsbr update() while a map Mutator is live on this thread"
        );
        let ready = {
            let mut state = self.state.lock();
            let index = context.0 as usize;
            assert!(index < state.statuses.len() && state.statuses[index].in_use);

            if state.statuses[index].was_idle {
                return;
            }
            state.statuses[index].was_idle = true;
            debug_assert!(state.remaining > 0);
            state.remaining -= 1;
            if state.remaining > 0 {
                return;
            }
            state.on_all_quiescent()
        };
        for action in ready {
            unsafe { action.run() }
        }
    }

    /// Runs all outstanding actions immediately.
    ///
    /// Valid only when no map operations are in flight on any thread;
    /// intended for process shutdown.
    pub fn flush(&self) {
        assert!(
            live_mutators() == 0,
            "qsbr flush() while a map Mutator is live on this thread"
        );
        let (pending, deferred) = {
            let mut state = self.state.lock();
            state.remaining = state.num_contexts;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.deferred),
            )
        };
        for action in pending {
            unsafe { action.run() }
        }
        for action in deferred {
            unsafe { action.run() }
        }
    }
}

impl Default for Qsbr {
    fn default() -> Qsbr {
        Qsbr::new()
    }
}

static DEFAULT: Qsbr = Qsbr::new();

/// The process-wide registry used by the maps to retire tables and
/// migration objects.
pub fn default() -> &'static Qsbr {
    &DEFAULT
}

thread_local! {
    static LIVE_MUTATORS: Cell<usize> = const { Cell::new(0) };
}

fn live_mutators() -> usize {
    LIVE_MUTATORS.with(|count| count.get())
}

/// RAII marker for a live `Mutator` on this thread. Declaring a quiescent
/// state while one exists is a policy violation.
pub(crate) struct MutatorGuard;

impl MutatorGuard {
    pub(crate) fn acquire() -> MutatorGuard {
        LIVE_MUTATORS.with(|count| count.set(count.get() + 1));
        MutatorGuard
    }
}

impl Drop for MutatorGuard {
    fn drop(&mut self) {
        LIVE_MUTATORS.with(|count| count.set(count.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe fn bump(arg: *mut ()) {
        let counter = unsafe { &*(arg as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn action_runs_once_after_all_contexts_quiesce() {
        let qsbr = Qsbr::new();
        let ran = AtomicUsize::new(0);

        let a = qsbr.create_context();
        let b = qsbr.create_context();

        unsafe { qsbr.enqueue(bump, &ran as *const _ as *mut ()) };

        // First interval: promote deferred to pending.
        qsbr.update(a);
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        qsbr.update(b);
        assert_eq!(ran.load(Ordering::Relaxed), 0);

        // Second interval: the pending batch runs.
        qsbr.update(a);
        qsbr.update(b);
        assert_eq!(ran.load(Ordering::Relaxed), 1);

        qsbr.destroy_context(a);
        qsbr.destroy_context(b);
        qsbr.flush();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn repeated_update_in_same_interval_is_idempotent() {
        let qsbr = Qsbr::new();
        let ran = AtomicUsize::new(0);

        let a = qsbr.create_context();
        let b = qsbr.create_context();
        unsafe { qsbr.enqueue(bump, &ran as *const _ as *mut ()) };

        qsbr.update(a);
        qsbr.update(a);
        qsbr.update(a);
        assert_eq!(ran.load(Ordering::Relaxed), 0);

        qsbr.destroy_context(b);
        qsbr.destroy_context(a);
        qsbr.flush();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn context_indices_are_recycled() {
        let qsbr = Qsbr::new();
        let a = qsbr.create_context();
        qsbr.destroy_context(a);
        let b = qsbr.create_context();
        assert_eq!(a, b);
        qsbr.destroy_context(b);
    }

    #[test]
    fn flush_runs_both_batches() {
        let qsbr = Qsbr::new();
        let ran = AtomicUsize::new(0);
        let ctx = qsbr.create_context();

        unsafe { qsbr.enqueue(bump, &ran as *const _ as *mut ()) };
        qsbr.update(ctx); // promotes to pending
        unsafe { qsbr.enqueue(bump, &ran as *const _ as *mut ()) };

        qsbr.destroy_context(ctx);
        qsbr.flush();
        assert_eq!(ran.load(Ordering::Relaxed), 2);
    }
}
