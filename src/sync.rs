//! Blocking primitives shared across every table in the process.
//!
//! Tables are numerous and mostly never block, so none of them embeds a
//! condvar of its own. Instead a fixed bank of mutex/condvar pairs is
//! shared by all waiters, selected by hashing the address of the object
//! being waited on. False sharing of a pair only causes spurious wakeups,
//! which every wait loop here tolerates.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::traits::avalanche;

pub(crate) struct ConditionPair {
    pub(crate) mutex: Mutex<()>,
    pub(crate) condvar: Condvar,
}

impl ConditionPair {
    const fn new() -> ConditionPair {
        ConditionPair {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }
}

const BANK_SIZE: usize = 256;

struct ConditionBank {
    pairs: [ConditionPair; BANK_SIZE],
}

impl ConditionBank {
    const fn new() -> ConditionBank {
        const PAIR: ConditionPair = ConditionPair::new();
        ConditionBank {
            pairs: [PAIR; BANK_SIZE],
        }
    }
}

static BANK: ConditionBank = ConditionBank::new();

/// The condition pair assigned to the object at this address.
pub(crate) fn pair_for<T>(object: *const T) -> &'static ConditionPair {
    let index = avalanche(object as *const () as usize as u64) as usize & (BANK_SIZE - 1);
    &BANK.pairs[index]
}

/// A one-shot event: starts unsignaled, latches signaled forever.
///
/// Used to order the publication of a migrated subtree after its parent;
/// waiting borrows a pair from the shared bank.
pub(crate) struct ManualResetEvent {
    signaled: AtomicBool,
}

impl ManualResetEvent {
    pub(crate) fn new() -> ManualResetEvent {
        ManualResetEvent {
            signaled: AtomicBool::new(false),
        }
    }

    pub(crate) fn signal(&self) {
        let pair = pair_for(self);
        {
            let _guard = pair.mutex.lock();
            self.signaled.store(true, Ordering::Release);
        }
        pair.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        if self.signaled.load(Ordering::Acquire) {
            return;
        }
        let pair = pair_for(self);
        let mut guard = pair.mutex.lock();
        while !self.signaled.load(Ordering::Acquire) {
            pair.condvar.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_latches() {
        let event = ManualResetEvent::new();
        event.signal();
        event.wait();
        event.wait();
    }

    #[test]
    fn event_wakes_waiters() {
        let event = ManualResetEvent::new();
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| event.wait());
            }
            event.signal();
        });
    }
}
