//! Cooperative FIFO-fair lock.
//!
//! Callers that interleave multi-step request/response cycles on one shared
//! file descriptor (the HTTP client on a keep-alive connection, for one) take
//! this lock around the whole cycle so their writes do not interleave on the
//! wire. Waiters are woken strictly in arrival order.

use std::{cell::Cell, cell::RefCell, collections::VecDeque};

use crate::promise::{Promise, WeakPromise};

#[derive(Default)]
pub struct FairLock {
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<WeakPromise<bool>>>,
}

impl FairLock {
    pub fn new() -> FairLock {
        FairLock::default()
    }

    /// Resolves with `true` once the lock is held by the caller.
    pub fn lock(&self) -> Promise<bool> {
        let promise = Promise::new();
        if self.locked.get() {
            self.waiters.borrow_mut().push_back(promise.downgrade());
        } else {
            self.locked.set(true);
            promise.resolve(true);
        }
        promise
    }

    /// Hand the lock to the oldest living waiter, or release it.
    pub fn unlock(&self) {
        loop {
            let next = self.waiters.borrow_mut().pop_front();
            match next {
                // A waiter that dropped its promise gave up on the lock; skip
                // it and try the next one.
                Some(waiter) => {
                    if waiter.resolve(true) {
                        return;
                    }
                }
                None => {
                    self.locked.set(false);
                    return;
                }
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn uncontended_lock_resolves_immediately() {
        let lock = FairLock::new();
        assert!(lock.lock().is_resolved());
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn waiters_wake_in_fifo_order() {
        let lock = Rc::new(FairLock::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = lock.lock();
        assert!(first.is_resolved());

        let mut waiters = Vec::new();
        for i in 0..3 {
            let p = lock.lock();
            let order = order.clone();
            let lock2 = lock.clone();
            p.then(move |_| {
                order.borrow_mut().push(i);
                lock2.unlock();
            });
            waiters.push(p);
        }

        assert!(order.borrow().is_empty());
        lock.unlock();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(!lock.is_locked());
    }

    #[test]
    fn dropped_waiter_is_skipped() {
        let lock = FairLock::new();
        let _held = lock.lock();
        drop(lock.lock());
        let last = lock.lock();
        lock.unlock();
        assert!(last.is_resolved());
        assert!(lock.is_locked());
    }
}
