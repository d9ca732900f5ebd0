//! Single-value promise with either callback- or continuation-style
//! resumption.
//!
//! A [`Promise`] is the one primitive everything else composes on: buffered
//! file descriptors resolve them when bytes arrive, the context resolves them
//! when a connect completes or a task comes back from the pool, and protocol
//! state machines await them. The producer side holds a [`WeakPromise`] so
//! that an awaiter dropping out mid-flight turns the resolve into a no-op
//! instead of a touch of freed state.

use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

struct State<T> {
    value: Option<T>,
    callback: Option<Box<dyn FnOnce(T)>>,
    waker: Option<Waker>,
}

/// Single-assignment cell plus at most one continuation.
///
/// States: pending (no value), ready (value stored), consumed (value taken by
/// an await or a callback). Resolving twice is benign; the second value is
/// dropped.
pub struct Promise<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Promise<T> {
        Promise {
            state: Rc::new(RefCell::new(State {
                value: None,
                callback: None,
                waker: None,
            })),
        }
    }

    /// Shorthand for a promise that is born resolved.
    pub fn resolved(value: T) -> Promise<T> {
        let p = Promise::new();
        p.resolve(value);
        p
    }

    /// Weak handle for the producer side; see [`WeakPromise::resolve`].
    pub fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            state: Rc::downgrade(&self.state),
        }
    }

    /// Hand `value` to whoever is waiting.
    ///
    /// If a callback is registered it runs right here; if a task is parked on
    /// the promise its waker fires and the value is picked up at the next
    /// poll. A second resolve is a no-op.
    pub fn resolve(&self, value: T) {
        let (callback, waker) = {
            let mut st = self.state.borrow_mut();
            if st.value.is_some() {
                return;
            }
            if let Some(cb) = st.callback.take() {
                (Some((cb, value)), None)
            } else {
                st.value = Some(value);
                (None, st.waker.take())
            }
        };
        if let Some((cb, value)) = callback {
            cb(value);
        }
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Register a callback, or run it immediately when the value is already
    /// here.
    pub fn then(&self, f: impl FnOnce(T) + 'static) {
        let value = self.state.borrow_mut().value.take();
        match value {
            Some(v) => f(v),
            None => self.state.borrow_mut().callback = Some(Box::new(f)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state.borrow().value.is_some()
    }
}

impl<T> Future for Promise<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut st = self.state.borrow_mut();
        match st.value.take() {
            Some(v) => Poll::Ready(v),
            None => {
                st.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Producer-side handle that does not keep the awaiter alive.
pub struct WeakPromise<T> {
    state: Weak<RefCell<State<T>>>,
}

impl<T> Clone for WeakPromise<T> {
    fn clone(&self) -> Self {
        WeakPromise {
            state: self.state.clone(),
        }
    }
}

impl<T> WeakPromise<T> {
    /// Upgrade-or-skip: resolving after the owner dropped does nothing and
    /// reports `false`.
    pub fn resolve(&self, value: T) -> bool {
        match self.state.upgrade() {
            Some(state) => {
                Promise { state }.resolve(value);
                true
            }
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;

    #[test]
    fn then_after_resolve_runs_immediately() {
        let p = Promise::new();
        p.resolve(7usize);
        let got = Rc::new(Cell::new(0usize));
        let got2 = got.clone();
        p.then(move |v| got2.set(v));
        assert_eq!(got.get(), 7);
    }

    #[test]
    fn then_before_resolve_runs_on_resolve() {
        let p = Promise::new();
        let got = Rc::new(Cell::new(0usize));
        let got2 = got.clone();
        p.then(move |v| got2.set(v));
        assert_eq!(got.get(), 0);
        p.resolve(3);
        assert_eq!(got.get(), 3);
    }

    #[test]
    fn second_resolve_is_a_noop() {
        let p = Promise::new();
        p.resolve(1usize);
        p.resolve(2usize);
        let got = Rc::new(Cell::new(0usize));
        let got2 = got.clone();
        p.then(move |v| got2.set(v));
        assert_eq!(got.get(), 1);
    }

    #[test]
    fn awaiting_resumes_on_resolve() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let p = Promise::<u32>::new();
        let weak = p.downgrade();
        let got = Rc::new(Cell::new(0u32));
        let got2 = got.clone();
        spawner
            .spawn_local(async move {
                got2.set(p.await);
            })
            .unwrap();
        pool.run_until_stalled();
        assert_eq!(got.get(), 0);
        assert!(weak.resolve(99));
        pool.run_until_stalled();
        assert_eq!(got.get(), 99);
    }

    #[test]
    fn resolving_a_dropped_awaiter_is_a_noop() {
        let weak = {
            let p = Promise::<u32>::new();
            p.downgrade()
        };
        assert!(!weak.resolve(1));
        assert!(!weak.is_alive());
    }
}
