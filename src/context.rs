// src/context.rs
use crate::callbacks::CallbackHandle;
use crate::error::Error;
use crate::event_loop::EventLoop;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::{Duration, Instant};

/// A cancellation scope. Contexts form a tree: cancelling a context cancels
/// every context derived from it, with the first-set cause winning. Handles
/// are cheap to clone and safe to move across threads; everything that can
/// wake loop-side waiters routes through thread-safe wakers.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the context it was derived with. Cloneable; cancellation is
/// idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

struct Inner {
    cause: Mutex<Option<Error>>,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<Inner>>>,
    wakers: Mutex<Vec<Waker>>,
    // Loop callback that fires the deadline; removed if cancelled first.
    timer: Mutex<Option<CallbackHandle>>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Self {
        Self {
            cause: Mutex::new(None),
            deadline,
            children: Mutex::new(Vec::new()),
            wakers: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        }
    }

    fn cancel(&self, cause: Error) {
        {
            let mut slot = self.cause.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(cause.clone());
        }
        if let Some(handle) = self.timer.lock().take() {
            handle.cancel();
        }
        for waker in self.wakers.lock().drain(..) {
            waker.wake();
        }
        let children: Vec<Weak<Inner>> = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(cause.clone());
            }
        }
    }

    fn cause(&self) -> Option<Error> {
        if let Some(cause) = self.cause.lock().clone() {
            return Some(cause);
        }
        // A deadline that passed before its loop callback fired (or that was
        // created off-loop) still counts.
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.cancel(Error::DeadlineExceeded);
                return Some(Error::DeadlineExceeded);
            }
        }
        None
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.cancel();
        }
    }
}

impl Context {
    /// The root context: never cancelled, no deadline.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Derive a cancellable child context.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        self.child(None)
    }

    /// Derive a child context that cancels itself with
    /// [`Error::DeadlineExceeded`] at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        self.child(Some(deadline))
    }

    /// Derive a child context with a deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The cancellation cause, if the context has been cancelled.
    pub fn cause(&self) -> Option<Error> {
        self.inner.cause()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// The effective deadline: the earliest deadline of this context and its
    /// ancestors.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Register a waker to be fired when the context is cancelled. Wakes
    /// immediately if already cancelled.
    pub(crate) fn register_waker(&self, waker: &Waker) {
        if self.inner.cause.lock().is_some() {
            waker.wake_by_ref();
            return;
        }
        let mut wakers = self.inner.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn child(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let effective = match (self.inner.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let inner = Arc::new(Inner::new(effective));

        if let Some(cause) = self.cause() {
            inner.cancel(cause);
        } else {
            {
                let mut children = self.inner.children.lock();
                children.retain(|w| w.strong_count() > 0);
                children.push(Arc::downgrade(&inner));
            }
            // A cancel that raced the registration above may have drained the
            // children list without seeing the new entry.
            if let Some(cause) = self.cause() {
                inner.cancel(cause);
            }
        }

        // Fire the new deadline through the loop so suspended awaiters wake.
        if let Some(at) = deadline {
            if inner.cause.lock().is_none() {
                if let Some(lp) = EventLoop::try_current() {
                    let weak = Arc::downgrade(&inner);
                    let handle =
                        lp.schedule_callback(at.saturating_duration_since(Instant::now()), move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.cancel(Error::DeadlineExceeded);
                            }
                        });
                    *inner.timer.lock() = Some(handle);
                }
            }
        }

        let handle = CancelHandle {
            inner: inner.clone(),
        };
        (Context { inner }, handle)
    }
}

impl CancelHandle {
    /// Cancel with the canonical [`Error::Cancelled`] cause.
    #[inline]
    pub fn cancel(&self) {
        self.inner.cancel(Error::Cancelled);
    }

    /// Cancel with an explicit cause. The first-set cause wins.
    #[inline]
    pub fn cancel_with(&self, cause: Error) {
        self.inner.cancel(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_cause_once() {
        let ctx = Context::background();
        let (child, cancel) = ctx.with_cancel();
        assert!(child.cause().is_none());

        cancel.cancel_with(Error::msg("first"));
        cancel.cancel_with(Error::msg("second"));
        match child.cause() {
            Some(Error::Msg(m)) => assert_eq!(&*m, "first"),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test]
    fn cancellation_reaches_grandchildren() {
        let ctx = Context::background();
        let (child, cancel) = ctx.with_cancel();
        let (grandchild, _g) = child.with_cancel();

        cancel.cancel();
        assert!(matches!(grandchild.cause(), Some(Error::Cancelled)));
    }

    #[test]
    fn child_of_cancelled_context_is_born_cancelled() {
        let ctx = Context::background();
        let (child, cancel) = ctx.with_cancel();
        cancel.cancel_with(Error::msg("gone"));

        let (grandchild, _g) = child.with_cancel();
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn past_deadline_observed_without_a_loop() {
        let ctx = Context::background();
        let (child, _cancel) = ctx.with_timeout(Duration::ZERO);
        assert!(matches!(child.cause(), Some(Error::DeadlineExceeded)));
    }

    #[test]
    fn effective_deadline_is_the_minimum() {
        let ctx = Context::background();
        let near = Instant::now() + Duration::from_secs(1);
        let far = near + Duration::from_secs(60);
        let (child, _a) = ctx.with_deadline(near);
        let (grandchild, _b) = child.with_deadline(far);
        assert_eq!(grandchild.deadline(), Some(near));
    }
}
