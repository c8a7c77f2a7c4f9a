// src/sync.rs
use crate::context::Context;
use crate::error::Error;
use crate::promise::Promise;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Cooperative mutual exclusion built on the unlock-future protocol: while
/// held, a pending promise is installed; unlocking completes it, waking the
/// waiters, and the next acquirer installs a fresh one. At most one waiter
/// acquires per unlock.
#[derive(Clone, Default)]
pub struct Mutex {
    unlock: Rc<RefCell<Option<Promise<()>>>>,
}

impl Mutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, suspending behind the current holder. Fails only if
    /// `ctx` is cancelled while waiting.
    pub async fn lock(&self, ctx: &Context) -> Result<(), Error> {
        loop {
            let current = self.unlock.borrow().clone();
            match current {
                Some(fut) if !fut.is_done() => {
                    // Await through a shield: a cancelled waiter must not
                    // complete the shared unlock-future and admit a second
                    // holder.
                    fut.shield().wait(ctx).await?;
                }
                _ => {
                    *self.unlock.borrow_mut() = Some(Promise::new());
                    return Ok(());
                }
            }
        }
    }

    /// Release the lock, waking every waiter; one of them re-acquires.
    /// No-op if never locked.
    pub fn unlock(&self) {
        let fut = self.unlock.borrow().clone();
        if let Some(fut) = fut {
            fut.complete(Ok(()));
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(&*self.unlock.borrow(), Some(fut) if !fut.is_done())
    }
}

/// An unbounded FIFO whose consumers receive promises. At any steady state
/// at most one of the two internal lists (items, waiters) is non-empty.
pub struct Queue<T> {
    inner: Rc<RefCell<QueueState<T>>>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    waiters: VecDeque<Promise<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueState {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }
}

impl<T: Clone + 'static> Queue<T> {
    /// A promise for the next item. Completed synchronously if an item is
    /// already available.
    pub fn get(&self) -> Promise<T> {
        let fut: Promise<T> = Promise::new();
        let item = self.inner.borrow_mut().items.pop_front();
        match item {
            Some(item) => fut.complete(Ok(item)),
            None => self.inner.borrow_mut().waiters.push_back(fut.clone()),
        }
        fut
    }

    /// Append an item and pair it with the oldest live waiter. Waiters whose
    /// promises are already done (cancelled) are skipped and dropped.
    pub fn push(&self, item: T) {
        let mut ready = Vec::new();
        {
            let mut state = self.inner.borrow_mut();
            state.items.push_back(item);
            while !state.waiters.is_empty() && !state.items.is_empty() {
                let fut = state.waiters.pop_front().expect("waiters is non-empty");
                if fut.is_done() {
                    continue;
                }
                let item = state.items.pop_front().expect("items is non-empty");
                ready.push((fut, item));
            }
        }
        // Completion callbacks may push or get; run them outside the borrow.
        for (fut, item) in ready {
            fut.complete(Ok(item));
        }
    }
}
