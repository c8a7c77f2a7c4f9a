// src/event_loop.rs
use crate::callbacks::{CallbackHandle, CallbackQueue, CallbackState};
use crate::context::Context;
use crate::error::Error;
use crate::inbox::{inbox_channel, InboxRx, ThreadsafeFn};
use crate::poller::Poller;
use crate::promise::{Completion, Promise};
use crate::stream::AsyncStream;
use crate::task::{self, Task, TaskCore};
use crate::thread::AnyBox;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

// Upper bound on a single poller wait, so clock drift against far-future
// callbacks stays bounded.
const HARD_CAP: Duration = Duration::from_secs(30);

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

/// The driver: a single-threaded event loop multiplexing tasks over timed
/// callbacks and I/O readiness. All scheduling state is confined to the loop
/// thread; the only cross-thread entry points are
/// [`run_callback_threadsafe`](EventLoop::run_callback_threadsafe) (via
/// [`LoopHandle`]) and the poller wake-up behind it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

pub(crate) struct LoopInner {
    callbacks: RefCell<CallbackQueue>,
    inbox: InboxRx,
    shared: Arc<LoopShared>,
    poller: RefCell<Option<Rc<Poller>>>,

    task_stack: RefCell<Vec<Rc<TaskCore>>>,
    tasks: RefCell<HashMap<u64, Weak<TaskCore>>>,
    next_task: Cell<u64>,

    // Loop-side completions for results produced on worker threads.
    foreign: RefCell<HashMap<u64, ForeignFinish>>,
    next_foreign: Cell<u64>,

    drained: RefCell<Option<Promise<()>>>,
}

pub(crate) type ForeignFinish = Box<dyn FnOnce(AnyBox)>;

/// The `Send + Sync` slice of the loop: the inbox sender, the poller wake-up,
/// and the loop's home thread id.
pub(crate) struct LoopShared {
    tx: crate::inbox::InboxTx,
    waker: Mutex<Option<Arc<mio::Waker>>>,
    thread: ThreadId,
}

impl LoopShared {
    #[inline]
    pub(crate) fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Enqueue a callback from any thread and kick the poller awake. A full
    /// inbox blocks the sender; a failed wake-up is logged and swallowed.
    pub(crate) fn post(&self, f: ThreadsafeFn) {
        if !self.tx.send(f) {
            warn!("event loop inbox is gone, dropping threadsafe callback");
            return;
        }
        let waker = self.waker.lock().clone();
        if let Some(waker) = waker {
            if let Err(err) = waker.wake() {
                warn!(error = %err, "could not wake up event loop from thread");
            }
        }
    }
}

/// Cloneable, `Send` handle for scheduling callbacks onto the loop from
/// other threads.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn run_callback_threadsafe(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(f));
    }
}

struct EnterGuard;

impl EnterGuard {
    fn enter(inner: Rc<LoopInner>) -> Self {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "an event loop is already running on this thread"
            );
            *current = Some(inner);
        });
        EnterGuard
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = inbox_channel();
        EventLoop {
            inner: Rc::new(LoopInner {
                callbacks: RefCell::new(CallbackQueue::new()),
                inbox: rx,
                shared: Arc::new(LoopShared {
                    tx,
                    waker: Mutex::new(None),
                    thread: thread::current().id(),
                }),
                poller: RefCell::new(None),
                task_stack: RefCell::new(Vec::new()),
                tasks: RefCell::new(HashMap::new()),
                next_task: Cell::new(0),
                foreign: RefCell::new(HashMap::new()),
                next_foreign: Cell::new(0),
                drained: RefCell::new(None),
            }),
        }
    }

    /// The loop running on this thread. Panics outside `run`.
    pub fn current() -> EventLoop {
        Self::try_current().expect("no event loop is running on this thread")
    }

    pub fn try_current() -> Option<EventLoop> {
        CURRENT.with(|current| current.borrow().clone().map(|inner| EventLoop { inner }))
    }

    /// A `Send` handle for the threadsafe callback path.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.inner.shared.clone(),
        }
    }

    pub(crate) fn shared(&self) -> Arc<LoopShared> {
        self.inner.shared.clone()
    }

    /// Schedule `f` to run on the loop thread after `delay`. The handle
    /// cancels it.
    pub fn schedule_callback(&self, delay: Duration, f: impl FnOnce() + 'static) -> CallbackHandle {
        self.inner
            .callbacks
            .borrow_mut()
            .push(Instant::now() + delay, Box::new(f))
    }

    /// Schedule `f` with zero delay: it runs on the next loop iteration.
    pub fn run_callback(&self, f: impl FnOnce() + 'static) {
        self.schedule_callback(Duration::ZERO, f);
    }

    /// Enqueue `f` from any thread; wakes a blocked poller so it runs
    /// promptly.
    pub fn run_callback_threadsafe(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.shared.post(Box::new(f));
    }

    /// A promise completed the next time the callback heap drains empty.
    pub fn wait_for_callbacks(&self) -> Promise<()> {
        self.inner
            .drained
            .borrow_mut()
            .get_or_insert_with(Promise::new)
            .clone()
    }

    /// Drive `main` to completion. Returns `main`'s error, the context's
    /// cancellation cause, or a poller failure; `Ok(())` on a clean run.
    ///
    /// The loop exits when the root context is cancelled, or when the main
    /// task is done and no callbacks remain. On exit every still-live task's
    /// result promise is cancelled, the heap is purged, and the inbox is
    /// drained.
    pub fn run<F, Fut>(&self, ctx: &Context, main: F) -> Result<(), Error>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<(), Error>> + 'static,
    {
        assert!(
            self.inner.shared.is_loop_thread(),
            "event loop must run on the thread that created it"
        );
        let (root, root_cancel) = ctx.with_cancel();

        let poller = Rc::new(Poller::new()?);
        *self.inner.poller.borrow_mut() = Some(poller.clone());
        *self.inner.shared.waker.lock() = Some(poller.waker());

        let outcome = {
            let _guard = EnterGuard::enter(self.inner.clone());
            trace!("event loop running");

            let main_task = task::spawn(&root, main);
            {
                let root_cancel = root_cancel.clone();
                main_task.on_done(move |res| {
                    if let Err(err) = res {
                        root_cancel.cancel_with(err.clone());
                    }
                });
            }

            let outcome = self.run_loop(&root, &main_task, &poller);
            self.teardown(root.cause().unwrap_or(Error::Cancelled));
            outcome
        };

        *self.inner.shared.waker.lock() = None;
        *self.inner.poller.borrow_mut() = None;
        trace!("event loop stopped");

        outcome?;
        match root.cause() {
            None => Ok(()),
            Some(cause) => Err(cause),
        }
    }

    fn run_loop(
        &self,
        root: &Context,
        main: &Task<()>,
        poller: &Rc<Poller>,
    ) -> Result<(), Error> {
        while !root.is_cancelled() {
            self.drain_inbox();
            self.fire_due(root);

            // Settle the drained marker; that counts as progress.
            if self.inner.drained.borrow().is_some() && self.inner.callbacks.borrow().is_empty() {
                if let Some(drained) = self.inner.drained.borrow_mut().take() {
                    drained.complete(Ok(()));
                }
                continue;
            }

            if root.is_cancelled() {
                break;
            }
            if main.is_done() && self.inner.callbacks.borrow().is_empty() {
                break;
            }

            let now = Instant::now();
            let mut timeout = HARD_CAP;
            if let Some(next) = self.inner.callbacks.borrow().until_first(now) {
                timeout = timeout.min(next);
            }
            if let Some(deadline) = root.deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
            poller.wait(timeout)?;
        }
        Ok(())
    }

    fn drain_inbox(&self) {
        let now = Instant::now();
        while let Some(f) = self.inner.inbox.try_recv() {
            self.inner.callbacks.borrow_mut().push(now, f);
        }
    }

    /// Run every due callback to completion, oldest fire time first. Heads
    /// cancelled by handle are dropped without running regardless of
    /// due-ness, so a heap of dead timers cannot keep the loop alive.
    /// Entries are moved out of the borrow before running or dropping them:
    /// both can re-enter the queue.
    fn fire_due(&self, root: &Context) {
        while !root.is_cancelled() {
            let (entry, _purged) = {
                let mut callbacks = self.inner.callbacks.borrow_mut();
                let mut purged = Vec::new();
                while callbacks.head_cancelled() {
                    purged.extend(callbacks.pop());
                }
                let entry = if callbacks.due(Instant::now()) {
                    callbacks.pop()
                } else {
                    None
                };
                (entry, purged)
            };
            match entry {
                Some(entry) if !entry.cancelled() => entry.run(),
                Some(_) => {}
                None => return,
            }
        }
    }

    fn teardown(&self, cause: Error) {
        let live: Vec<Rc<TaskCore>> = self
            .inner
            .tasks
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for core in live {
            if let Some(result) = core.result_any() {
                result.cancel_any(Some(cause.clone()));
            }
            core.dispose();
        }
        self.inner.tasks.borrow_mut().clear();
        self.inner.task_stack.borrow_mut().clear();
        self.inner.foreign.borrow_mut().clear();

        let purged = self.inner.callbacks.borrow_mut().take_all();
        drop(purged);
        while self.inner.inbox.try_recv().is_some() {}
        if let Some(drained) = self.inner.drained.borrow_mut().take() {
            drained.complete(Ok(()));
        }
    }

    // ---------------- task registry ----------------

    pub(crate) fn next_task_id(&self) -> u64 {
        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);
        id
    }

    pub(crate) fn register_task(&self, core: &Rc<TaskCore>) {
        self.inner
            .tasks
            .borrow_mut()
            .insert(core.id(), Rc::downgrade(core));
    }

    pub(crate) fn unregister_task(&self, id: u64) {
        self.inner.tasks.borrow_mut().remove(&id);
    }

    /// Schedule a step for the task unless one is already queued.
    pub(crate) fn wake_task(&self, id: u64) {
        let Some(core) = self.inner.tasks.borrow().get(&id).and_then(Weak::upgrade) else {
            return;
        };
        if core.set_queued() {
            return;
        }
        self.run_callback(move || task::step(&EventLoop::current(), core));
    }

    pub(crate) fn push_task(&self, core: Rc<TaskCore>) {
        self.inner.task_stack.borrow_mut().push(core);
    }

    pub(crate) fn pop_task(&self, core: &Rc<TaskCore>) {
        let top = self
            .inner
            .task_stack
            .borrow_mut()
            .pop()
            .expect("current task stack underflow");
        assert!(
            Rc::ptr_eq(&top, core),
            "context switched from unexpected task"
        );
    }

    pub(crate) fn current_task(&self) -> Option<Rc<TaskCore>> {
        self.inner.task_stack.borrow().last().cloned()
    }

    pub(crate) fn remove_callback(&self, state: &Arc<CallbackState>) -> bool {
        let removed = self.inner.callbacks.borrow_mut().remove(state);
        removed.is_some()
    }

    // ---------------- worker-thread results ----------------

    pub(crate) fn register_foreign(&self, finish: ForeignFinish) -> u64 {
        let key = self.inner.next_foreign.get();
        self.inner.next_foreign.set(key + 1);
        self.inner.foreign.borrow_mut().insert(key, finish);
        key
    }

    pub(crate) fn finish_foreign(&self, key: u64, payload: AnyBox) {
        let finish = self.inner.foreign.borrow_mut().remove(&key);
        if let Some(finish) = finish {
            finish(payload);
        }
    }

    pub(crate) fn unregister_foreign(&self, key: u64) {
        self.inner.foreign.borrow_mut().remove(&key);
    }

    // ---------------- streams ----------------

    /// Register an existing file descriptor and wrap it in an
    /// [`AsyncStream`]. The descriptor is switched to non-blocking mode.
    pub fn new_stream(&self, fd: RawFd) -> Result<AsyncStream, Error> {
        Ok(AsyncStream::new(Poller::open(&self.poller()?, fd)?))
    }

    /// A non-blocking pipe as a (read, write) stream pair.
    pub fn pipe(&self) -> Result<(AsyncStream, AsyncStream), Error> {
        let (r, w) = Poller::pipe(&self.poller()?)?;
        Ok((AsyncStream::new(r), AsyncStream::new(w)))
    }

    /// Establish a connection (only `"tcp"` is supported) and wrap it.
    /// Honours `ctx` cancellation while waiting for the connect to finish.
    pub async fn dial(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
    ) -> Result<AsyncStream, Error> {
        let poller = self.poller()?;
        Ok(AsyncStream::new(
            Poller::dial(&poller, ctx, network, address).await?,
        ))
    }

    fn poller(&self) -> Result<Rc<Poller>, Error> {
        self.inner
            .poller
            .borrow()
            .clone()
            .ok_or_else(|| Error::msg("event loop is not running"))
    }
}
