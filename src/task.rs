// src/task.rs
use crate::context::Context;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopShared};
use crate::promise::{Completion, Promise, Wait};
use futures::future::LocalBoxFuture;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context as PollCx, Poll, Wake, Waker};

/// Loop-side state of a spawned task, shared between the loop registry, the
/// waker, and the handle.
pub(crate) struct TaskCore {
    id: u64,
    // The coroutine. Taken out for the duration of a poll; None once done.
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    // The future this task is currently suspended on, if any.
    pending: RefCell<Option<Rc<dyn Completion>>>,
    // Type-erased result promise, for end-of-run teardown.
    result: RefCell<Option<Rc<dyn Completion>>>,
    // Wake de-duplication: at most one step callback in flight.
    queued: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl TaskCore {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn waker(&self, lp: &EventLoop) -> Waker {
        self.waker
            .borrow_mut()
            .get_or_insert_with(|| {
                Waker::from(Arc::new(TaskWaker {
                    id: self.id,
                    shared: lp.shared(),
                }))
            })
            .clone()
    }

    #[inline]
    pub(crate) fn set_queued(&self) -> bool {
        self.queued.replace(true)
    }

    pub(crate) fn result_any(&self) -> Option<Rc<dyn Completion>> {
        self.result.borrow().clone()
    }

    /// Cancel whatever the task is awaiting and drop the coroutine so it can
    /// never run again. Used on the not-yet-started and teardown paths.
    pub(crate) fn dispose(&self) {
        self.future.borrow_mut().take();
        if let Some(pending) = self.pending.borrow_mut().take() {
            pending.cancel_any(None);
        }
    }
}

/// Wakes a task by scheduling a zero-delay step callback. Safe from any
/// thread: off the loop thread the wake travels through the inbox and the
/// poller wake-up.
struct TaskWaker {
    id: u64,
    shared: Arc<LoopShared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let id = self.id;
        if self.shared.is_loop_thread() {
            if let Some(lp) = EventLoop::try_current() {
                lp.wake_task(id);
            }
            return;
        }
        self.shared.post(Box::new(move || {
            if let Some(lp) = EventLoop::try_current() {
                lp.wake_task(id);
            }
        }));
    }
}

/// A spawned coroutine plus its result promise. The handle mirrors the
/// promise surface; dropping it does not affect the running task.
pub struct Task<T> {
    result: Promise<T>,
    core: Rc<TaskCore>,
    ctx: Context,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            core: self.core.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

/// Spawn `coro` onto the running loop under a cancellable child of `ctx`.
///
/// The coroutine does not run before `spawn` returns: the first step is a
/// zero-delay callback, so the caller can attach done-callbacks first.
/// Cancelling the returned task (or its context) completes the result
/// promise with the cause and cancels whatever future the task is awaiting.
pub fn spawn<T, F, Fut>(ctx: &Context, coro: F) -> Task<T>
where
    T: Clone + 'static,
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, Error>> + 'static,
{
    let lp = EventLoop::current();
    let (task_ctx, cancel) = ctx.with_cancel();
    let result: Promise<T> = Promise::new();

    let core = Rc::new(TaskCore {
        id: lp.next_task_id(),
        future: RefCell::new(None),
        pending: RefCell::new(None),
        result: RefCell::new(Some(Rc::new(result.clone()))),
        queued: Cell::new(false),
        waker: RefCell::new(None),
    });

    let fut = coro(task_ctx.clone());
    {
        let result = result.clone();
        *core.future.borrow_mut() = Some(Box::pin(async move {
            result.complete(fut.await);
        }));
    }

    // Completion of the result promise, however it happens, cancels the
    // pending future and signals the task's sub-context.
    {
        let core = core.clone();
        result.on_done(move |res| {
            if let Some(pending) = core.pending.borrow_mut().take() {
                pending.cancel_any(None);
            }
            cancel.cancel_with(res.as_ref().err().cloned().unwrap_or(Error::Cancelled));
        });
    }

    lp.register_task(&core);

    // Deferred first step: the coroutine must not run before spawn returns.
    {
        let core = core.clone();
        let result = result.clone();
        let task_ctx = task_ctx.clone();
        lp.run_callback(move || {
            if result.is_done() {
                core.dispose();
                EventLoop::current().unregister_task(core.id);
                return;
            }
            if let Some(cause) = task_ctx.cause() {
                result.cancel(Some(cause));
                core.dispose();
                EventLoop::current().unregister_task(core.id);
                return;
            }
            step(&EventLoop::current(), core);
        });
    }

    Task {
        result,
        core,
        ctx: task_ctx,
    }
}

/// Advance a task by one suspension: push it onto the current-task stack,
/// poll the coroutine once, verify the stack top is unchanged, pop.
pub(crate) fn step(lp: &EventLoop, core: Rc<TaskCore>) {
    core.queued.set(false);
    let Some(mut fut) = core.future.borrow_mut().take() else {
        return;
    };
    core.pending.borrow_mut().take();

    lp.push_task(core.clone());
    let waker = core.waker(lp);
    let mut cx = PollCx::from_waker(&waker);
    let poll = fut.as_mut().poll(&mut cx);
    lp.pop_task(&core);

    match poll {
        Poll::Pending => {
            *core.future.borrow_mut() = Some(fut);
        }
        Poll::Ready(()) => {
            lp.unregister_task(core.id);
        }
    }
}

/// Record `promise` as the pending future of the task currently being
/// stepped, so cancelling the task cancels the await.
pub(crate) fn register_pending<T: Clone + 'static>(promise: &Promise<T>) {
    if let Some(lp) = EventLoop::try_current() {
        if let Some(core) = lp.current_task() {
            *core.pending.borrow_mut() = Some(Rc::new(promise.clone()));
        }
    }
}

impl<T: Clone + 'static> Task<T> {
    /// The task's result promise.
    #[inline]
    pub fn promise(&self) -> &Promise<T> {
        &self.result
    }

    /// The task's private cancellable context.
    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.result.is_done()
    }

    #[inline]
    pub fn err(&self) -> Option<Error> {
        self.result.err()
    }

    #[inline]
    pub fn result(&self) -> Result<T, Error> {
        self.result.result()
    }

    /// Cancel the task with `cause` (or the canonical sentinel). At its next
    /// scheduled step the coroutine observes the cancellation and exits.
    pub fn cancel(&self, cause: Option<Error>) {
        self.result.cancel(cause);
    }

    pub fn on_done(&self, cb: impl FnOnce(&Result<T, Error>) + 'static) {
        self.result.on_done(cb);
    }

    pub fn wait(&self, ctx: &Context) -> Wait<T> {
        self.result.wait(ctx)
    }
}

impl<T: Clone + 'static> Completion for Task<T> {
    fn is_done(&self) -> bool {
        self.result.is_done()
    }

    fn error(&self) -> Option<Error> {
        self.result.err()
    }

    fn cancel_any(&self, cause: Option<Error>) {
        self.result.cancel(cause);
    }

    fn on_settled(&self, cb: Box<dyn FnOnce(Option<Error>)>) {
        Completion::on_settled(&self.result, cb);
    }
}

/// A boxed coroutine: a function of the task context returning a boxed
/// future. Lets heterogeneous coroutines share one collection, e.g. for
/// [`get_first_result`](crate::get_first_result).
pub type Coroutine<T> = Box<dyn FnOnce(Context) -> LocalBoxFuture<'static, Result<T, Error>>>;

/// Box `f` as a [`Coroutine`].
pub fn coroutine<T, F, Fut>(f: F) -> Coroutine<T>
where
    F: FnOnce(Context) -> Fut + 'static,
    Fut: Future<Output = Result<T, Error>> + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// Yield to the loop once: the current task is rescheduled behind whatever
/// zero-delay callbacks are already queued.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut PollCx<'_>) -> Poll<()> {
        if !self.yielded {
            self.yielded = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        Poll::Ready(())
    }
}
