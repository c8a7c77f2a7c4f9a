// src/promise.rs
use crate::context::Context;
use crate::error::Error;
use crate::task;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as PollCx, Poll};

/// A one-shot result cell. Created pending; completed exactly once with a
/// value or an error; done-callbacks run synchronously at completion, in
/// insertion order. Cloning shares the same cell.
pub struct Promise<T> {
    inner: Rc<RefCell<State<T>>>,
}

struct State<T> {
    result: Option<Result<T, Error>>,
    callbacks: Vec<Box<dyn FnOnce(&Result<T, Error>)>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(State {
                result: None,
                callbacks: Vec::new(),
            })),
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.inner.borrow().result.is_some()
    }

    /// The stored error, if completed with one.
    pub fn err(&self) -> Option<Error> {
        match &self.inner.borrow().result {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Complete the cell. A second call is a silent no-op. Done-callbacks run
    /// before this returns; callbacks registered from inside one fire
    /// immediately on their own (the cell is already done) without
    /// re-entering this dispatch.
    pub fn complete(&self, result: Result<T, Error>) {
        let (snapshot, callbacks) = {
            let mut state = self.inner.borrow_mut();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result.clone());
            (result, std::mem::take(&mut state.callbacks))
        };
        for cb in callbacks {
            cb(&snapshot);
        }
    }

    /// Complete with `cause`, or the canonical [`Error::Cancelled`] if none
    /// was given. No-op on a done cell.
    pub fn cancel(&self, cause: Option<Error>) {
        self.complete(Err(cause.unwrap_or(Error::Cancelled)));
    }

    /// Register a done-callback. Fires synchronously right here if the cell
    /// is already done.
    pub fn on_done(&self, cb: impl FnOnce(&Result<T, Error>) + 'static) {
        let snapshot = {
            let mut state = self.inner.borrow_mut();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(cb));
                    return;
                }
            }
        };
        cb(&snapshot);
    }

    /// A clone of the stored result, if done.
    pub fn peek(&self) -> Option<Result<T, Error>> {
        self.inner.borrow().result.clone()
    }

    /// The stored result, or [`Error::Pending`] if the cell has not
    /// completed.
    pub fn result(&self) -> Result<T, Error> {
        self.peek().unwrap_or(Err(Error::Pending))
    }

    /// Mirror this cell into a new one that shields the source from
    /// cancellation: the source's outcome flows forward, a successful result
    /// set on the mirror flows back, and cancelling the mirror (with any
    /// cause) leaves the source untouched.
    pub fn shield(&self) -> Promise<T> {
        if self.is_done() {
            return self.clone();
        }
        let out = Promise::new();
        {
            let out = out.clone();
            self.on_done(move |res| out.complete(res.clone()));
        }
        {
            let src = self.clone();
            out.on_done(move |res| {
                if res.is_ok() {
                    src.complete(res.clone());
                }
            });
        }
        out
    }

    /// Await completion under `ctx`. If `ctx` is cancelled first, the
    /// promise is cancelled with the context cause and that cause is
    /// returned; cancellation never flows the other way.
    pub fn wait(&self, ctx: &Context) -> Wait<T> {
        Wait {
            promise: self.clone(),
            ctx: ctx.clone(),
            armed: false,
        }
    }

    /// `wait` that panics on error. Test and example sugar.
    pub async fn expect_wait(&self, ctx: &Context) -> T {
        match self.wait(ctx).await {
            Ok(v) => v,
            Err(e) => panic!("promise failed: {e}"),
        }
    }
}

/// Future returned by [`Promise::wait`].
pub struct Wait<T> {
    promise: Promise<T>,
    ctx: Context,
    armed: bool,
}

impl<T: Clone + 'static> Future for Wait<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollCx<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // Cancellation is checked before the result, including on resumption:
        // a context cancelled in the interim wins over a completed value.
        if let Some(cause) = this.ctx.cause() {
            this.promise.cancel(Some(cause.clone()));
            return Poll::Ready(Err(cause));
        }
        if let Some(result) = this.promise.peek() {
            return Poll::Ready(result);
        }
        // The task-cancel path cancels whatever its task is awaiting; the
        // step that polled us cleared the slot, so re-register every time.
        task::register_pending(&this.promise);
        if !this.armed {
            this.armed = true;
            let waker = cx.waker().clone();
            this.promise.on_done(move |_| waker.wake());
        }
        this.ctx.register_waker(cx.waker());
        Poll::Pending
    }
}

/// Type-erased view of a completable cell: enough surface for combinators
/// and for a task to cancel whatever it is currently awaiting.
pub trait Completion {
    fn is_done(&self) -> bool;
    fn error(&self) -> Option<Error>;
    /// Cancel with `cause`, or the canonical sentinel if none.
    fn cancel_any(&self, cause: Option<Error>);
    /// Register a callback receiving the completion error (None on success).
    fn on_settled(&self, cb: Box<dyn FnOnce(Option<Error>)>);
}

impl<T: Clone + 'static> Completion for Promise<T> {
    fn is_done(&self) -> bool {
        Promise::is_done(self)
    }

    fn error(&self) -> Option<Error> {
        self.err()
    }

    fn cancel_any(&self, cause: Option<Error>) {
        self.cancel(cause);
    }

    fn on_settled(&self, cb: Box<dyn FnOnce(Option<Error>)>) {
        self.on_done(move |res| cb(res.as_ref().err().cloned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn complete_is_effective_at_most_once() {
        let p: Promise<u32> = Promise::new();
        p.complete(Ok(1));
        p.complete(Ok(2));
        assert!(matches!(p.result(), Ok(1)));
    }

    #[test]
    fn cancel_then_cancel_keeps_first_cause() {
        let p: Promise<()> = Promise::new();
        p.cancel(Some(Error::msg("first")));
        p.cancel(Some(Error::msg("second")));
        match p.err() {
            Some(Error::Msg(m)) => assert_eq!(&*m, "first"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cancel_without_cause_uses_sentinel() {
        let p: Promise<()> = Promise::new();
        p.cancel(None);
        assert!(matches!(p.err(), Some(Error::Cancelled)));
    }

    #[test]
    fn callbacks_fire_in_insertion_order() {
        let p: Promise<u8> = Promise::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            p.on_done(move |_| order.borrow_mut().push(i));
        }
        p.complete(Ok(7));
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn callback_on_done_cell_fires_synchronously() {
        let p: Promise<u8> = Promise::new();
        p.complete(Ok(9));
        let fired = Rc::new(Cell::new(false));
        {
            let fired = fired.clone();
            p.on_done(move |res| {
                assert!(matches!(res, Ok(9)));
                fired.set(true);
            });
        }
        assert!(fired.get());
    }

    #[test]
    fn callback_registered_during_dispatch_fires_immediately() {
        let p: Promise<u8> = Promise::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let p2 = p.clone();
            let order = order.clone();
            let inner_order = order.clone();
            p.on_done(move |_| {
                order.borrow_mut().push("outer");
                p2.on_done(move |_| inner_order.borrow_mut().push("inner"));
            });
        }
        p.complete(Ok(0));
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn result_on_pending_cell_is_the_pending_error() {
        let p: Promise<u8> = Promise::new();
        assert!(matches!(p.result(), Err(Error::Pending)));
    }

    #[test]
    fn shield_forwards_source_outcome() {
        let p: Promise<u8> = Promise::new();
        let shielded = p.shield();
        p.complete(Ok(5));
        assert!(matches!(shielded.result(), Ok(5)));
    }

    #[test]
    fn cancelling_the_shield_spares_the_source() {
        let p: Promise<u8> = Promise::new();
        let shielded = p.shield();
        shielded.cancel(None);
        assert!(matches!(shielded.err(), Some(Error::Cancelled)));
        assert!(!p.is_done());
        // The source still completes on its own and the shield keeps its
        // first-set outcome.
        p.complete(Ok(3));
        assert!(matches!(shielded.err(), Some(Error::Cancelled)));
    }
}
