// src/thread.rs
use crate::context::Context;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::promise::Promise;
use std::any::Any;
use std::thread;

/// Type-erased payload carried from a worker thread back to a typed promise
/// on the loop thread.
pub(crate) type AnyBox = Box<dyn Any + Send>;

/// Run blocking `f` on a background OS thread and settle the returned
/// promise on the loop thread through the threadsafe callback path.
///
/// The worker thread has no running loop, so code in `f` cannot schedule
/// onto the loop except through a [`LoopHandle`](crate::LoopHandle); it can
/// still observe `ctx` cancellation.
pub fn spawn_blocking<T, F>(ctx: &Context, f: F) -> Promise<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(&Context) -> Result<T, Error> + Send + 'static,
{
    let lp = EventLoop::current();
    let fut: Promise<T> = Promise::new();

    // The typed completion stays on the loop thread; the worker only ships
    // an opaque payload and a key.
    let key = {
        let fut = fut.clone();
        lp.register_foreign(Box::new(move |payload: AnyBox| {
            if let Ok(result) = payload.downcast::<Result<T, Error>>() {
                fut.complete(*result);
            }
        }))
    };
    {
        let lp = lp.clone();
        fut.on_done(move |_| lp.unregister_foreign(key));
    }

    let handle = lp.handle();
    let worker_ctx = ctx.clone();
    thread::spawn(move || {
        let result = f(&worker_ctx);
        handle.run_callback_threadsafe(move || {
            if let Some(lp) = EventLoop::try_current() {
                lp.finish_foreign(key, Box::new(result));
            }
        });
    });

    fut
}
