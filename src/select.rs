// src/select.rs
use crate::context::Context;
use crate::error::Error;
use crate::promise::{Completion, Promise};
use crate::task::{spawn, Coroutine, Task};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Complete on the first completion, success or failure, forwarding
    /// that outcome.
    FirstResult,
    /// Complete on the first error; otherwise when all succeed.
    FirstError,
    /// Complete when all have completed, reporting the last seen error.
    All,
}

/// A promise settled according to `mode` over the given futures. With no
/// futures it completes immediately.
pub fn wait(mode: WaitMode, futs: &[&dyn Completion]) -> Promise<()> {
    let out: Promise<()> = Promise::new();
    let total = futs.len();
    if total == 0 {
        out.complete(Ok(()));
        return out;
    }

    let done = Rc::new(Cell::new(0usize));
    let last_err: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));

    for fut in futs {
        let out = out.clone();
        let done = done.clone();
        let last_err = last_err.clone();
        fut.on_settled(Box::new(move |err| {
            done.set(done.get() + 1);
            match err {
                Some(err) => {
                    *last_err.borrow_mut() = Some(err.clone());
                    if mode != WaitMode::All || done.get() >= total {
                        out.complete(Err(err));
                    }
                }
                None => {
                    if done.get() >= total || mode == WaitMode::FirstResult {
                        let err = last_err.borrow().clone();
                        out.complete(match err {
                            Some(err) => Err(err),
                            None => Ok(()),
                        });
                    }
                }
            }
        }));
    }
    out
}

/// Race `coros` under a shared sub-context: the first success wins and every
/// other task is cancelled before this returns. If none succeed, the last
/// error is returned.
pub async fn get_first_result<T>(ctx: &Context, coros: Vec<Coroutine<T>>) -> Result<T, Error>
where
    T: Clone + 'static,
{
    if coros.is_empty() {
        return Err(Error::msg("no coroutines to race"));
    }

    let (race_ctx, cancel) = ctx.with_cancel();
    let wait_fut: Promise<T> = Promise::new();
    let tasks: Rc<RefCell<Vec<Task<T>>>> = Rc::new(RefCell::new(Vec::new()));

    {
        let tasks = tasks.clone();
        wait_fut.on_done(move |_| {
            // No new work under the race context, and every started task is
            // signalled before the await below resumes.
            cancel.cancel();
            for task in tasks.borrow().iter() {
                task.cancel(None);
            }
        });
    }

    let total = coros.len();
    let done = Rc::new(Cell::new(0usize));
    for coro in coros {
        let task = spawn(&race_ctx, coro);
        {
            let wait_fut = wait_fut.clone();
            let done = done.clone();
            task.on_done(move |res| {
                done.set(done.get() + 1);
                match res {
                    Ok(v) => wait_fut.complete(Ok(v.clone())),
                    Err(err) => {
                        if done.get() >= total {
                            wait_fut.cancel(Some(err.clone()));
                        }
                    }
                }
            });
        }
        tasks.borrow_mut().push(task);
    }

    wait_fut.wait(ctx).await
}
