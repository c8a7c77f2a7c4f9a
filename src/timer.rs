// src/timer.rs
use crate::context::Context;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::promise::Promise;
use std::time::Duration;

/// Suspend for `duration` on the running loop's callback heap. If the await
/// is cancelled (context cancellation or deadline), the scheduled callback
/// is removed from the heap; cancelling after it fired is harmless.
pub async fn sleep(ctx: &Context, duration: Duration) -> Result<(), Error> {
    let lp = EventLoop::current();
    let fut: Promise<()> = Promise::new();
    let handle = {
        let fut = fut.clone();
        lp.schedule_callback(duration, move || fut.complete(Ok(())))
    };
    fut.on_done(move |_| {
        handle.cancel();
    });
    fut.wait(ctx).await
}
