use spool::{sleep, spawn, Context, Error, EventLoop};
use std::time::{Duration, Instant};

#[test]
fn sleep_basic() {
    let lp = EventLoop::new();
    let start = Instant::now();
    lp.run(&Context::background(), |ctx| async move {
        sleep(&ctx, Duration::from_millis(50)).await
    })
    .unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(50),
        "sleep should wait at least the requested duration"
    );
}

#[test]
fn sleep_zero_duration() {
    let lp = EventLoop::new();
    let start = Instant::now();
    lp.run(&Context::background(), |ctx| async move {
        sleep(&ctx, Duration::ZERO).await
    })
    .unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "zero sleep should complete promptly"
    );
}

#[test]
fn sleep_honours_the_context_deadline() {
    let lp = EventLoop::new();
    let start = Instant::now();
    let result = lp.run(&Context::background(), |ctx| async move {
        let (timed, _cancel) = ctx.with_timeout(Duration::from_millis(20));
        match sleep(&timed, Duration::from_secs(10)).await {
            Err(Error::DeadlineExceeded) => Ok(()),
            other => Err(Error::msg(format!("expected deadline error, got {other:?}"))),
        }
    });
    assert!(result.is_ok());
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "deadline must interrupt the sleep with bounded slack"
    );
}

#[test]
fn cancelling_a_sleeping_task_removes_its_timer() {
    let lp = EventLoop::new();
    let start = Instant::now();
    lp.run(&Context::background(), |ctx| async move {
        let task = spawn(&ctx, |ctx| async move {
            sleep(&ctx, Duration::from_secs(10)).await
        });
        sleep(&ctx, Duration::from_millis(10)).await?;
        task.cancel(None);
        match task.wait(&ctx).await {
            Err(Error::Cancelled) => Ok(()),
            other => Err(Error::msg(format!("expected cancellation, got {other:?}"))),
        }
    })
    .unwrap();
    // The 10s callback must be gone from the heap, or the loop would idle
    // until it fires.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn root_context_cancellation_stops_an_idle_loop() {
    let lp = EventLoop::new();
    let ctx = Context::background();
    let (root, cancel) = ctx.with_cancel();

    let start = Instant::now();
    let result = lp.run(&root, move |ctx| async move {
        EventLoop::current().schedule_callback(Duration::from_millis(10), move || {
            cancel.cancel();
        });
        sleep(&ctx, Duration::from_secs(3600)).await
    });
    match result {
        Err(Error::Cancelled) => {}
        other => panic!("unexpected loop result: {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_secs(5));
}
