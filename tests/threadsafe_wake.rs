use spool::{spawn_blocking, Context, Error, EventLoop, Promise};
use std::thread;
use std::time::{Duration, Instant};

thread_local! {
    // Loop-thread mailbox: the shipped closure stays Send, the promise never
    // leaves the loop thread.
    static WOKEN: std::cell::RefCell<Option<Promise<()>>> =
        const { std::cell::RefCell::new(None) };
}

#[test]
fn a_threadsafe_callback_interrupts_an_idle_poller() {
    let lp = EventLoop::new();
    let handle = lp.handle();

    let start = Instant::now();
    lp.run(&Context::background(), move |ctx| async move {
        let woken: Promise<()> = Promise::new();
        WOKEN.with(|slot| *slot.borrow_mut() = Some(woken.clone()));
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.run_callback_threadsafe(|| {
                WOKEN.with(|slot| {
                    if let Some(woken) = slot.borrow_mut().take() {
                        woken.complete(Ok(()));
                    }
                });
            });
        });
        // The loop has nothing scheduled, so without the wake-up it would sit
        // in the poller for the full hard cap.
        woken.wait(&ctx).await
    })
    .unwrap();

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(
        elapsed < Duration::from_secs(5),
        "cross-thread callback took {elapsed:?}, poller was not woken"
    );
}

#[test]
fn spawn_blocking_round_trip() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let fut = spawn_blocking(&ctx, |_ctx| {
            thread::sleep(Duration::from_millis(20));
            Ok(42u32)
        });
        let value = fut.wait(&ctx).await?;
        assert_eq!(value, 42);
        Ok(())
    })
    .unwrap();
}

#[test]
fn spawn_blocking_worker_has_no_running_loop() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let fut = spawn_blocking(&ctx, |_ctx| Ok(EventLoop::try_current().is_none()));
        let stripped = fut.wait(&ctx).await?;
        assert!(stripped, "worker thread must not see a running loop");
        Ok(())
    })
    .unwrap();
}

#[test]
fn spawn_blocking_propagates_worker_errors() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let fut: Promise<u32> = spawn_blocking(&ctx, |_ctx| Err(Error::msg("worker failed")));
        match fut.wait(&ctx).await {
            Err(Error::Msg(m)) => assert_eq!(&*m, "worker failed"),
            other => return Err(Error::msg(format!("unexpected outcome: {other:?}"))),
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn worker_observes_context_cancellation() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let (worker_ctx, cancel) = ctx.with_cancel();
        let fut = spawn_blocking(&worker_ctx, |ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok("saw the cancel")
        });
        EventLoop::current().schedule_callback(Duration::from_millis(20), move || cancel.cancel());
        let out = fut.wait(&ctx).await?;
        assert_eq!(out, "saw the cancel");
        Ok(())
    })
    .unwrap();
}
