use spool::{spawn, yield_now, Context, Error, EventLoop};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn clean_run_returns_ok() {
    let lp = EventLoop::new();
    let result = lp.run(&Context::background(), |_ctx| async { Ok(()) });
    assert!(result.is_ok());
}

#[test]
fn main_error_is_the_loop_result() {
    let lp = EventLoop::new();
    let result = lp.run(&Context::background(), |_ctx| async {
        Err(Error::msg("boom"))
    });
    match result {
        Err(Error::Msg(m)) => assert_eq!(&*m, "boom"),
        other => panic!("unexpected loop result: {other:?}"),
    }
}

#[test]
fn spawned_coroutine_is_deferred_until_the_next_iteration() {
    let lp = EventLoop::new();
    let ran = Rc::new(Cell::new(false));
    let observed_before_yield = Rc::new(Cell::new(true));

    let ran2 = ran.clone();
    let observed = observed_before_yield.clone();
    lp.run(&Context::background(), move |ctx| async move {
        let body_ran = ran2.clone();
        let task = spawn(&ctx, move |_ctx| async move {
            body_ran.set(true);
            Ok(())
        });
        // The coroutine body must not have run yet.
        observed.set(ran2.get());
        task.wait(&ctx).await?;
        Ok(())
    })
    .unwrap();

    assert!(!observed_before_yield.get());
    assert!(ran.get());
}

#[test]
fn zero_delay_callbacks_fire_in_insertion_order() {
    let lp = EventLoop::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let order2 = order.clone();
    lp.run(&Context::background(), move |_ctx| async move {
        let lp = EventLoop::current();
        for i in 0..3 {
            let order = order2.clone();
            lp.run_callback(move || order.borrow_mut().push(i));
        }
        // One yield puts this task behind the three callbacks.
        yield_now().await;
        assert_eq!(*order2.borrow(), vec![0, 1, 2]);
        Ok(())
    })
    .unwrap();

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn wait_for_callbacks_settles_once_the_heap_drains() {
    let lp = EventLoop::new();
    let fired = Rc::new(Cell::new(false));

    let fired2 = fired.clone();
    lp.run(&Context::background(), move |ctx| async move {
        let lp = EventLoop::current();
        let fired = fired2.clone();
        lp.schedule_callback(std::time::Duration::from_millis(10), move || {
            fired.set(true)
        });
        let drained = lp.wait_for_callbacks();
        drained.wait(&ctx).await?;
        assert!(fired2.get());
        Ok(())
    })
    .unwrap();

    assert!(fired.get());
}

#[test]
fn tasks_left_running_at_exit_are_cancelled() {
    let lp = EventLoop::new();
    let leaked = Rc::new(RefCell::new(None));

    let leaked2 = leaked.clone();
    lp.run(&Context::background(), move |ctx| async move {
        // Suspends on a promise nobody completes; the loop settles it at
        // teardown.
        let task = spawn(&ctx, |ctx| async move {
            let forever: spool::Promise<()> = spool::Promise::new();
            forever.wait(&ctx).await
        });
        *leaked2.borrow_mut() = Some(task);
        Ok(())
    })
    .unwrap();

    let task = leaked.borrow_mut().take().expect("task handle was stored");
    assert!(task.is_done());
    assert!(matches!(task.err(), Some(Error::Cancelled)));
}
