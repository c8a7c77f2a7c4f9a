use spool::{
    coroutine, get_first_result, sleep, spawn, wait, Completion, Context, Error, EventLoop,
    WaitMode,
};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn get_first_result_returns_the_first_success_and_cancels_the_rest() {
    let lp = EventLoop::new();
    let b_completed = Rc::new(Cell::new(false));

    let b_completed2 = b_completed.clone();
    lp.run(&Context::background(), move |ctx| async move {
        let b_flag = b_completed2.clone();
        let result = get_first_result(
            &ctx,
            vec![
                coroutine(|ctx| async move {
                    sleep(&ctx, Duration::from_millis(10)).await?;
                    Ok("a")
                }),
                coroutine(move |ctx| async move {
                    sleep(&ctx, Duration::from_millis(20)).await?;
                    b_flag.set(true);
                    Ok("b")
                }),
                coroutine(|_ctx| async move { Err(Error::msg("c failed fast")) }),
            ],
        )
        .await?;
        assert_eq!(result, "a");
        Ok(())
    })
    .unwrap();

    // B was cancelled at ~10ms, well before its 20ms sleep finished.
    assert!(!b_completed.get());
}

#[test]
fn get_first_result_reports_the_last_error_when_none_succeed() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let outcome: Result<u32, Error> = get_first_result(
            &ctx,
            vec![
                coroutine(|_ctx| async move { Err(Error::msg("first")) }),
                coroutine(|ctx| async move {
                    sleep(&ctx, Duration::from_millis(5)).await?;
                    Err(Error::msg("second"))
                }),
            ],
        )
        .await;
        match outcome {
            Err(Error::Msg(m)) => assert_eq!(&*m, "second"),
            other => return Err(Error::msg(format!("unexpected outcome: {other:?}"))),
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn wait_all_over_tasks_completes_when_every_task_settles() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let quick = spawn(&ctx, |ctx| async move {
            sleep(&ctx, Duration::from_millis(5)).await?;
            Ok(1u32)
        });
        let slow = spawn(&ctx, |ctx| async move {
            sleep(&ctx, Duration::from_millis(15)).await?;
            Ok(2u32)
        });
        let joined = wait(WaitMode::All, &[&quick, &slow]);
        joined.wait(&ctx).await?;
        assert!(matches!(quick.result(), Ok(1)));
        assert!(matches!(slow.result(), Ok(2)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn wait_first_error_fires_before_the_others_finish() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let slow = spawn(&ctx, |ctx| async move {
            sleep(&ctx, Duration::from_millis(200)).await?;
            Ok(())
        });
        let failing: spool::Task<()> = spawn(&ctx, |_ctx| async move { Err(Error::msg("bad")) });
        let joined = wait(WaitMode::FirstError, &[&slow, &failing]);
        match joined.wait(&ctx).await {
            Err(Error::Msg(m)) => assert_eq!(&*m, "bad"),
            other => return Err(Error::msg(format!("unexpected outcome: {other:?}"))),
        }
        assert!(!Completion::is_done(&slow));
        slow.cancel(None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn wait_first_result_forwards_the_first_completion() {
    let lp = EventLoop::new();
    lp.run(&Context::background(), |ctx| async move {
        let first = spawn(&ctx, |_ctx| async move { Ok(10u32) });
        let slow = spawn(&ctx, |ctx| async move {
            sleep(&ctx, Duration::from_millis(100)).await?;
            Ok(20u32)
        });
        let joined = wait(WaitMode::FirstResult, &[&first, &slow]);
        joined.wait(&ctx).await?;
        assert!(matches!(first.result(), Ok(10)));
        slow.cancel(None);
        Ok(())
    })
    .unwrap();
}
