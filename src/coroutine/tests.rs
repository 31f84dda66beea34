use super::*;
use crate::{future::Deferred, util::trace_init};
use parking_lot::Mutex as Log;

#[test]
fn waits_for_a_chained_value() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let input = Deferred::<u32>::new();
    let doubled = {
        let input = input.clone();
        scheduler
            .spawn(move |cx| async move {
                let n = cx.value(&input).await?;
                Ok(n * 2)
            })
            .unwrap()
    };

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 1);
    assert!(!doubled.core().is_scheduled(), "suspended on its input");
    assert_eq!(doubled.status(), Status::Pending);

    input.fulfill(21).unwrap();
    assert!(doubled.core().is_scheduled(), "woken by its input");
    assert_eq!(scheduler.block_on(&doubled).unwrap(), 42);
    assert_eq!(doubled.take(), Ok(42));
}

#[test]
fn chained_errors_are_reraised_and_handled() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let input = Deferred::<()>::new();
    let caught = {
        let input = input.clone();
        scheduler
            .spawn(move |cx| async move {
                match cx.wait(&input).await {
                    Ok(()) => Ok(String::from("no error")),
                    Err(error) => Ok(error.to_string()),
                }
            })
            .unwrap()
    };
    scheduler.tick();

    input.fail(Error::msg("broken pipe")).unwrap();
    assert_eq!(scheduler.block_on(&caught).unwrap(), "broken pipe");
    assert_eq!(input.status(), Status::Handled);
    assert_eq!(input.error().unwrap().to_string(), "broken pipe");
}

#[test]
fn unhandled_errors_fail_the_coroutine() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let input = Deferred::<()>::failed(Error::msg("nope"));
    let fiber = {
        let input = input.clone();
        scheduler
            .spawn(move |cx| async move {
                cx.wait(&input).await?;
                Ok(())
            })
            .unwrap()
    };

    let err = scheduler.block_on(&fiber).unwrap_err();
    assert_eq!(err.to_string(), "nope");
    assert_eq!(fiber.status(), Status::Throw);
    assert_eq!(input.status(), Status::Handled);
}

#[test]
fn cancelling_propagates_down_the_chain() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let leaf = Deferred::<()>::cancellable();
    let inner = {
        let leaf = leaf.clone();
        scheduler
            .spawn(move |cx| async move {
                cx.wait(&leaf).await?;
                Ok(())
            })
            .unwrap()
    };
    let outer = {
        let inner = inner.clone();
        scheduler
            .spawn(move |cx| async move {
                cx.wait(&inner).await?;
                Ok(())
            })
            .unwrap()
    };
    scheduler.tick();
    assert!(!outer.core().is_scheduled());
    assert!(!inner.core().is_scheduled());

    outer.cancel().unwrap();
    let err = scheduler.block_on(&outer).unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(leaf.error().unwrap().is_cancelled());
    assert_eq!(leaf.status(), Status::Throw);

    scheduler.wait(&*inner).unwrap_err();
    assert!(inner.error().unwrap().is_cancelled());
}

#[test]
fn non_cancellable_chains_are_detached() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let leaf = Deferred::<()>::new();
    let fiber = {
        let leaf = leaf.clone();
        scheduler
            .spawn(move |cx| async move {
                cx.wait(&leaf).await?;
                Ok(())
            })
            .unwrap()
    };
    scheduler.tick();

    fiber.cancel().unwrap();
    assert!(scheduler.block_on(&fiber).unwrap_err().is_cancelled());
    assert_eq!(leaf.status(), Status::Pending);

    // The leaf completing later does not touch the cancelled coroutine.
    leaf.fulfill(()).unwrap();
    assert_eq!(fiber.status(), Status::Throw);
    assert_eq!(scheduler.tick().polled, 0);
}

#[test]
fn cancelling_a_complete_coroutine_does_nothing() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let fiber = scheduler.spawn(|_| async { Ok(1) }).unwrap();
    assert_eq!(scheduler.block_on(&fiber).unwrap(), 1);
    fiber.cancel().unwrap();
    assert_eq!(fiber.status(), Status::Fulfilled);
    assert_eq!(
        fiber.resume(),
        Err(Fault::ResumedTerminal(Status::Fulfilled))
    );
}

#[test]
fn yielding_interleaves_fibers() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let log = Arc::new(Log::new(Vec::new()));
    let spawn = |name: &'static str| {
        let log = log.clone();
        scheduler
            .spawn(move |cx| async move {
                log.lock().push(format!("{name}1"));
                cx.yield_now().await?;
                log.lock().push(format!("{name}2"));
                Ok(())
            })
            .unwrap()
    };
    let a = spawn("a");
    let b = spawn("b");

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 4);
    assert_eq!(tick.completed, 2);
    assert!(a.is_complete() && b.is_complete());
    assert_eq!(*log.lock(), ["a1", "b1", "a2", "b2"]);
}

#[test]
fn sleeping_does_not_resume_early() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let started = Instant::now();
    let sleeper = scheduler
        .spawn(|cx| async move {
            cx.sleep(Duration::from_millis(30)).await?;
            Ok(Instant::now())
        })
        .unwrap();
    let woke = scheduler.block_on(&sleeper).unwrap();
    assert!(woke - started >= Duration::from_millis(30));
}

#[test]
fn cancelling_wakes_a_sleeper() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let sleeper = scheduler
        .spawn(|cx| async move {
            cx.sleep(Duration::from_secs(60)).await?;
            Ok(())
        })
        .unwrap();
    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 1);
    assert!(sleeper.core().wakeup_time().is_some());

    let started = Instant::now();
    sleeper.cancel().unwrap();
    assert!(scheduler.block_on(&sleeper).unwrap_err().is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[test]
fn sleeping_past_the_last_instant_waits_for_cancellation() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let sleeper = scheduler
        .spawn(|cx| async move {
            cx.sleep(Duration::MAX).await?;
            Ok(())
        })
        .unwrap();
    assert_eq!(scheduler.tick().polled, 1);
    assert_eq!(sleeper.status(), Status::Pending);
    assert_eq!(sleeper.core().wakeup_time(), None);
    assert_eq!(scheduler.tick().polled, 0, "the sleeper must stay suspended");

    sleeper.cancel().unwrap();
    assert!(scheduler.block_on(&sleeper).unwrap_err().is_cancelled());
}

#[test]
fn the_context_knows_its_fiber() {
    let _trace = trace_init();
    let scheduler = Scheduler::builder().name("cx").build();
    let fiber = scheduler
        .spawn(|cx| async move {
            let scheduler = cx.scheduler().expect("scheduler is alive");
            let me = cx.fiber().expect("fiber is alive");
            Ok((scheduler.name().map(String::from), me.status()))
        })
        .unwrap();
    assert_eq!(
        scheduler.block_on(&fiber).unwrap(),
        (Some(String::from("cx")), Status::Pending)
    );
}

/// Fails over to a backup when the primary fails.
struct Failover {
    primary: Arc<Deferred<i32>>,
    backup: Arc<Deferred<i32>>,
}

impl Routine for Failover {
    type Output = i32;

    fn resume(&mut self, frame: &mut Frame) -> Result<Step<i32>, Error> {
        loop {
            match frame.pc {
                0 => {
                    frame.pc = 1;
                    frame.epc = 1;
                    if frame.chain(&self.primary) {
                        return Ok(Step::Pending);
                    }
                }
                1 => match frame.check_exception() {
                    Ok(()) => return Ok(Step::Done(self.primary.value()?)),
                    Err(_) if frame.epc & 1 != 0 => {
                        frame.epc = 0;
                        frame.pc = 2;
                        if frame.chain(&self.backup) {
                            return Ok(Step::Pending);
                        }
                    }
                    Err(error) => return Err(error),
                },
                _ => {
                    frame.check_exception()?;
                    return Ok(Step::Done(self.backup.value()?));
                }
            }
        }
    }
}

#[test]
fn routines_handle_errors_in_regions() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let primary = Deferred::new();
    let backup = Deferred::new();
    let fiber = Coroutine::spawn(&scheduler, |_| Failover {
        primary: primary.clone(),
        backup: backup.clone(),
    })
    .unwrap();
    scheduler.tick();
    assert_eq!(
        fiber.body.lock().frame.chained().map(|f| Arc::as_ptr(&f) as *const ()),
        Some(Arc::as_ptr(&primary) as *const ())
    );

    primary.fail(Error::msg("primary down")).unwrap();
    scheduler.tick();
    assert_eq!(fiber.status(), Status::Pending);
    assert_eq!(primary.status(), Status::Handled);

    backup.fulfill(7).unwrap();
    assert_eq!(scheduler.block_on(&fiber).unwrap(), 7);
}

#[test]
fn wakers_reschedule_the_coroutine() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let stash = Arc::new(Log::new(None::<Waker>));
    let polled = Arc::new(Log::new(0));

    struct Stash {
        stash: Arc<Log<Option<Waker>>>,
        polled: Arc<Log<usize>>,
    }

    impl Future for Stash {
        type Output = Result<(), Error>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let mut polled = self.polled.lock();
            *polled += 1;
            if *polled > 1 {
                return Poll::Ready(Ok(()));
            }
            *self.stash.lock() = Some(cx.waker().clone());
            Poll::Pending
        }
    }

    let fiber = Coroutine::spawn(&scheduler, |_| {
        AsyncRoutine::new(Stash {
            stash: stash.clone(),
            polled: polled.clone(),
        })
    })
    .unwrap();
    scheduler.tick();
    assert!(!fiber.core().is_scheduled());

    stash.lock().take().expect("waker stashed").wake();
    assert!(fiber.core().is_scheduled());
    scheduler.wait(&*fiber).unwrap();
    assert_eq!(*polled.lock(), 2);
}
