use super::*;
use crate::{
    future::{Deferred, Until},
    util::trace_init,
};
use std::sync::atomic::AtomicUsize;

#[test]
fn resumes_fibers_in_schedule_order() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for i in 0..4 {
        let order = order.clone();
        scheduler.invoke(move || order.lock().push(i)).unwrap();
    }
    assert_eq!(scheduler.len(), 4);

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 4);
    assert_eq!(tick.completed, 4);
    assert!(!tick.has_remaining);
    assert_eq!(*order.lock(), [0, 1, 2, 3]);
    assert!(scheduler.is_empty());
}

#[test]
fn tick_size_bounds_a_tick() {
    let _trace = trace_init();
    let scheduler = Scheduler::builder().tick_size(2).build();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let ran = ran.clone();
        scheduler
            .invoke(move || ran.fetch_add(1, SeqCst))
            .unwrap();
    }

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 2);
    assert!(tick.has_remaining);
    assert_eq!(ran.load(SeqCst), 2);

    while scheduler.tick().has_remaining {}
    assert_eq!(ran.load(SeqCst), 5);
}

#[test]
fn scheduling_twice_resumes_once() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let proxy = {
        let ran = ran.clone();
        Proxy::from_fn(move || ran.fetch_add(1, SeqCst))
    };
    scheduler.schedule(&proxy).unwrap();
    scheduler.schedule(&proxy).unwrap();
    assert_eq!(scheduler.len(), 1);

    assert_eq!(dbg!(scheduler.tick()).polled, 1);
    assert_eq!(ran.load(SeqCst), 1);

    // Retired fibers may be scheduled again harmlessly.
    scheduler.schedule(&proxy).unwrap();
    assert_eq!(scheduler.tick().polled, 0);
}

#[test]
fn fibers_are_bound_to_one_scheduler() {
    let _trace = trace_init();
    let a = Scheduler::builder().name("a").build();
    let b = Scheduler::builder().name("b").build();
    let proxy = Proxy::from_fn(|| ());
    a.schedule(&proxy).unwrap();
    assert_eq!(b.schedule(&proxy), Err(Fault::ForeignScheduler));
    assert_eq!(a.name(), Some("a"));
}

#[test]
fn full_ring_is_a_fault() {
    let _trace = trace_init();
    let scheduler = Scheduler::builder().capacity(2).build();
    scheduler.invoke(|| ()).unwrap();
    scheduler.invoke(|| ()).unwrap();
    let err = scheduler.invoke(|| ()).unwrap_err();
    assert_eq!(err, Fault::RingFull { capacity: 2 });

    // Retiring frees the slots.
    scheduler.tick();
    assert!(scheduler.invoke(|| ()).is_ok());
}

#[test]
fn completed_fibers_are_retired_without_resuming() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let deferred = Deferred::<()>::new();
    scheduler.schedule(&deferred).unwrap();
    deferred.fail(Error::msg("nobody is listening")).unwrap();

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 0);
    assert_eq!(tick.completed, 1);
    assert_eq!(tick.failed, 1);
}

#[test]
fn handled_fibers_are_retired_quietly() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let deferred = Deferred::<()>::new();
    scheduler.schedule(&deferred).unwrap();
    deferred.fail(Error::msg("handled elsewhere")).unwrap();
    deferred.core().set_status(Status::Handled).unwrap();

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 0);
    assert_eq!(tick.completed, 1);
    assert_eq!(tick.failed, 0);
}

#[test]
fn observed_failures_are_retired_quietly() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let deferred = Deferred::<()>::new();
    scheduler.schedule(&deferred).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let callback = {
        let seen = seen.clone();
        deferred.core().on_complete(move |_| {
            seen.fetch_add(1, SeqCst);
        })
    };
    assert!(callback.is_some());
    deferred.fail(Error::msg("someone is listening")).unwrap();
    assert_eq!(seen.load(SeqCst), 1);
    assert!(deferred.core().was_observed());

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.completed, 1);
    assert_eq!(tick.failed, 0);
}

#[test]
fn sleeping_fibers_are_not_resumed_early() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let proxy = Proxy::from_fn(Instant::now);
    let wakeup = Instant::now() + Duration::from_millis(30);
    proxy.core().set_wakeup_time(Some(wakeup));
    scheduler.schedule(&proxy).unwrap();

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 0);
    assert_eq!(tick.sleeping, 1);
    assert!(tick.has_remaining);
    let next = tick.next_wakeup.expect("a fiber is asleep");
    assert!(next <= Duration::from_millis(30));

    scheduler.wait(&*proxy).unwrap();
    let ran_at = proxy.take().unwrap();
    assert!(ran_at >= wakeup);
    assert_eq!(proxy.core().wakeup_time(), None);
}

#[test]
fn sleepers_do_not_hold_up_ready_fibers() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let sleeper = Proxy::from_fn(|| ());
    sleeper
        .core()
        .set_wakeup_time(Some(Instant::now() + Duration::from_secs(60)));
    scheduler.schedule(&sleeper).unwrap();
    let ready = scheduler.invoke(|| ()).unwrap();

    let tick = dbg!(scheduler.tick());
    assert_eq!(tick.polled, 1);
    assert_eq!(tick.sleeping, 1);
    assert_eq!(ready.status(), Status::Fulfilled);
    assert_eq!(sleeper.status(), Status::Pending);
}

#[test]
fn run_until_wakes_for_external_completion() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let deferred = Deferred::new();
    let thread = std::thread::spawn({
        let deferred = deferred.clone();
        move || {
            std::thread::sleep(Duration::from_millis(20));
            deferred.fulfill(7u32).unwrap();
        }
    });

    assert_eq!(scheduler.block_on(&deferred).unwrap(), 7);
    thread.join().unwrap();
}

#[test]
fn schedule_from_another_thread_unparks_the_loop() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let proxy = Proxy::from_fn(|| std::thread::current().id());
    let thread = std::thread::spawn({
        let scheduler = scheduler.clone();
        let proxy = proxy.clone();
        move || {
            std::thread::sleep(Duration::from_millis(20));
            scheduler.schedule(&proxy).unwrap();
        }
    });

    let id = scheduler.block_on(&proxy).unwrap();
    assert_eq!(id, std::thread::current().id());
    thread.join().unwrap();
}

#[test]
fn shutdown_stops_run() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let runner = std::thread::spawn({
        let scheduler = scheduler.clone();
        move || scheduler.run()
    });
    let proxy = scheduler.invoke(|| 1 + 1).unwrap();

    // Wait for the runner to run the proxy, from this thread.
    let mut backoff = crate::util::Backoff::new();
    while !proxy.is_complete() {
        backoff.wait();
    }
    assert_eq!(proxy.value(), Ok(2));

    scheduler.shutdown();
    runner.join().unwrap();
    assert!(scheduler.is_shutdown());

    // A stopped loop returns instead of waiting.
    let never = Deferred::<()>::new();
    assert!(scheduler.wait(&*never).is_err());
}

#[test]
fn until_polls_its_predicate() {
    let _trace = trace_init();
    let scheduler = Scheduler::new();
    let polls = Arc::new(AtomicUsize::new(0));
    let until = {
        let polls = polls.clone();
        Until::spawn(&scheduler, move || polls.fetch_add(1, SeqCst) >= 3).unwrap()
    };
    assert_eq!(until.status(), Status::Pending);

    scheduler.wait(&*until).unwrap();
    assert_eq!(polls.load(SeqCst), 4);
    assert!(scheduler.is_empty());

    let immediate = Until::spawn(&scheduler, || true).unwrap();
    assert_eq!(immediate.status(), Status::Fulfilled);
    assert!(scheduler.is_empty());
}

#[test]
fn scheduler_is_send_sync() {
    crate::util::assert_send_sync::<Scheduler>();
    crate::util::assert_send_sync::<Tick>();
}
