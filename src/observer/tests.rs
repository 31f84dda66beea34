use super::*;
use crate::{future::ToPromise, util::trace_init};
use std::sync::atomic::Ordering::SeqCst;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event<T> {
    Next(T),
    Error(String),
    Completed,
}

/// Records everything it observes.
struct Recorder<T> {
    events: Mutex<Vec<Event<T>>>,
}

impl<T: Clone> Recorder<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<Event<T>> {
        self.events.lock().clone()
    }
}

impl<T: Send> Observer<T> for Recorder<T> {
    fn on_next(&self, value: T) {
        self.events.lock().push(Event::Next(value));
    }

    fn on_error(&self, error: Error) {
        self.events.lock().push(Event::Error(error.to_string()));
    }

    fn on_completed(&self) {
        self.events.lock().push(Event::Completed);
    }
}

#[test]
fn futures_deliver_value_then_completion() {
    let _trace = trace_init();
    let future = Deferred::<i32>::new();
    let recorder = Recorder::<i32>::new();
    let _subscription = future.subscribe(recorder.clone());
    assert!(recorder.events().is_empty());

    future.fulfill(5).unwrap();
    assert_eq!(recorder.events(), [Event::Next(5), Event::Completed]);
}

#[test]
fn futures_deliver_errors() {
    let _trace = trace_init();
    let future = Deferred::<u8>::new();
    let recorder = Recorder::<u8>::new();
    let _subscription = future.subscribe(recorder.clone());
    future.fail(Error::msg("bad")).unwrap();
    assert_eq!(recorder.events(), [Event::Error("bad".into())]);
}

#[test]
fn subscribing_to_a_complete_future_delivers_at_once() {
    let _trace = trace_init();
    let future = Deferred::fulfilled("done");
    let recorder = Recorder::<&str>::new();
    let subscription = future.subscribe(recorder.clone());
    assert_eq!(recorder.events(), [Event::Next("done"), Event::Completed]);
    assert!(!subscription.is_disposed());
}

#[test]
fn disposed_subscriptions_deliver_nothing() {
    let _trace = trace_init();
    let future = Deferred::<i32>::new();
    let recorder = Recorder::<i32>::new();
    let subscription = future.subscribe(recorder.clone());
    subscription.dispose();
    assert!(subscription.is_disposed());

    future.fulfill(1).unwrap();
    assert!(recorder.events().is_empty());
}

#[test]
fn collections_complete_once_after_every_member() {
    let _trace = trace_init();
    let futures = (0..3).map(|_| Deferred::<u32>::new()).collect::<Vec<_>>();
    let collection = futures.iter().cloned().collect::<Collection<u32>>();
    let recorder = Recorder::<u32>::new();
    let _subscription = collection.subscribe(recorder.clone());

    futures[1].fulfill(1).unwrap();
    futures[0].fail(Error::msg("zero")).unwrap();
    assert_eq!(
        recorder.events(),
        [Event::Next(1), Event::Error("zero".into())]
    );

    futures[2].fulfill(2).unwrap();
    assert_eq!(
        recorder.events(),
        [
            Event::Next(1),
            Event::Error("zero".into()),
            Event::Next(2),
            Event::Completed
        ]
    );
}

#[test]
fn empty_collections_complete_at_once() {
    let _trace = trace_init();
    let recorder = Recorder::<u32>::new();
    let _subscription = Collection::<u32>::new().subscribe(recorder.clone());
    assert_eq!(recorder.events(), [Event::Completed]);
}

#[test]
fn observer_futures_take_the_first_value() {
    let _trace = trace_init();
    let observer = ObserverFuture::<u32>::new();
    observer.on_next(1);
    observer.on_next(2);
    observer.on_completed();
    assert_eq!(observer.value(), Ok(1));

    let observer = ObserverFuture::<u32>::new();
    observer.on_completed();
    assert_eq!(observer.status(), Status::Pending);
    observer.on_error(Error::msg("late"));
    assert_eq!(observer.status(), Status::Throw);
}

#[test]
fn observer_futures_bridge_collections_back() {
    let _trace = trace_init();
    let futures = (0..2).map(|_| Deferred::<&str>::new()).collect::<Vec<_>>();
    let collection = futures.iter().cloned().collect::<Collection<&str>>();
    let first = ObserverFuture::<&str>::new();
    let _subscription = collection.subscribe(first.clone());

    futures[1].fulfill("b").unwrap();
    futures[0].fulfill("a").unwrap();
    assert_eq!(first.value(), Ok("b"));
}

#[test]
fn for_each_stops_when_told() {
    let _trace = trace_init();
    let futures = (0..3).map(|_| Deferred::<u32>::new()).collect::<Vec<_>>();
    let collection = futures.iter().cloned().collect::<Collection<u32>>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = {
        let seen = seen.clone();
        collection.for_each(move |value| {
            seen.lock().push(value);
            value != 20
        })
    };

    futures[0].fulfill(10).unwrap();
    assert_eq!(done.status(), Status::Pending);
    futures[1].fulfill(20).unwrap();
    assert_eq!(done.status(), Status::Fulfilled);
    futures[2].fulfill(30).unwrap();
    assert_eq!(*seen.lock(), [10, 20]);
}

#[test]
fn for_each_completes_with_its_source() {
    let _trace = trace_init();
    let future = Deferred::<u32>::new();
    let done = future.for_each(|_| true);
    future.fulfill(3).unwrap();
    assert_eq!(done.status(), Status::Fulfilled);

    let failing = Deferred::<u32>::new();
    let done = failing.for_each(|_| true);
    failing.fail(Error::msg("source failed")).unwrap();
    assert_eq!(done.status(), Status::Throw);
    assert_eq!(done.error().unwrap().to_string(), "source failed");
}

#[test]
fn next_takes_one_value_and_unsubscribes() {
    let _trace = trace_init();
    let futures = (0..2).map(|_| Deferred::<u32>::new()).collect::<Vec<_>>();
    let collection = futures.iter().cloned().collect::<Collection<u32>>();
    let next = collection.next();
    assert_eq!(next.status(), Status::Pending);
    assert!(next.subscription.lock().is_some());

    futures[1].fulfill(5).unwrap();
    assert_eq!(next.value(), Ok(5));
    assert!(next.subscription.lock().is_none());
    futures[0].fulfill(6).unwrap();
    assert_eq!(next.value(), Ok(5));

    let ready = Deferred::fulfilled(4_u32).next();
    assert_eq!(ready.value(), Ok(4));
    assert!(ready.subscription.lock().is_none());

    let failing = Deferred::<u32>::new();
    let next = failing.next();
    failing.fail(Error::msg("no value")).unwrap();
    assert_eq!(next.status(), Status::Throw);
    assert_eq!(next.error().unwrap().to_string(), "no value");
}

#[test]
fn for_each_async_waits_for_each_iteration() {
    let _trace = trace_init();
    let futures = (0..3).map(|_| Deferred::<u32>::new()).collect::<Vec<_>>();
    let collection = futures.iter().cloned().collect::<Collection<u32>>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let gates = Arc::new(Mutex::new(Vec::new()));
    let done = {
        let (seen, gates) = (seen.clone(), gates.clone());
        collection.for_each_async(move |value| {
            seen.lock().push(value);
            let gate = Deferred::<bool>::new();
            gates.lock().push(gate.clone());
            gate
        })
    };
    let open = |i: usize| {
        let gate = gates.lock()[i].clone();
        gate.fulfill(true).unwrap();
    };

    futures[0].fulfill(10).unwrap();
    futures[1].fulfill(20).unwrap();
    assert_eq!(*seen.lock(), [10]);

    open(0);
    assert_eq!(*seen.lock(), [10, 20]);
    futures[2].fulfill(30).unwrap();
    assert_eq!(*seen.lock(), [10, 20]);

    open(1);
    assert_eq!(*seen.lock(), [10, 20, 30]);
    assert_eq!(done.status(), Status::Pending);
    open(2);
    assert_eq!(done.status(), Status::Fulfilled);
}

#[test]
fn for_each_async_stops_on_false_or_failure() {
    let _trace = trace_init();
    let futures = (0..3).map(|_| Deferred::<u32>::new()).collect::<Vec<_>>();
    let collection = futures.iter().cloned().collect::<Collection<u32>>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = {
        let seen = seen.clone();
        collection.for_each_async(move |value| {
            seen.lock().push(value);
            Deferred::fulfilled(value != 2)
        })
    };
    for (future, value) in futures.iter().zip(1..) {
        future.fulfill(value).unwrap();
    }
    assert_eq!(*seen.lock(), [1, 2]);
    assert_eq!(done.status(), Status::Fulfilled);

    let future = Deferred::<u32>::new();
    let done = future.for_each_async(|_| Deferred::<bool>::failed(Error::msg("iteration failed")));
    future.fulfill(1).unwrap();
    assert_eq!(done.status(), Status::Throw);
    assert_eq!(done.error().unwrap().to_string(), "iteration failed");
}

#[test]
fn composites_report_each_constituent() {
    let _trace = trace_init();
    let futures = (0..2).map(|_| Deferred::<u32>::new()).collect::<Vec<_>>();
    let all = crate::CompositeFuture::all(futures.iter().map(|f| f.to_promise()));
    let seen = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicBool::new(false));

    struct Each {
        seen: Arc<AtomicUsize>,
        completed: Arc<AtomicBool>,
    }

    impl Observer<PromiseRef> for Each {
        fn on_next(&self, future: PromiseRef) {
            assert!(future.is_complete());
            self.seen.fetch_add(1, SeqCst);
        }

        fn on_error(&self, error: Error) {
            panic!("unexpected error: {error}");
        }

        fn on_completed(&self) {
            self.completed.store(true, SeqCst);
        }
    }

    let _subscription = all.subscribe_each(Arc::new(Each {
        seen: seen.clone(),
        completed: completed.clone(),
    }));
    futures[0].fulfill(0).unwrap();
    assert_eq!(seen.load(SeqCst), 1);
    assert!(!completed.load(SeqCst));
    futures[1].fulfill(1).unwrap();
    assert_eq!(seen.load(SeqCst), 2);
    assert!(completed.load(SeqCst));
}
