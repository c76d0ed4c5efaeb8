//! These tests ensure that dropped futures correctly update the shared state
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::executor;
use futures_timer::Delay;
use std::{
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};
use tickloader::{BatchRules, Coordinator};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// Testing async function: put a copy of each key in an Rc in the result.
/// This lets us track how many handles to a value are alive.
async fn put_keys_in_rc<T: Copy>(keys: Vec<T>) -> Result<Vec<Rc<T>>, ()> {
    Ok(keys.into_iter().map(Rc::new).collect())
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let coordinator = Coordinator::new(put_keys_in_rc);

    let fut1 = coordinator.load(1);
    let fut2 = coordinator.load(1);
    let fut3 = coordinator.load(1);
    let fut4 = coordinator.load(1);

    let res1 = executor::block_on(fut1).unwrap();

    // At this point, the shared result and our local fut1 result should both
    // have an Rc
    assert_eq!(Rc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the underlying Rc
    let res2 = executor::block_on(fut2).unwrap();
    assert_eq!(Rc::strong_count(&res2), 3);

    // Dropping this future shouldn't change anything
    drop(fut3);
    assert_eq!(Rc::strong_count(&res1), 3);

    // However, dropping our last remaining handle to the batch should cause
    // the shared outcome to be dropped. The coordinator itself holds nothing.
    drop(fut4);
    assert_eq!(Rc::strong_count(&res1), 2);
}

#[test]
fn test_drop_during_window() {
    let calls = Mutex::new(Vec::new());
    let coordinator = BatchRules::new(|keys: Vec<i32>| {
        calls.lock().unwrap().push(keys.clone());
        async move { Ok::<_, ()>(keys) }
    })
    .window(|| Delay::new(Duration::from_millis(10)))
    .build();

    let waker = NoOpWaker;
    let waker = std::sync::Arc::new(waker).into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = coordinator.load(1);
    let fut11 = coordinator.load(1);
    let fut2 = coordinator.load(2);
    let fut3 = coordinator.load(3);

    // This poll initiates the window. We drop futures in this phase, then
    // confirm that their keys were still fetched.
    let poll = Pin::new(&mut fut1).poll(&mut ctx);
    assert_eq!(poll, Poll::Pending);

    drop(fut11);
    drop(fut3);

    let result: i32 = executor::block_on(fut1).unwrap();
    assert_eq!(result, 1);

    let result: i32 = executor::block_on(fut2).unwrap();
    assert_eq!(result, 2);

    assert_eq!(*calls.lock().unwrap(), [vec![1, 2, 3]]);
}

#[test]
fn test_drop_while_fetching() {
    let coordinator = BatchRules::new(|keys: Vec<i32>| async move {
        Delay::new(Duration::from_millis(20)).await;
        Ok::<_, ()>(keys)
    })
    .window(|| Delay::new(Duration::from_millis(1)))
    .build();

    let waker = NoOpWaker;
    let waker = std::sync::Arc::new(waker).into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = coordinator.load(1);
    let fut2 = coordinator.load(2);

    assert_eq!(Pin::new(&mut fut1).poll(&mut ctx), Poll::Pending);
    std::thread::sleep(Duration::from_millis(5));

    // The window has elapsed, so this poll starts the fetch
    assert_eq!(Pin::new(&mut fut1).poll(&mut ctx), Poll::Pending);

    // The driver walks away mid-fetch; the remaining waiter must still be
    // able to finish the batch.
    drop(fut1);
    assert_eq!(executor::block_on(fut2), Ok(2));
}

#[test]
fn test_batch_with_no_waiters_never_runs() {
    let calls = Mutex::new(Vec::new());
    let coordinator = Coordinator::new(|keys: Vec<i32>| {
        calls.lock().unwrap().push(keys.clone());
        async move { Ok::<_, ()>(keys) }
    });

    drop(coordinator.load(1));
    drop(coordinator.load(2));

    // Nobody is waiting on the old batch, so a new one is opened here
    assert_eq!(executor::block_on(coordinator.load(3)), Ok(3));
    assert_eq!(*calls.lock().unwrap(), [vec![3]]);
    assert_eq!(coordinator.in_flight_len(), 0);
}
