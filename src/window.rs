//! The batching window: how long a freshly opened batch keeps accepting keys
//! before it is executed.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Produces the window future for each new batch. The batch closes, and its
/// fetch runs, as soon as the window future completes.
///
/// Any `Fn() -> impl Future<Output = ()>` is a window; for example, a short
/// timer lets keys from several ticks accumulate in one batch:
///
/// ```
/// use std::time::Duration;
/// use futures_timer::Delay;
/// use tickloader::BatchRules;
/// # async fn fetch(keys: Vec<u32>) -> Result<Vec<u32>, ()> { Ok(keys) }
///
/// let coordinator = BatchRules::new(fetch)
///     .window(|| Delay::new(Duration::from_millis(2)))
///     .build();
/// # let _ = coordinator.load(1);
/// ```
pub trait Window {
    type Future: Future<Output = ()>;

    fn open(&self) -> Self::Future;
}

impl<F, Fut> Window for F
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    type Future = Fut;

    fn open(&self) -> Fut {
        self()
    }
}

/// The default window: the remainder of the current tick.
pub type Tick = fn() -> YieldNow;

/// Window that closes after a single cooperative yield. Every key placed
/// before the driving future is first polled lands in the batch; the fetch
/// runs when that future is polled again.
pub fn tick() -> YieldNow {
    YieldNow::default()
}

/// A future that returns Pending exactly once, asking to be polled again
/// immediately.
#[derive(Debug, Default)]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
