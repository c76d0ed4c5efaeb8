use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    coordinator::Shared,
    data::{KeySet, Token as KeyToken, ValueSet},
    error::BatchError,
    wakerset::{Token as WakerToken, WakerSet},
    window::Window,
};

/// The asynchronous function that does the actual work of a batch: given
/// every key collected in the batch, in first-insertion order, produce one
/// item per key.
///
/// This is implemented for any `Fn(Vec<Key>) -> impl Future<Output =
/// Result<Vec<Value>, Error>>`, so an `async fn` works directly:
///
/// ```
/// async fn get_users(ids: Vec<u64>) -> Result<Vec<String>, std::io::Error> {
///     Ok(ids.iter().map(|id| format!("user {}", id)).collect())
/// }
///
/// let coordinator = tickloader::Coordinator::new(get_users);
/// # let _ = coordinator.load(1);
/// ```
pub trait BatchFn<Key, Value, Error> {
    type Future: Future<Output = Result<Vec<Value>, Error>>;

    fn fetch(&self, keys: Vec<Key>) -> Self::Future;
}

impl<Key, Value, Error, F, Fut> BatchFn<Key, Value, Error> for F
where
    F: Fn(Vec<Key>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    type Future = Fut;

    fn fetch(&self, keys: Vec<Key>) -> Fut {
        self(keys)
    }
}

type Outcome<Value, Error> = Result<ValueSet<Value>, BatchError<Error>>;

struct OpenState<Key, Win> {
    keys: KeySet<Key>,

    // None once the batch is full and should run without waiting
    window: Option<Pin<Box<Win>>>,
    wakers: WakerSet,
}

impl<Key: Debug, Win> Debug for OpenState<Key, Win> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenState")
            .field("keys", &self.keys)
            .field("window", &self.window.as_ref().map(|_| "<window>"))
            .field("wakers", &self.wakers)
            .finish()
    }
}

// Design notes:
//
// We only need one task to "drive" this future. However, there are two cases
// we need to handle:
// - If a waiting future is dropped, we need to arrange for a different task
//   to continue driving this batch
// - When the batch completes, we need to wake ALL the tasks
//
// The fetch future is never polled under the state lock, because it may
// itself place keys with this batch's coordinator. While a waiter is polling
// it, `fut` is None and the other waiters just wait.
struct ExecutingState<Key, Fut> {
    keys: Arc<KeySet<Key>>,
    fut: Option<Pin<Box<Fut>>>,
    wakers: WakerSet,
}

enum State<Key, Value, Error, Fut, Win> {
    Open(OpenState<Key, Win>),
    Executing(ExecutingState<Key, Fut>),
    Done(Outcome<Value, Error>),
}

/// A key accepted by an open batch. `full` is set if it was the last key the
/// batch will take.
pub(crate) struct Added {
    pub(crate) token: KeyToken,
    pub(crate) full: bool,
}

/// One fetch cycle. Shared (by `Arc`) between every future waiting on one of
/// its keys; the coordinator only holds weak references to it.
pub(crate) struct Batch<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    id: u64,
    shared: Arc<Shared<Key, Value, Error, F, W>>,
    state: Mutex<State<Key, Value, Error, F::Future, W::Future>>,
}

impl<Key, Value, Error, F, W> Batch<Key, Value, Error, F, W>
where
    Key: Hash + Eq + Clone,
    Value: Clone,
    Error: Clone,
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    /// Create a new open batch containing a single key. Returns the batch,
    /// the key's token, and whether the batch is already full.
    pub(crate) fn open(
        id: u64,
        shared: Arc<Shared<Key, Value, Error, F, W>>,
        key: Key,
    ) -> (Arc<Self>, KeyToken, bool) {
        let mut keys = KeySet::new();
        let token = keys.add_key(key);
        let full = shared.options.is_full(keys.len());

        let window = if full {
            None
        } else {
            Some(Box::pin(shared.window.open()))
        };

        let batch = Arc::new(Self {
            id,
            shared,
            state: Mutex::new(State::Open(OpenState {
                keys,
                window,
                wakers: WakerSet::default(),
            })),
        });

        (batch, token, full)
    }

    /// Add a key, if this batch is still accepting them. The key is handed
    /// back if it isn't. Never waits on the fetch, even if it is being polled
    /// at this moment.
    pub(crate) fn try_add(&self, key: Key) -> Result<Added, Key> {
        let mut guard = self.state.lock();

        match *guard {
            State::Open(ref mut state) => {
                let token = state.keys.add_key(key);

                // If we've hit the key limit, clear the window so that the
                // batch runs at the next poll, and make sure someone polls.
                let full = self.shared.options.is_full(state.keys.len());
                if full && state.window.take().is_some() {
                    state.wakers.wake_driver();
                }

                Ok(Added { token, full })
            }
            _ => Err(key),
        }
    }

    /// If this batch hasn't finished yet and owns `key`, the token for it.
    pub(crate) fn token_of(&self, key: &Key) -> Option<KeyToken> {
        match *self.state.lock() {
            State::Open(ref state) => state.keys.token_of(key),
            State::Executing(ref state) => state.keys.token_of(key),
            State::Done(..) => None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open(..))
    }

    /// Drive this batch forward, and once it's complete, pass its outcome to
    /// `read`. The waker of a pending caller is recorded in the WakerSet
    /// under `waker_token`.
    fn poll_outcome<R>(
        &self,
        ctx: &mut Context<'_>,
        waker_token: &mut Option<WakerToken>,
        read: impl FnOnce(&Outcome<Value, Error>) -> R,
    ) -> Poll<R> {
        // Claim the fetch future (creating it if the window just closed), or
        // find out that there's nothing for us to do yet. The lock is only
        // held for the duration of this block.
        let (keys, fut) = {
            let mut guard = self.state.lock();

            match *guard {
                State::Open(ref mut state) => {
                    if let Some(window) = state.window.as_mut() {
                        if window.as_mut().poll(ctx).is_pending() {
                            state.wakers.register(waker_token, ctx.waker());
                            return Poll::Pending;
                        }
                    }

                    // Window is complete. Transition to the Executing state,
                    // with the fetch future claimed by us.
                    let keys = Arc::new(state.keys.take());
                    let wakers = mem::take(&mut state.wakers);

                    *guard = State::Executing(ExecutingState {
                        keys: Arc::clone(&keys),
                        fut: None,
                        wakers,
                    });

                    (keys, None)
                }
                State::Executing(ref mut state) => match state.fut.take() {
                    Some(fut) => (Arc::clone(&state.keys), Some(fut)),
                    None => {
                        // Someone else is polling the fetch right now. They
                        // stay the driver if it's still pending.
                        state.wakers.register_waiter(waker_token, ctx.waker());
                        return Poll::Pending;
                    }
                },
                State::Done(ref outcome) => return Poll::Ready(read(outcome)),
            }
        };

        let mut fut = match fut {
            Some(fut) => fut,
            None => {
                debug!(batch = self.id, keys = keys.len(), "executing batch");
                Box::pin(self.shared.fetch.fetch(keys.to_vec()))
            }
        };

        let poll = fut.as_mut().poll(ctx);
        let result = match poll {
            Poll::Pending => {
                match *self.state.lock() {
                    State::Executing(ref mut state) => {
                        state.fut = Some(fut);
                        state.wakers.register(waker_token, ctx.waker());
                    }
                    _ => unreachable!("Batch left its executing state while its fetch was out"),
                }
                return Poll::Pending;
            }
            Poll::Ready(result) => result,
        };
        drop(fut);

        let outcome = result
            .map_err(BatchError::Fetch)
            .and_then(|items| keys.pair(items, self.shared.extractor.as_ref()));

        match outcome {
            Ok(..) => debug!(batch = self.id, "batch completed"),
            Err(ref err) => debug!(
                batch = self.id,
                fetch_error = err.is_fetch(),
                "batch failed"
            ),
        }

        let value = read(&outcome);
        let previous = mem::replace(&mut *self.state.lock(), State::Done(outcome));

        // We already have our result, so we don't need to wake ourself;
        // everyone else is signaled now that the lock is released.
        if let State::Executing(state) = previous {
            let mut wakers = state.wakers;
            if let Some(token) = waker_token.take() {
                wakers.discard(token);
            }
            wakers.wake_all();
        }

        self.shared.release(self, &keys);

        Poll::Ready(value)
    }
}

impl<Key, Value, Error, F, W> Batch<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// A waiting future lost interest. Its key stays in the batch; we only
    /// make sure that, if it was driving the batch, someone else takes over.
    fn abandon(&self, waker_token: Option<WakerToken>) {
        let token = match waker_token {
            Some(token) => token,
            None => return,
        };

        match *self.state.lock() {
            State::Open(ref mut state) => state.wakers.discard_and_wake(token),
            State::Executing(ref mut state) => state.wakers.discard_and_wake(token),
            State::Done(..) => {}
        }
    }
}

/// A request for a single key's value. It is created by
/// [`Coordinator::load`](crate::Coordinator::load); the key has already been
/// placed in its batch by the time this future exists. When awaited, it
/// waits for the batch to be executed and then resolves with the value for
/// its particular key, or with the batch's failure.
///
/// Dropping this future does not remove its key from the batch.
#[must_use = "futures do nothing unless polled"]
pub struct BatchFuture<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    key_token: KeyToken,
    waker_token: Option<WakerToken>,
    batch: Option<Arc<Batch<Key, Value, Error, F, W>>>,
}

impl<Key, Value, Error, F, W> BatchFuture<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    pub(crate) fn new(batch: Arc<Batch<Key, Value, Error, F, W>>, key_token: KeyToken) -> Self {
        Self {
            key_token,
            waker_token: None,
            batch: Some(batch),
        }
    }
}

impl<Key, Value, Error, F, W> Future for BatchFuture<Key, Value, Error, F, W>
where
    Key: Hash + Eq + Clone,
    Value: Clone,
    Error: Clone,
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    type Output = Result<Value, BatchError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let key_token = this.key_token;

        let batch = this
            .batch
            .as_ref()
            .expect("Can't re-poll a completed BatchFuture");

        let poll = batch.poll_outcome(ctx, &mut this.waker_token, |outcome| match outcome {
            Ok(values) => Ok(values.get(key_token)),
            Err(err) => Err(err.clone()),
        });

        if poll.is_ready() {
            this.batch = None;
        }

        poll
    }
}

impl<Key, Value, Error, F, W> Drop for BatchFuture<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            batch.abandon(self.waker_token.take());
        }
    }
}

/// Future returned by [`Coordinator::flush_pending`](crate::Coordinator::flush_pending).
/// Resolves with every value produced by the batch that was open when it was
/// created, in key insertion order, or immediately with nothing if no batch
/// was open.
#[must_use = "futures do nothing unless polled"]
pub struct FlushFuture<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    waker_token: Option<WakerToken>,
    batch: Option<Arc<Batch<Key, Value, Error, F, W>>>,
    finished: bool,
}

impl<Key, Value, Error, F, W> FlushFuture<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    pub(crate) fn new(batch: Option<Arc<Batch<Key, Value, Error, F, W>>>) -> Self {
        Self {
            waker_token: None,
            batch,
            finished: false,
        }
    }
}

impl<Key, Value, Error, F, W> Future for FlushFuture<Key, Value, Error, F, W>
where
    Key: Hash + Eq + Clone,
    Value: Clone,
    Error: Clone,
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    type Output = Result<Vec<Value>, BatchError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(!this.finished, "Can't re-poll a completed FlushFuture");

        let poll = match this.batch.as_ref() {
            None => Poll::Ready(Ok(Vec::new())),
            Some(batch) => batch.poll_outcome(ctx, &mut this.waker_token, |outcome| {
                outcome.as_ref().map(ValueSet::to_vec).map_err(Clone::clone)
            }),
        };

        if poll.is_ready() {
            this.batch = None;
            this.finished = true;
        }

        poll
    }
}

impl<Key, Value, Error, F, W> Drop for FlushFuture<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            batch.abandon(self.waker_token.take());
        }
    }
}
