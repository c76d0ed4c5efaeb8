use std::{
    collections::HashMap,
    hash::Hash,
    num::NonZeroUsize,
    ptr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use futures::future::{try_join_all, TryJoinAll};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    batch::{Added, Batch, BatchFn, BatchFuture, FlushFuture},
    data::{KeySet, Token},
    extract::{keyed, KeyFn, KeyedEntry},
    options::BatchOptions,
    window::{tick, Tick, Window},
};

/// The coordinator-wide state. Only ever touched while placing a key or
/// while cleaning up after a batch finishes; never held across a fetch.
struct Slots<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    // The batch currently accepting keys, if any.
    open: Weak<Batch<Key, Value, Error, F, W>>,

    // key -> the unfinished batch answering it. Only populated when
    // deduplication is enabled. Dead or finished entries count as absent.
    in_flight: HashMap<Key, Weak<Batch<Key, Value, Error, F, W>>>,
}

/// Everything a batch needs from its coordinator. Each batch keeps this
/// alive for as long as anyone is waiting on it.
pub(crate) struct Shared<Key, Value, Error, F, W>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    pub(crate) fetch: F,
    pub(crate) window: W,
    pub(crate) extractor: Option<KeyFn<Key, Value>>,
    pub(crate) options: BatchOptions,
    next_batch_id: AtomicU64,
    slots: Mutex<Slots<Key, Value, Error, F, W>>,
}

impl<Key, Value, Error, F, W> Shared<Key, Value, Error, F, W>
where
    Key: Hash + Eq,
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    /// Called once a batch reaches a terminal state, after its own lock has
    /// been released. Forgets every in-flight entry still pointing at it,
    /// and the open slot if that still points at it.
    pub(crate) fn release(&self, batch: &Batch<Key, Value, Error, F, W>, keys: &KeySet<Key>) {
        let mut slots = self.slots.lock();

        if ptr::eq(slots.open.as_ptr(), batch) {
            slots.open = Weak::new();
        }

        if !self.options.deduplicate {
            return;
        }

        let mut released = 0;
        for key in keys.iter() {
            let owned = slots
                .in_flight
                .get(key)
                .map_or(false, |owner| ptr::eq(owner.as_ptr(), batch));

            if owned {
                slots.in_flight.remove(key);
                released += 1;
            }
        }

        // Batches whose waiters all went away never run, so they never get
        // here themselves; sweep their entries along with ours.
        slots.in_flight.retain(|_, owner| owner.strong_count() > 0);

        trace!(batch = batch.id(), released, "released in-flight keys");
    }
}

/// Configuration for a [`Coordinator`]: the fetch function, the batching
/// window, the optional key-extraction policy, and the [`BatchOptions`].
///
/// ```
/// use tickloader::BatchRules;
///
/// #[derive(Debug, Clone)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// // This data source returns users in whatever order it likes
/// async fn fetch_users(ids: Vec<u64>) -> Result<Vec<User>, String> {
///     Ok(ids
///         .into_iter()
///         .rev()
///         .map(|id| User { id, name: format!("user {}", id) })
///         .collect())
/// }
///
/// let coordinator = BatchRules::new(fetch_users)
///     .extract_keys(|user: &User| user.id)
///     .build();
///
/// let (a, b) = futures::executor::block_on(async {
///     futures::join!(coordinator.load(1), coordinator.load(2))
/// });
///
/// assert_eq!(a.unwrap().name, "user 1");
/// assert_eq!(b.unwrap().name, "user 2");
/// ```
pub struct BatchRules<Key, Value, F, W = Tick> {
    pub fetch: F,
    pub window: W,
    pub extractor: Option<KeyFn<Key, Value>>,
    pub options: BatchOptions,
}

impl<Key, Value, F> BatchRules<Key, Value, F> {
    /// Rules with the default window (the current tick), positional result
    /// association, and default options.
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            window: tick,
            extractor: None,
            options: BatchOptions::default(),
        }
    }
}

impl<Key, Value, F, W> BatchRules<Key, Value, F, W> {
    /// Use a different batching window.
    pub fn window<W2: Window>(self, window: W2) -> BatchRules<Key, Value, F, W2> {
        BatchRules {
            fetch: self.fetch,
            window,
            extractor: self.extractor,
            options: self.options,
        }
    }

    /// Match each fetched item to its key with `extract`, instead of relying
    /// on the fetch function to preserve key order.
    pub fn extract_keys(
        mut self,
        extract: impl Fn(&Value) -> Key + Send + Sync + 'static,
    ) -> Self {
        self.extractor = Some(Box::new(extract));
        self
    }

    /// Match each fetched item to its key with its [`KeyedEntry`] impl.
    pub fn keyed(mut self) -> Self
    where
        Key: Clone + 'static,
        Value: KeyedEntry<Key> + 'static,
    {
        self.extractor = Some(keyed());
        self
    }

    pub fn deduplicate(mut self, deduplicate: bool) -> Self {
        self.options.deduplicate = deduplicate;
        self
    }

    /// Dispatch a batch as soon as it holds `max_keys` distinct keys. Zero
    /// means unlimited.
    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.options.max_keys = NonZeroUsize::new(max_keys);
        self
    }

    pub fn options(mut self, options: BatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build<Error>(self) -> Coordinator<Key, Value, Error, F, W>
    where
        F: BatchFn<Key, Value, Error>,
        W: Window,
    {
        Coordinator {
            shared: Arc::new(Shared {
                fetch: self.fetch,
                window: self.window,
                extractor: self.extractor,
                options: self.options,
                next_batch_id: AtomicU64::new(0),
                slots: Mutex::new(Slots {
                    open: Weak::new(),
                    in_flight: HashMap::new(),
                }),
            }),
        }
    }
}

/// A `Coordinator` groups every key requested within one batching window
/// into a single call of its fetch function, and hands each requester the
/// value for its own key.
///
/// It can be shared by reference between many tasks, even on different
/// threads. All keys placed before the resulting futures are first polled
/// (with the default window: all keys requested in the same tick) share a
/// batch.
pub struct Coordinator<Key, Value, Error, F, W = Tick>
where
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    shared: Arc<Shared<Key, Value, Error, F, W>>,
}

impl<Key, Value, Error, F> Coordinator<Key, Value, Error, F>
where
    Key: Hash + Eq + Clone,
    Value: Clone,
    Error: Clone,
    F: BatchFn<Key, Value, Error>,
{
    /// Create a coordinator with default [`BatchRules`].
    pub fn new(fetch: F) -> Self {
        BatchRules::new(fetch).build()
    }
}

impl<Key, Value, Error, F, W> Coordinator<Key, Value, Error, F, W>
where
    Key: Hash + Eq + Clone,
    Value: Clone,
    Error: Clone,
    F: BatchFn<Key, Value, Error>,
    W: Window,
{
    /// Request the value for a single key. The key is placed in a batch
    /// immediately; the returned future resolves once that batch has run.
    ///
    /// Batches are driven by polling their futures. If every future waiting
    /// on a batch is dropped before the batch executes, its fetch is never
    /// called, so don't rely on a side-effecting fetch running for a request
    /// nobody awaits.
    pub fn load(&self, key: Key) -> BatchFuture<Key, Value, Error, F, W> {
        let (batch, token) = self.place(key);
        BatchFuture::new(batch, token)
    }

    /// Request the values for several keys, returned in the same order.
    /// Every key is placed immediately, so keys requested together share a
    /// batch. If any contributing batch fails, the whole request fails with
    /// the first failure observed.
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> TryJoinAll<BatchFuture<Key, Value, Error, F, W>> {
        try_join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Wait for the currently open batch, if there is one, and return every
    /// value it produced in key insertion order. If no batch is open, the
    /// returned future is immediately ready with an empty list.
    pub fn flush_pending(&self) -> FlushFuture<Key, Value, Error, F, W> {
        let slots = self.shared.slots.lock();
        let batch = slots.open.upgrade().filter(|batch| batch.is_open());
        FlushFuture::new(batch)
    }

    pub fn options(&self) -> &BatchOptions {
        &self.shared.options
    }

    /// Number of keys currently tracked as owned by an unfinished batch.
    pub fn in_flight_len(&self) -> usize {
        let slots = self.shared.slots.lock();
        slots
            .in_flight
            .values()
            .filter(|owner| owner.strong_count() > 0)
            .count()
    }

    /// Find (or create) the batch that will answer `key`, and add it there.
    /// This never blocks on anything but the coordinator's own lock.
    fn place(&self, key: Key) -> (Arc<Batch<Key, Value, Error, F, W>>, Token) {
        let shared = &self.shared;
        let mut slots = shared.slots.lock();

        if shared.options.deduplicate {
            let owner = slots.in_flight.get(&key).and_then(Weak::upgrade);
            if let Some(batch) = owner {
                if let Some(token) = batch.token_of(&key) {
                    trace!(batch = batch.id(), "joined in-flight batch");
                    return (batch, token);
                }
            }
        }

        let tracked = if shared.options.deduplicate {
            Some(key.clone())
        } else {
            None
        };

        // If there is an open batch, add the key to it. Note that at no point
        // do we check the timing; we assume that if its window has closed, a
        // future poll will advance it out of the open state, at which point
        // it rejects the key and we start a new one.
        let (batch, token) = match slots.open.upgrade() {
            Some(batch) => match batch.try_add(key) {
                Ok(Added { token, full }) => {
                    if full {
                        slots.open = Weak::new();
                    }
                    (batch, token)
                }
                Err(key) => self.open_batch(&mut slots, key),
            },
            None => self.open_batch(&mut slots, key),
        };

        if let Some(key) = tracked {
            slots.in_flight.insert(key, Arc::downgrade(&batch));
        }

        (batch, token)
    }

    fn open_batch(
        &self,
        slots: &mut Slots<Key, Value, Error, F, W>,
        key: Key,
    ) -> (Arc<Batch<Key, Value, Error, F, W>>, Token) {
        let id = self.shared.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let (batch, token, full) = Batch::open(id, Arc::clone(&self.shared), key);

        slots.open = if full {
            Weak::new()
        } else {
            Arc::downgrade(&batch)
        };

        debug!(batch = id, "opened batch");
        (batch, token)
    }
}
