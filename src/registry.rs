//! Named, ad-hoc coalescing of one-off async calls.
//!
//! A [`Registry`] hands out one [`Coordinator`] per name. Each coordinator's
//! batch runs a single caller-supplied call, so every `run` of the same name
//! that lands in the same tick, or arrives while that call is still running,
//! shares the result of one call.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::{Hash, Hasher},
    sync::Arc,
};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::{batch::BatchFuture, coordinator::Coordinator, window::Tick};

type Thunk<Value, Error> = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, Error>> + Send>;

/// The key of a registry coordinator: the registry name, plus the call that
/// should run if this key ends up opening a batch. Calls are compared by
/// name only, so every caller after the first in a batch shares the first
/// caller's call; theirs is dropped without ever being invoked.
pub struct RegistryCall<Value, Error> {
    name: Arc<str>,
    thunk: Arc<Mutex<Option<Thunk<Value, Error>>>>,
}

impl<Value, Error> RegistryCall<Value, Error> {
    fn take_thunk(&self) -> Option<Thunk<Value, Error>> {
        self.thunk.lock().take()
    }
}

impl<Value, Error> Clone for RegistryCall<Value, Error> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            thunk: Arc::clone(&self.thunk),
        }
    }
}

impl<Value, Error> PartialEq for RegistryCall<Value, Error> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<Value, Error> Eq for RegistryCall<Value, Error> {}

impl<Value, Error> Hash for RegistryCall<Value, Error> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl<Value, Error> Debug for RegistryCall<Value, Error> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCall")
            .field("name", &self.name)
            .finish()
    }
}

/// The fetch function of every registry coordinator.
pub type RegistryFetch<Value, Error> =
    fn(Vec<RegistryCall<Value, Error>>) -> BoxFuture<'static, Result<Vec<Value>, Error>>;

/// Future returned by [`Registry::run`].
pub type RunFuture<Value, Error> =
    BatchFuture<RegistryCall<Value, Error>, Value, Error, RegistryFetch<Value, Error>, Tick>;

type NamedCoordinator<Value, Error> =
    Coordinator<RegistryCall<Value, Error>, Value, Error, RegistryFetch<Value, Error>>;

fn run_calls<Value, Error>(
    calls: Vec<RegistryCall<Value, Error>>,
) -> BoxFuture<'static, Result<Vec<Value>, Error>>
where
    Value: Send + 'static,
    Error: Send + 'static,
{
    // A registry batch only ever holds its one name. If the call has somehow
    // already been taken, answering with no items fails the batch with a
    // count mismatch rather than hanging.
    let thunk = calls.first().and_then(RegistryCall::take_thunk);

    async move {
        match thunk {
            Some(thunk) => thunk().await.map(|value| vec![value]),
            None => Ok(Vec::new()),
        }
    }
    .boxed()
}

/// A table of named coordinators for coalescing one-off async calls.
///
/// The registry is an ordinary value: create one, and share it (by
/// reference or `Arc`) with the code that needs it. Names are never evicted;
/// a registry grows with the set of distinct names it is used with.
///
/// ```
/// use tickloader::Registry;
///
/// let registry: Registry<u32, ()> = Registry::new();
///
/// let (a, b) = futures::executor::block_on(async {
///     futures::join!(
///         registry.run("answer", || async { Ok(42) }),
///         // Same name, same tick: this call never runs
///         registry.run("answer", || async { Ok(0) }),
///     )
/// });
///
/// assert_eq!(a, Ok(42));
/// assert_eq!(b, Ok(42));
/// ```
pub struct Registry<Value, Error> {
    coordinators: ArcSwap<HashMap<Arc<str>, Arc<NamedCoordinator<Value, Error>>>>,
}

impl<Value, Error> Default for Registry<Value, Error> {
    fn default() -> Self {
        Self {
            coordinators: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl<Value, Error> Registry<Value, Error>
where
    Value: Clone + Send + 'static,
    Error: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call` under `name`, unless a call with the same name is already
    /// pending or running, in which case its result is shared instead. The
    /// request is placed immediately; `call` itself runs when the returned
    /// future (or another waiter on the same batch) is polled.
    pub fn run<C, Fut>(&self, name: &str, call: C) -> RunFuture<Value, Error>
    where
        C: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        let coordinator = self.coordinator(name);
        let thunk: Thunk<Value, Error> = Box::new(move || call().boxed());

        coordinator.load(RegistryCall {
            name: Arc::from(name),
            thunk: Arc::new(Mutex::new(Some(thunk))),
        })
    }

    /// Number of names this registry has created coordinators for.
    pub fn len(&self) -> usize {
        self.coordinators.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.load().is_empty()
    }

    fn coordinator(&self, name: &str) -> Arc<NamedCoordinator<Value, Error>> {
        if let Some(coordinator) = self.coordinators.load().get(name) {
            return Arc::clone(coordinator);
        }

        // Copy-on-write insert. rcu may retry under contention; whichever
        // coordinator ends up in the stored map is the one we return.
        let mut found = None;
        self.coordinators.rcu(|current| {
            let mut next = HashMap::clone(current);
            let coordinator = next
                .entry(Arc::from(name))
                .or_insert_with(|| {
                    let fetch: RegistryFetch<Value, Error> = run_calls::<Value, Error>;
                    Arc::new(Coordinator::new(fetch))
                });
            found = Some(Arc::clone(coordinator));
            next
        });

        debug!(registry = name, "registry coordinator ready");

        match found {
            Some(coordinator) => coordinator,
            // rcu always runs its closure at least once
            None => unreachable!("registry update did not run"),
        }
    }
}
