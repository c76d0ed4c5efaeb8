//! Tickloader is a request coalescer in the style of the
//! [dataloader pattern](https://github.com/graphql/dataloader). It lets many
//! independent callers each ask for a single item by key, while the work is
//! actually done by one batch operation per "tick": every key requested
//! before the resulting futures are first polled is fetched together, and
//! each caller receives the item for its own key.
//!
//! ## Overview
//!
//! Suppose you had an API that fetches several users in one request:
//!
//! ```
//! #[derive(Debug, Clone)]
//! struct UserData {
//!     username: String,
//!     age: u16,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct APIError {}
//!
//! async fn get_users(usernames: Vec<String>) -> Result<Vec<UserData>, APIError> {
//!     # Ok(usernames.into_iter().map(|username| UserData { username, age: 30 }).collect())
//! }
//! ```
//!
//! A batch function for tickloader receives the keys of a batch as a `Vec`,
//! in the order they were first requested with duplicates removed, and
//! returns one item per key. `get_users` above already has the right shape,
//! so it can be handed to a [`Coordinator`] directly:
//!
//! ```
//! # #[derive(Debug, Clone)] struct UserData { username: String, age: u16 }
//! # #[derive(Debug, Clone)] struct APIError {}
//! # async fn get_users(usernames: Vec<String>) -> Result<Vec<UserData>, APIError> {
//! #     Ok(usernames.into_iter().map(|username| UserData { username, age: 30 }).collect())
//! # }
//! use tickloader::Coordinator;
//!
//! let coordinator = Coordinator::new(get_users);
//!
//! // Both requests are placed in the same tick, so they share a batch:
//! // get_users is called once, with ["alice", "bob"].
//! let alice = coordinator.load("alice".to_string());
//! let bob = coordinator.load("bob".to_string());
//!
//! let (alice, bob) = futures::executor::block_on(futures::future::join(alice, bob));
//! assert_eq!(alice.unwrap().username, "alice");
//! assert_eq!(bob.unwrap().username, "bob");
//! ```
//!
//! The [`Coordinator`] can be shared by reference with your request
//! handlers, so that many independent async tasks (even on different
//! threads) batch their lookups into the same request. Besides
//! [`load`](Coordinator::load), it offers
//! [`load_many`](Coordinator::load_many) for several keys at once and
//! [`flush_pending`](Coordinator::flush_pending) to wait for the batch
//! currently being collected.
//!
//! ### Configuration
//!
//! [`BatchRules`] configures a coordinator:
//! - the `fetch` function described above;
//! - the `window`, an async function that defines how long a new batch keeps
//!   collecting keys. The default, [`tick`], yields exactly once, so a batch
//!   holds every key placed before its futures are polled; a short timer
//!   widens the window across ticks;
//! - an optional key-extraction policy, for data sources that don't return
//!   items in key order (see [`KeyedEntry`]);
//! - [`BatchOptions`]: in-flight deduplication (on by default) and an
//!   optional maximum number of keys per batch.
//!
//! ### In-flight deduplication
//!
//! With deduplication on, requesting a key that is already owned by a batch
//! that hasn't finished yet joins that batch rather than fetching the key
//! again; the new caller receives exactly the item (or failure) the first
//! batch produces. Once a batch finishes, its keys are forgotten, and a later
//! request fetches them afresh. There is no caching beyond that.
//!
//! ### Errors
//!
//! Every failure is batch-wide: either every caller of a batch receives its
//! item, or every caller receives the same [`BatchError`]. That covers the
//! fetch function failing, as well as results that don't match the keys
//! (wrong count, or keys the extraction policy can't reconcile). A failed
//! batch leaves the coordinator fully usable; retrying is simply a new
//! request.
//!
//! ## Design notes
//!
//! ### Poll-driven design
//!
//! In keeping with Rust's polling async design, all of the asynchronous
//! work in tickloader is driven through polling the returned futures. The
//! batch function is not scheduled in any runtime or run in the background;
//! it is driven directly in the foreground by whichever waiting future polled
//! most recently. The other futures are woken only when the batch is
//! complete, or when the driving future is dropped and one of them must take
//! over.
//!
//! Keys are placed synchronously, when [`load`](Coordinator::load) is called,
//! not when its future is first polled. Dropping a future never withdraws its
//! key from the batch. A batch whose waiters have all been dropped before it
//! ran is never executed.
//!
//! ### Locking
//!
//! A coordinator-wide lock protects the open batch slot and the in-flight
//! table. It is held only while placing a key or cleaning up after a batch,
//! never across a fetch or a suspension. Each batch's own lock is likewise
//! released while its fetch future is polled, so a fetch function may itself
//! load other keys through the same coordinator. (It must not load one of its
//! own keys, though: with deduplication on, that request waits on the very
//! batch it is part of.)
//!
//! ### Named one-off calls
//!
//! [`Registry`] coalesces ad-hoc async calls by name: concurrent
//! [`run`](Registry::run)s of the same name share one call.

mod batch;
mod coordinator;
mod data;
mod error;
mod extract;
mod options;
mod registry;
mod wakerset;
mod window;

pub use batch::{BatchFn, BatchFuture, FlushFuture};
pub use coordinator::{BatchRules, Coordinator};
pub use error::BatchError;
pub use extract::{KeyFn, KeyedEntry};
pub use options::BatchOptions;
pub use registry::{Registry, RegistryCall, RegistryFetch, RunFuture};
pub use window::{tick, Tick, Window, YieldNow};
