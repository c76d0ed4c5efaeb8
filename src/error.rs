use thiserror::Error;

/// The failure delivered to every waiter of a batch that did not complete
/// successfully.
///
/// Failures are batch-scoped: if any of these is produced, every future
/// whose key belongs to the batch resolves with a clone of the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError<E> {
    /// The fetch function itself returned an error.
    #[error("batch fetch failed: {0}")]
    Fetch(E),

    /// The fetch function returned a different number of items than the
    /// number of keys it was given. Only produced when items are paired with
    /// keys by position.
    #[error("batch fetch returned {actual} items for {expected} keys")]
    CountMismatch { expected: usize, actual: usize },

    /// The extraction policy mapped the item at `position` to a key that
    /// wasn't part of the batch.
    #[error("item {position} of the batch result answers a key that was not requested")]
    UnknownKey { position: usize },

    /// The extraction policy mapped the item at `position` to a key that an
    /// earlier item already answered.
    #[error("item {position} of the batch result answers an already answered key")]
    DuplicateKey { position: usize },

    /// No item in the result answered the key at `index`.
    #[error("no item in the batch result answers key {index}")]
    MissingKey { index: usize },
}

impl<E> BatchError<E> {
    /// True if this failure came from the fetch function, rather than from
    /// validating its result.
    pub fn is_fetch(&self) -> bool {
        matches!(self, BatchError::Fetch(..))
    }
}
