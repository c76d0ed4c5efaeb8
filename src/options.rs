use std::num::NonZeroUsize;

/// Tunable behavior of a [`Coordinator`](crate::Coordinator).
///
/// With the `serde` feature enabled this can be loaded from any serde
/// format, alongside the rest of an application's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BatchOptions {
    /// If true, a key that is already owned by a batch that hasn't finished
    /// yet joins that batch instead of being fetched again.
    pub deduplicate: bool,

    /// Maximum number of distinct keys per batch. A batch that reaches this
    /// size is dispatched immediately, without waiting for its window.
    pub max_keys: Option<NonZeroUsize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            deduplicate: true,
            max_keys: None,
        }
    }
}

impl BatchOptions {
    /// True if a batch holding `len` distinct keys may not accept any more.
    pub(crate) fn is_full(&self, len: usize) -> bool {
        match self.max_keys {
            Some(max_keys) => len >= max_keys.get(),
            None => false,
        }
    }
}
