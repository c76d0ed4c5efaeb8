//! Data structures for passing keys into a batch fetch and distributing the
//! resulting values back out to the waiting futures.

use std::hash::Hash;
use std::iter;
use std::mem;

use indexmap::IndexSet;

use crate::{error::BatchError, extract::KeyFn};

/// Handle to a key's position in a [`KeySet`]. Each waiting future holds one
/// and uses it to pull its value out of the [`ValueSet`] once the batch is
/// complete. Several futures may hold the same token when they requested the
/// same key.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(usize);

/// The keys collected by a batch, in first-insertion order.
///
/// Keys are never removed once added; a token is simply the index of its key,
/// so it stays valid for the whole life of the batch.
#[derive(Debug)]
pub(crate) struct KeySet<Key> {
    keys: IndexSet<Key>,
}

impl<Key> Default for KeySet<Key> {
    fn default() -> Self {
        Self {
            keys: IndexSet::default(),
        }
    }
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// key. Adding a key that is already present returns the existing token
    /// and discards the new copy.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let (index, _inserted) = self.keys.insert_full(key);
        Token(index)
    }

    /// Look up the token of a key already in this set.
    pub(crate) fn token_of(&self, key: &Key) -> Option<Token> {
        self.keys.get_index_of(key).map(Token)
    }

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Helper method for when the batch transitions out
    /// of an accumulating state.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Key> {
        self.keys.iter()
    }

    /// Pair the items returned by a fetch with the keys of this set. Without
    /// an extractor, the items must be in key order, one per key; with one,
    /// each item is matched to the key it reports, and the reported keys
    /// must be exactly this set.
    pub(crate) fn pair<Value, Error>(
        &self,
        items: Vec<Value>,
        extractor: Option<&KeyFn<Key, Value>>,
    ) -> Result<ValueSet<Value>, BatchError<Error>> {
        let extractor = match extractor {
            Some(extractor) => extractor,
            None if items.len() == self.len() => return Ok(ValueSet { values: items }),
            None => {
                return Err(BatchError::CountMismatch {
                    expected: self.len(),
                    actual: items.len(),
                })
            }
        };

        // Surplus items answer an unknown or already answered key; missing
        // ones leave an empty slot.
        let mut slots: Vec<Option<Value>> = iter::repeat_with(|| None).take(self.len()).collect();

        for (position, item) in items.into_iter().enumerate() {
            let key = extractor(&item);
            let index = self
                .keys
                .get_index_of(&key)
                .ok_or(BatchError::UnknownKey { position })?;

            let slot = &mut slots[index];
            if slot.is_some() {
                return Err(BatchError::DuplicateKey { position });
            }
            *slot = Some(item);
        }

        let values = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(BatchError::MissingKey { index }))
            .collect::<Result<Vec<Value>, _>>()?;

        Ok(ValueSet { values })
    }
}

impl<Key: Clone> KeySet<Key> {
    /// Copy the keys out, in order, for handing to the fetch function.
    pub(crate) fn to_vec(&self) -> Vec<Key> {
        self.keys.iter().cloned().collect()
    }
}

/// The successful result of a batch: one value per key, in key order. It is
/// kept for as long as any future (or flush) still references the batch, and
/// values are cloned out of it on request.
#[derive(Debug)]
pub(crate) struct ValueSet<Value> {
    values: Vec<Value>,
}

impl<Value: Clone> ValueSet<Value> {
    /// Get the value associated with a token.
    pub(crate) fn get(&self, token: Token) -> Value {
        // Every token was handed out by the KeySet this ValueSet was paired
        // against, and pairing guarantees one value per key.
        self.values[token.0].clone()
    }

    /// All of the values, in the insertion order of their keys.
    pub(crate) fn to_vec(&self) -> Vec<Value> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyset(keys: &[&'static str]) -> KeySet<&'static str> {
        let mut set = KeySet::new();
        keys.iter().for_each(|&key| {
            set.add_key(key);
        });
        set
    }

    fn by_first_char() -> KeyFn<&'static str, String> {
        Box::new(|value: &String| match value.as_bytes()[0] {
            b'a' => "a",
            b'b' => "b",
            _ => "?",
        })
    }

    #[test]
    fn duplicate_keys_share_a_token() {
        let mut set = KeySet::new();
        let first = set.add_key("a");
        let second = set.add_key("b");
        let again = set.add_key("a");

        assert_eq!(first, again);
        assert_ne!(first, second);
        assert_eq!(set.len(), 2);
        assert_eq!(set.to_vec(), vec!["a", "b"]);
    }

    #[test]
    fn positional_pairing() {
        let set = keyset(&["a", "b"]);
        let values = set
            .pair::<_, ()>(vec![1, 2], None)
            .expect("pairing should succeed");

        assert_eq!(values.get(set.token_of(&"b").unwrap()), 2);
        assert_eq!(values.to_vec(), vec![1, 2]);
    }

    #[test]
    fn count_mismatch() {
        let set = keyset(&["a", "b"]);
        let err = set.pair::<_, ()>(vec![1], None).unwrap_err();

        assert_eq!(
            err,
            BatchError::CountMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn extracted_pairing_reorders() {
        let set = keyset(&["a", "b"]);
        let extractor = by_first_char();
        let values = set
            .pair::<_, ()>(
                vec!["b-value".to_string(), "a-value".to_string()],
                Some(&extractor),
            )
            .expect("pairing should succeed");

        assert_eq!(values.to_vec(), vec!["a-value", "b-value"]);
    }

    #[test]
    fn extracted_unknown_key() {
        let set = keyset(&["a", "b"]);
        let extractor = by_first_char();
        let err = set
            .pair::<_, ()>(vec!["a".to_string(), "z".to_string()], Some(&extractor))
            .unwrap_err();

        assert_eq!(err, BatchError::UnknownKey { position: 1 });
    }

    #[test]
    fn extracted_missing_key() {
        let set = keyset(&["a", "b"]);
        let extractor = by_first_char();
        let err = set
            .pair::<_, ()>(vec!["b".to_string()], Some(&extractor))
            .unwrap_err();

        assert_eq!(err, BatchError::MissingKey { index: 0 });
    }

    #[test]
    fn extracted_duplicate_key() {
        let set = keyset(&["a", "b"]);
        let extractor = by_first_char();
        let err = set
            .pair::<_, ()>(vec!["a1".to_string(), "a2".to_string()], Some(&extractor))
            .unwrap_err();

        assert_eq!(err, BatchError::DuplicateKey { position: 1 });
    }
}
