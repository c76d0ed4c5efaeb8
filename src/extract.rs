//! Key-extraction policies.
//!
//! By default, the items returned by a fetch function are paired with its
//! keys by position. When a data source can't promise to preserve order, an
//! extraction policy recovers each item's key from the item itself.

/// A pure function recovering the key an item answers. It is called once per
/// item per batch, and must be deterministic.
pub type KeyFn<Key, Value> = Box<dyn Fn(&Value) -> Key + Send + Sync>;

/// Trait for items that carry their own key. Implementing it allows
/// [`BatchRules::keyed`](crate::BatchRules::keyed) to build the extraction
/// policy for you.
///
/// ```
/// use tickloader::KeyedEntry;
///
/// struct UserData {
///     username: String,
///     age: u16,
/// }
///
/// impl KeyedEntry<String> for UserData {
///     fn get_key(&self) -> &String {
///         &self.username
///     }
/// }
/// ```
pub trait KeyedEntry<Key> {
    fn get_key(&self) -> &Key;
}

impl<Key, Value> KeyedEntry<Key> for (Key, Value) {
    fn get_key(&self) -> &Key {
        &self.0
    }
}

pub(crate) fn keyed<Key, Value>() -> KeyFn<Key, Value>
where
    Key: Clone + 'static,
    Value: KeyedEntry<Key> + 'static,
{
    Box::new(|value: &Value| value.get_key().clone())
}
