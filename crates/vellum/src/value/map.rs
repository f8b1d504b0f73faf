//! Map values behind a provider contract, mirroring the list side. Owned
//! maps preserve insertion order; reflected adapters expose external data
//! (host structs, parsed JSON) without copying it into the engine.

use crate::value::{KeyValuePair, Value, ValuesMap};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Contract every map implementation satisfies
pub trait MapProvider: Send + Sync {
    fn size(&self) -> usize;

    fn contains(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<Value>;

    /// Key list in stable (insertion) order
    fn keys(&self) -> Vec<String>;

    /// Optional mutation. Providers that don't support it report failure.
    fn set(&self, _key: String, _value: Value) -> bool {
        false
    }

    /// See [ListProvider::extend_lifetime](super::ListProvider)
    fn extend_lifetime(&self) -> bool {
        false
    }
}

/// A map value: a shared handle to some [MapProvider]
#[derive(Clone)]
pub struct Map(Arc<dyn MapProvider>);

impl Map {
    pub fn new(provider: impl MapProvider + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub fn from_values(values: ValuesMap) -> Self {
        Self::new(OwnedMap(values))
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys()
    }

    pub fn set(&self, key: String, value: Value) -> bool {
        self.0.set(key, value)
    }

    pub fn extend_lifetime(&self) -> bool {
        self.0.extend_lifetime()
    }

    /// Iterate entries as key-value pairs, in the provider's stable order
    pub fn iter_pairs(&self) -> impl Iterator<Item = KeyValuePair> + '_ {
        self.keys().into_iter().map(|key| {
            let value = self.get(&key).unwrap_or_default();
            KeyValuePair { key, value }
        })
    }
}

impl Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter_pairs().map(|pair| (pair.key, pair.value)))
            .finish()
    }
}

/// Equality compares key sets and per-key values; entry order is not
/// significant
impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        if self.size() != other.size() {
            return false;
        }
        self.keys().iter().all(|key| {
            match (self.get(key), other.get(key)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
    }
}

impl From<ValuesMap> for Map {
    fn from(values: ValuesMap) -> Self {
        Self::from_values(values)
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self::from_values(iter.into_iter().collect())
    }
}

/// The common case: a map that owns its entries
struct OwnedMap(ValuesMap);

impl MapProvider for OwnedMap {
    fn size(&self) -> usize {
        self.0.len()
    }

    fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    #[test]
    fn test_owned_map() {
        let map = Map::from_values(indexmap! {
            "b".to_owned() => Value::Int(2),
            "a".to_owned() => Value::Int(1),
        });
        assert_eq!(map.size(), 2);
        assert!(map.contains("a"));
        assert!(!map.contains("c"));
        assert_eq!(map.get("b"), Some(Value::Int(2)));
        // Insertion order is preserved
        assert_eq!(map.keys(), vec!["b".to_owned(), "a".to_owned()]);
    }

    #[test]
    fn test_eq_ignores_order() {
        let left = Map::from_values(indexmap! {
            "a".to_owned() => Value::Int(1),
            "b".to_owned() => Value::Int(2),
        });
        let right = Map::from_values(indexmap! {
            "b".to_owned() => Value::Int(2),
            "a".to_owned() => Value::Int(1),
        });
        assert_eq!(left, right);
    }
}
