//! List values behind a provider contract. The indirection lets owned
//! vectors, lazily generated sequences and derived views all participate in
//! iteration and subscripting without copying; the `Arc` holding the
//! provider doubles as the lifetime-extension handle for borrowed data.

use crate::{error::ErrorKind, value::Value};
use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex},
};

/// Contract every list implementation satisfies
pub trait ListProvider: Send + Sync {
    /// Number of elements, if known. `None` means the sequence is lazy and
    /// its size can only be discovered by enumeration.
    fn size(&self) -> Option<usize>;

    /// Does this provider support random indexed access?
    fn has_index(&self) -> bool {
        true
    }

    /// Random access by index. `None` for an out-of-range index.
    fn index(&self, idx: usize) -> Option<Value>;

    /// A forward enumerator over the elements. For restartable providers
    /// every call yields a fresh pass; single-pass generators yield their
    /// remaining elements once.
    fn iterate(&self) -> Box<dyn Iterator<Item = Value> + '_>;

    /// Should the renderer keep the originating object alive while derived
    /// values are in flight? Owned providers don't care; borrowing adapters
    /// return true.
    fn extend_lifetime(&self) -> bool {
        false
    }
}

/// A list value: a shared handle to some [ListProvider]
#[derive(Clone)]
pub struct List(Arc<dyn ListProvider>);

impl List {
    pub fn new(provider: impl ListProvider + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(OwnedList(values))
    }

    pub fn size(&self) -> Option<usize> {
        self.0.size()
    }

    pub fn has_index(&self) -> bool {
        self.0.has_index()
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        self.0.iterate()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().collect()
    }

    pub fn extend_lifetime(&self) -> bool {
        self.0.extend_lifetime()
    }

    /// Indexed access with negative indexes counting from the end. Fails if
    /// the provider has no indexer: a lazy sequence is never silently
    /// re-enumerated to emulate one.
    pub fn get_item(&self, idx: i64) -> Result<Value, ErrorKind> {
        if !self.has_index() {
            return Err(ErrorKind::invalid_type(
                "the sequence does not support indexed access",
            ));
        }
        let size = self.size().unwrap_or(0) as i64;
        let effective = if idx < 0 { size + idx } else { idx };
        if effective < 0 {
            return Ok(Value::Empty);
        }
        Ok(self.0.index(effective as usize).unwrap_or_default())
    }
}

impl Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Element-wise equality
impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.size(), other.size())
            && a != b
        {
            return false;
        }
        let mut left = self.iter();
        let mut right = other.iter();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a == b => {}
                _ => return false,
            }
        }
    }
}

impl From<Vec<Value>> for List {
    fn from(values: Vec<Value>) -> Self {
        Self::from_values(values)
    }
}

impl FromIterator<Value> for List {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self::from_values(iter.into_iter().collect())
    }
}

/// The common case: a list that owns its elements
struct OwnedList(Vec<Value>);

impl ListProvider for OwnedList {
    fn size(&self) -> Option<usize> {
        Some(self.0.len())
    }

    fn index(&self, idx: usize) -> Option<Value> {
        self.0.get(idx).cloned()
    }

    fn iterate(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        Box::new(self.0.iter().cloned())
    }
}

/// A lazily generated sequence. The enumerator is single-pass: once
/// consumed, further iteration yields nothing, and indexed access is never
/// available.
pub struct GeneratorList {
    generator: Mutex<Option<Box<dyn Iterator<Item = Value> + Send>>>,
}

impl GeneratorList {
    pub fn new(
        generator: impl Iterator<Item = Value> + Send + 'static,
    ) -> Self {
        Self {
            generator: Mutex::new(Some(Box::new(generator))),
        }
    }
}

impl ListProvider for GeneratorList {
    fn size(&self) -> Option<usize> {
        None
    }

    fn has_index(&self) -> bool {
        false
    }

    fn index(&self, _idx: usize) -> Option<Value> {
        None
    }

    fn iterate(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        match self.generator.lock().expect("generator lock poisoned").take() {
            Some(generator) => generator,
            None => Box::new(std::iter::empty()),
        }
    }
}

/// A read-only derived view: each element of the base list projected
/// through an attribute subscript. Produced by `sum(attribute=...)` and
/// friends.
pub struct SubscriptedList {
    base: List,
    attribute: Value,
}

impl SubscriptedList {
    pub fn new(base: List, attribute: Value) -> Self {
        Self { base, attribute }
    }

    fn project(&self, value: Value) -> Value {
        super::subscript(&value, &self.attribute).unwrap_or_default()
    }
}

impl ListProvider for SubscriptedList {
    fn size(&self) -> Option<usize> {
        self.base.size()
    }

    fn has_index(&self) -> bool {
        self.base.has_index()
    }

    fn index(&self, idx: usize) -> Option<Value> {
        self.base.0.index(idx).map(|value| self.project(value))
    }

    fn iterate(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        Box::new(self.base.iter().map(|value| self.project(value)))
    }

    fn extend_lifetime(&self) -> bool {
        self.base.extend_lifetime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vellum_util::assert_err;

    fn list(values: Vec<i64>) -> List {
        List::from_values(values.into_iter().map(Value::Int).collect())
    }

    #[rstest]
    #[case::first(0, Value::Int(10))]
    #[case::last(2, Value::Int(30))]
    #[case::negative(-1, Value::Int(30))]
    #[case::out_of_range(5, Value::Empty)]
    #[case::negative_out_of_range(-5, Value::Empty)]
    fn test_get_item(#[case] idx: i64, #[case] expected: Value) {
        let list = list(vec![10, 20, 30]);
        assert_eq!(list.get_item(idx).unwrap(), expected);
    }

    /// A generator yields its elements once, and never supports indexing
    #[test]
    fn test_generator_single_pass() {
        let list = List::new(GeneratorList::new(
            (0..3).map(Value::from),
        ));
        assert_eq!(list.size(), None);
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec![Value::Int(0), Value::Int(1), Value::Int(2)]
        );
        assert_eq!(list.iter().count(), 0);
        assert_err!(
            list.get_item(0).map_err(ErrorKind::into_error),
            "does not support indexed access"
        );
    }

    #[test]
    fn test_subscripted_view() {
        let base = List::from_values(vec![
            Value::from(vec![("n", 1)]),
            Value::from(vec![("n", 2)]),
        ]);
        let view = List::new(SubscriptedList::new(base, Value::from("n")));
        assert_eq!(
            view.iter().collect::<Vec<_>>(),
            vec![Value::Int(1), Value::Int(2)]
        );
        assert_eq!(view.get_item(1).unwrap(), Value::Int(2));
    }
}
