//! Small helpers shared across the Vellum crates. The main purpose of this
//! crate is to keep cross-cutting utilities (label tables, test assertion
//! macros) out of the engine crate, which changes much more often.
//!
//! **This crate is not semver compliant**. The version is locked to the root
//! `vellum` crate version.

#[cfg(any(test, feature = "test"))]
mod test_util;

use std::fmt::Debug;

/// A static mapping between values (of type `T`) and labels (strings). Used
/// to both stringify from and parse to `T`. Lookups are linear; tables are
/// expected to be small and fixed at compile time.
pub struct Mapping<'a, T: Copy>(&'a [(T, &'a [&'a str])]);

impl<'a, T: Copy> Mapping<'a, T> {
    /// Construct a new mapping
    pub const fn new(mapping: &'a [(T, &'a [&'a str])]) -> Self {
        Self(mapping)
    }

    /// Get a value by one of its labels
    pub fn get(&self, s: &str) -> Option<T> {
        for (value, labels) in self.0 {
            for label in *labels {
                if *label == s {
                    return Some(*value);
                }
            }
        }
        None
    }

    /// Get the label mapped to a value. If it has multiple labels, use the
    /// first. Panic if the value has no mapped labels. The label borrows
    /// from the table itself, so a `'static` table yields `'static`
    /// labels.
    pub fn get_label(&self, value: T) -> &'a str
    where
        T: Debug + PartialEq,
    {
        let (_, labels) = self
            .0
            .iter()
            .find(|(v, _)| v == &value)
            .unwrap_or_else(|| panic!("Unknown value {value:?}"));
        labels
            .first()
            .copied()
            .unwrap_or_else(|| panic!("No mapped labels for value {value:?}"))
    }

    /// Get all available mapped labels, in table order
    pub fn all_labels(&self) -> impl Iterator<Item = &'a str> {
        let entries = self.0;
        entries.iter().flat_map(|(_, labels)| labels.iter().copied())
    }
}
