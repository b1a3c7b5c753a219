//! Per-test runtime state.
//!
//! Each test workflow owns one [`StateMap`]. Save rules append to it in step
//! order; activities never see the live map, only a [`StateSnapshot`] frozen
//! at invocation. Insertion order is preserved so that re-serialized state
//! reads in the order it was written.

use indexmap::IndexMap;
use serde_json::Value;

/// Ordered mapping from variable name to value, owned by a single test
/// workflow (or by the suite workflow for suite-level hooks).
#[derive(Debug, Clone, Default)]
pub struct StateMap {
    entries: IndexMap<String, Value>,
}

impl StateMap {
    /// Creates an empty state map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a variable. Later writes win.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    /// Bulk insert, preserving the iteration order of `entries`.
    pub fn extend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (name, value) in entries {
            self.entries.insert(name, value);
        }
    }

    /// Looks up a variable by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Number of variables currently set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no variable has been written yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freezes the current contents into an immutable snapshot for an
    /// activity invocation.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            entries: self.entries.clone(),
        }
    }
}

/// Immutable view of a [`StateMap`] taken at an activity boundary.
///
/// Passed by value into plugin activities; mutations made by the activity are
/// returned as save results and applied by the runtime, never written here.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    entries: IndexMap<String, Value>,
}

impl StateSnapshot {
    /// Looks up a variable by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Resolves a dotted path: the first segment names a variable, the rest
    /// navigate into its JSON value (object keys and array indices).
    pub fn lookup_path(&self, segments: &[&str]) -> Option<&Value> {
        let (first, rest) = segments.split_first()?;
        let mut current = self.entries.get(*first)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// True when the snapshot holds no variables.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
