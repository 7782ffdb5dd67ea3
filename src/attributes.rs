//! Cross-cutting scratch state for user code and listeners.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

/// A thread-safe, string-keyed bag of opaque values.
///
/// Listeners and test code can stash state here without the core knowing
/// its shape; values are carried as [`serde_json::Value`].
///
/// # Example
///
/// ```
/// use drover::attributes::Attributes;
/// use serde_json::json;
///
/// let attrs = Attributes::new();
/// attrs.set("build", json!("1.4.2"));
/// assert_eq!(attrs.get("build"), Some(json!("1.4.2")));
/// ```
#[derive(Debug, Default)]
pub struct Attributes {
    inner: RwLock<HashMap<String, Value>>,
}

impl Attributes {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, returning the previous one if present.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner
            .write()
            .ok()
            .and_then(|mut map| map.insert(key.into(), value))
    }

    /// Returns a clone of the stored value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(key).cloned())
    }

    /// Removes and returns the stored value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().ok().and_then(|mut map| map.remove(key))
    }

    /// All keys currently present, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}
