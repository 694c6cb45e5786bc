//! Method lookup table.
//!
//! Lookups happen on every inbound request, from every reactor thread, and
//! take no lock: readers load the current immutable snapshot. Registration
//! copies the map, changes the copy and swaps it in.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::protocol::method::Method;

type MethodMap = BTreeMap<String, Arc<Method>>;

/// Copy-on-write registry of methods, keyed by name.
pub struct MethodRegistry {
    methods: ArcSwap<MethodMap>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: ArcSwap::from_pointee(MethodMap::new()),
        }
    }

    /// Add or replace a method. Returns the method it replaced, if any.
    pub fn register(&self, method: Method) -> Option<Arc<Method>> {
        let method = Arc::new(method);
        let mut replaced = None;
        self.methods.rcu(|current| {
            let mut next = MethodMap::clone(current);
            replaced = next.insert(method.name().to_string(), method.clone());
            next
        });
        debug!(method = method.name(), replaced = replaced.is_some(), "Method registered");
        replaced
    }

    /// Remove a method by name.
    pub fn unregister(&self, name: &str) -> Option<Arc<Method>> {
        let mut removed = None;
        self.methods.rcu(|current| {
            let mut next = MethodMap::clone(current);
            removed = next.remove(name);
            next
        });
        removed
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.load().get(name).cloned()
    }

    /// Current methods, sorted by name.
    pub fn snapshot(&self) -> Vec<Arc<Method>> {
        self.methods.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.methods.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.load().is_empty()
    }
}
