//! Concurrent routing table
//!
//! The single source of truth for where each app currently serves from.
//! Writers perform one atomic replace per swap, so a reader never observes a
//! half-updated entry; only a successful deploy sets an entry and only
//! stop/delete removes one.

use dashmap::DashMap;

#[derive(Default)]
pub struct RoutingTable {
    entries: DashMap<String, String>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point an app at a new target base URL (atomic replace)
    pub fn set(&self, name: &str, target: String) {
        self.entries.insert(name.to_string(), target);
    }

    pub fn remove(&self, name: &str) {
        self.entries.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
