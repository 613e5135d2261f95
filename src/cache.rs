//! Explicit derived index from equipment name to id.
//!
//! This is derived data, never the source of truth: every operation that
//! mutates the underlying equipment collection must call `invalidate` (or
//! `put` with the fresh value) so readers cannot observe a stale mapping.

use dashmap::DashMap;
use ulid::Ulid;

#[derive(Default)]
pub struct LookupCache {
    entries: DashMap<String, Ulid>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Ulid> {
        self.entries.get(name).map(|e| *e.value())
    }

    pub fn put(&self, name: &str, id: Ulid) {
        self.entries.insert(name.to_string(), id);
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.remove(name);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
