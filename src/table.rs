//! In-process route table
//!
//! Authoritative view of the routes this process has committed to the
//! routing store. The reconciler updates it only after a confirmed write,
//! so it never needs to consult the store to answer reads.

use crate::route::Route;
use parking_lot::RwLock;
use std::collections::HashMap;

struct Entry {
    seq: u64,
    route: Route,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Thread-safe route cache preserving insertion order
///
/// A single lock guards the whole map so a `list` never observes a
/// partially applied `upsert`.
#[derive(Default)]
pub struct RouteTable {
    inner: RwLock<Inner>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a route, returning the previous value
    ///
    /// A replaced route keeps its list position and original `created_at`.
    pub fn upsert(&self, route: Route) -> Option<Route> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(&route.id) {
            let created_at = entry.route.created_at;
            let previous = std::mem::replace(&mut entry.route, route);
            entry.route.created_at = created_at;
            return Some(previous);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(route.id.clone(), Entry { seq, route });
        None
    }

    /// Remove a route; returns whether it was present
    pub fn delete(&self, id: &str) -> bool {
        self.inner.write().entries.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Route> {
        self.inner.read().entries.get(id).map(|e| e.route.clone())
    }

    /// All routes in insertion order
    pub fn list(&self) -> Vec<Route> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.route.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
