//! Agent-side resource store: the authoritative in-memory set of one
//! resource kind for one cluster, with change-significance detection.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};

use argus_core::{IdentitySet, Observed};
use rustc_hash::FxHashMap;

/// Concurrent store of normalized wraps, keyed by identity.
///
/// Reads take the shared side of the lock, mutations the exclusive side;
/// the lock is never held across I/O. Records are handed out as `Arc`
/// snapshots, so a reader can never observe a half-written record: an
/// upsert replaces the slot wholesale or not at all.
pub struct ResourceStore<T> {
    inner: RwLock<FxHashMap<String, Arc<T>>>,
}

impl<T> Default for ResourceStore<T> {
    fn default() -> Self {
        Self { inner: RwLock::new(FxHashMap::default()) }
    }
}

impl<T: Observed> ResourceStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `item`'s identity.
    ///
    /// Returns true when the identity is newly seen or the derived
    /// comparison set differs from the prior record's, i.e. when the change
    /// is worth forwarding. A raw-payload change in untracked fields
    /// returns false.
    pub fn upsert(&self, item: T) -> bool {
        let item = Arc::new(item);
        let prior = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            map.insert(item.identity().to_string(), Arc::clone(&item))
        };
        match prior {
            Some(old) => !item.derived_matches(&old),
            None => true,
        }
    }

    /// Removes the record for `identity`. Removing an absent identity is a
    /// no-op.
    pub fn remove(&self, identity: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(identity);
    }

    pub fn get(&self, identity: &str) -> Option<Arc<T>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(identity).cloned()
    }

    /// Point-in-time snapshot of all current records, unordered.
    pub fn list(&self) -> Vec<Arc<T>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }

    /// The current authoritative identity set, used to answer reconcile
    /// requests.
    pub fn identities(&self) -> IdentitySet {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Wrap {
        id: String,
        derived: Vec<u32>,
        payload: serde_json::Value,
    }

    impl Wrap {
        fn new(id: &str, derived: &[u32]) -> Self {
            Self {
                id: id.to_string(),
                derived: derived.to_vec(),
                payload: serde_json::json!({ "name": id }),
            }
        }
    }

    impl Observed for Wrap {
        fn identity(&self) -> &str {
            &self.id
        }

        fn derived_matches(&self, prior: &Self) -> bool {
            self.derived == prior.derived
        }

        fn payload(&self) -> &serde_json::Value {
            &self.payload
        }
    }

    #[test]
    fn first_upsert_is_significant() {
        let store = ResourceStore::new();
        assert!(store.upsert(Wrap::new("a", &[1, 2])));
    }

    #[test]
    fn equal_derived_set_is_not_significant() {
        let store = ResourceStore::new();
        assert!(store.upsert(Wrap::new("a", &[1, 2])));
        assert!(!store.upsert(Wrap::new("a", &[1, 2])));
    }

    #[test]
    fn grown_derived_set_is_significant() {
        let store = ResourceStore::new();
        store.upsert(Wrap::new("a", &[1]));
        assert!(store.upsert(Wrap::new("a", &[1, 2])));
        assert_eq!(store.get("a").unwrap().derived, vec![1, 2]);
    }

    #[test]
    fn replacement_is_wholesale() {
        let store = ResourceStore::new();
        store.upsert(Wrap::new("a", &[1, 2, 3]));
        store.upsert(Wrap::new("a", &[9]));
        assert_eq!(store.get("a").unwrap().derived, vec![9]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = ResourceStore::new();
        store.upsert(Wrap::new("a", &[1]));
        store.remove("a");
        store.remove("a");
        store.remove("never-existed");
        assert!(store.get("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn identities_reflect_last_mutation() {
        let store = ResourceStore::new();
        store.upsert(Wrap::new("a", &[1]));
        store.upsert(Wrap::new("b", &[2]));
        store.upsert(Wrap::new("c", &[3]));
        store.remove("b");
        let ids: Vec<_> = store.identities().into_iter().collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn concurrent_upserts_on_distinct_identities() {
        let store = Arc::new(ResourceStore::new());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u32 {
                    let id = format!("{t}-{i}");
                    store.upsert(Wrap::new(&id, &[t, i]));
                    if i % 2 == 0 {
                        store.remove(&id);
                    }
                }
            }));
        }
        // Readers run alongside the writers; every record they see must be
        // fully formed.
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    for wrap in store.list() {
                        assert_eq!(wrap.derived.len(), 2);
                        assert!(!wrap.identity().is_empty());
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Odd indices survive, even ones were removed.
        assert_eq!(store.len(), 8 * 50);
        for wrap in store.list() {
            let i: u32 = wrap.id.split('-').nth(1).unwrap().parse().unwrap();
            assert_eq!(i % 2, 1);
        }
    }
}
