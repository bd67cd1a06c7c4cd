//! Process-local versioned store

use super::{ResourceStore, StoreError, Version, Versioned};
use crate::codec::{ResourceKey, RoutingResource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory store with per-resource version counters
///
/// Used for standalone runs without a cluster and as the base of test
/// doubles. Versions are strictly increasing across all resources.
#[derive(Default)]
pub struct MemoryStore {
    resources: Mutex<HashMap<ResourceKey, (u64, RoutingResource)>>,
    next_version: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current resource without a version, for inspection
    pub fn snapshot(&self, key: &ResourceKey) -> Option<RoutingResource> {
        self.resources.lock().get(key).map(|(_, r)| r.clone())
    }

    /// Every stored resource
    pub fn resources(&self) -> Vec<RoutingResource> {
        self.resources.lock().values().map(|(_, r)| r.clone()).collect()
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Versioned>, StoreError> {
        Ok(self.resources.lock().get(key).map(|(version, resource)| Versioned {
            resource: resource.clone(),
            version: Version(version.to_string()),
        }))
    }

    async fn conditional_put(
        &self,
        resource: &RoutingResource,
        expected: Option<&Version>,
    ) -> Result<Version, StoreError> {
        let mut resources = self.resources.lock();
        let current = resources.get(&resource.key).map(|(v, _)| v.to_string());

        match (current.as_deref(), expected) {
            (None, None) => {}
            (Some(current), Some(expected)) if current == expected.0 => {}
            _ => return Err(StoreError::Conflict),
        }

        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        resources.insert(resource.key.clone(), (version, resource.clone()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Version(version.to_string()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::new("jhub", "jupyter.example.com", "gw", "jupyter")
    }

    #[tokio::test]
    async fn test_get_absent() {
        let store = MemoryStore::new();
        assert!(store.get(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let store = MemoryStore::new();
        let resource = RoutingResource::empty(key());

        let v1 = store.conditional_put(&resource, None).await.unwrap();
        let fetched = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(fetched.version, v1);

        let v2 = store.conditional_put(&resource, Some(&v1)).await.unwrap();
        assert_ne!(v1, v2);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStore::new();
        let resource = RoutingResource::empty(key());

        let v1 = store.conditional_put(&resource, None).await.unwrap();
        store.conditional_put(&resource, Some(&v1)).await.unwrap();

        let stale = store.conditional_put(&resource, Some(&v1)).await;
        assert!(matches!(stale, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn test_create_existing_conflicts() {
        let store = MemoryStore::new();
        let resource = RoutingResource::empty(key());

        store.conditional_put(&resource, None).await.unwrap();
        let again = store.conditional_put(&resource, None).await;
        assert!(matches!(again, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn test_update_missing_conflicts() {
        let store = MemoryStore::new();
        let resource = RoutingResource::empty(key());

        let result = store
            .conditional_put(&resource, Some(&Version("1".to_string())))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }
}
