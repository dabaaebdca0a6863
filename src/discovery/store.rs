//! Shared binding store abstraction
//!
//! A store holds two structures per namespace: the set of live service
//! addresses and the `user -> address` binding hash.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::error::{RelayError, Result};

/// Key layout inside the shared store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    /// Set of live process addresses
    pub services: String,
    /// Hash of user id to process address
    pub bindings: String,
}

impl StoreKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            services: namespace.to_string(),
            bindings: format!("{}.boundUserKey", namespace),
        }
    }
}

/// Operations the discovery service needs from the shared store
#[async_trait]
pub trait BindingStore: Send + Sync + 'static {
    async fn add_service(&self, key: &str, addr: &str) -> Result<()>;

    async fn remove_service(&self, key: &str, addr: &str) -> Result<()>;

    async fn services(&self, key: &str) -> Result<Vec<String>>;

    async fn get_binding(&self, key: &str, user_id: &str) -> Result<Option<String>>;

    async fn set_binding(&self, key: &str, user_id: &str, addr: &str) -> Result<()>;

    /// Delete the binding only while it still equals `addr`.
    /// Returns whether a binding was removed.
    async fn remove_binding_if(&self, key: &str, user_id: &str, addr: &str) -> Result<bool>;
}

/// In-process store; clones of an `Arc<MemoryStore>` can back several
/// servers running in the same process
#[derive(Debug)]
pub struct MemoryStore {
    sets: DashSet<(String, String)>,
    hashes: DashMap<(String, String), String>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sets: DashSet::new(),
            hashes: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; every operation fails with StoreUnavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::store_unavailable("memory store marked unavailable"))
        }
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn add_service(&self, key: &str, addr: &str) -> Result<()> {
        self.check()?;
        self.sets.insert((key.to_string(), addr.to_string()));
        Ok(())
    }

    async fn remove_service(&self, key: &str, addr: &str) -> Result<()> {
        self.check()?;
        self.sets.remove(&(key.to_string(), addr.to_string()));
        Ok(())
    }

    async fn services(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut members: Vec<String> = self
            .sets
            .iter()
            .filter(|entry| entry.0 == key)
            .map(|entry| entry.1.clone())
            .collect();
        members.sort();
        Ok(members)
    }

    async fn get_binding(&self, key: &str, user_id: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self
            .hashes
            .get(&(key.to_string(), user_id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn set_binding(&self, key: &str, user_id: &str, addr: &str) -> Result<()> {
        self.check()?;
        self.hashes
            .insert((key.to_string(), user_id.to_string()), addr.to_string());
        Ok(())
    }

    async fn remove_binding_if(&self, key: &str, user_id: &str, addr: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .hashes
            .remove_if(&(key.to_string(), user_id.to_string()), |_, bound| {
                bound == addr
            })
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = StoreKeys::new("hermod.ws.discover");
        assert_eq!(keys.services, "hermod.ws.discover");
        assert_eq!(keys.bindings, "hermod.ws.discover.boundUserKey");
    }

    #[tokio::test]
    async fn test_service_set_semantics() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.add_service("ns", "10.0.0.1:9001").await.unwrap();
        }
        store.add_service("other", "10.0.0.9:9001").await.unwrap();
        assert_eq!(store.services("ns").await.unwrap(), vec!["10.0.0.1:9001"]);

        store.remove_service("ns", "10.0.0.1:9001").await.unwrap();
        store.remove_service("ns", "10.0.0.1:9001").await.unwrap();
        assert!(store.services("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_remove() {
        let store = MemoryStore::new();
        store.set_binding("b", "alice", "10.0.0.1:9001").await.unwrap();
        store.set_binding("b", "alice", "10.0.0.2:9001").await.unwrap();

        assert!(!store.remove_binding_if("b", "alice", "10.0.0.1:9001").await.unwrap());
        assert_eq!(
            store.get_binding("b", "alice").await.unwrap().as_deref(),
            Some("10.0.0.2:9001")
        );

        assert!(store.remove_binding_if("b", "alice", "10.0.0.2:9001").await.unwrap());
        assert!(!store.remove_binding_if("b", "alice", "10.0.0.2:9001").await.unwrap());
        assert!(store.get_binding("b", "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outage() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_binding("b", "alice").await,
            Err(RelayError::StoreUnavailable(_))
        ));
        store.set_available(true);
        assert!(store.get_binding("b", "alice").await.unwrap().is_none());
    }
}
