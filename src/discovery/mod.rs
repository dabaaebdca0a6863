//! Discovery and binding service
//!
//! Answers "which process serves user U" and relays frames to that process.
//! [`NoopDiscovery`] serves single-process deployments; [`StoreDiscovery`]
//! keeps bindings in a [`BindingStore`] shared by the whole cluster.

pub mod peer;
pub mod redis_store;
pub mod store;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, DiscoveryKind, PeerConfig};
use crate::error::{RelayError, Result};
use crate::protocol::message::{Message, UserId};

pub use peer::{PeerClient, PeerPool};
pub use redis_store::RedisStore;
pub use store::{BindingStore, MemoryStore, StoreKeys};

/// The four operations the router depends on
#[async_trait]
pub trait Discover: Send + Sync + 'static {
    /// Announce this process at `addr`. Best effort and repeatable.
    async fn register(&self, addr: &str) -> Result<()>;

    /// Bind `user_id` to this process
    async fn bound_user(&self, user_id: &str) -> Result<()>;

    /// Remove the binding of `user_id` if it still points here
    async fn relieve_user(&self, user_id: &str) -> Result<()>;

    /// Relay `msg` to the process serving each target. Every target is
    /// attempted; the first failure is returned.
    async fn transpond(&self, msg: &Message, targets: &[UserId]) -> Result<()>;

    /// Release peer connections and deregister
    async fn close(&self) {}

    /// Outbound peer connections currently cached
    fn peer_count(&self) -> usize {
        0
    }
}

/// Discovery for a single process: every operation succeeds and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDiscovery;

#[async_trait]
impl Discover for NoopDiscovery {
    async fn register(&self, _addr: &str) -> Result<()> {
        Ok(())
    }

    async fn bound_user(&self, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn relieve_user(&self, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn transpond(&self, _msg: &Message, _targets: &[UserId]) -> Result<()> {
        Ok(())
    }
}

/// Discovery backed by a shared binding store and a peer client pool
pub struct StoreDiscovery {
    store: Arc<dyn BindingStore>,
    keys: StoreKeys,
    server_addr: RwLock<Option<String>>,
    peers: PeerPool,
}

impl StoreDiscovery {
    pub fn new(store: Arc<dyn BindingStore>, namespace: &str, peer: PeerConfig) -> Self {
        Self {
            store,
            keys: StoreKeys::new(namespace),
            server_addr: RwLock::new(None),
            peers: PeerPool::new(peer),
        }
    }

    /// Address this process registered under
    pub fn server_addr(&self) -> Option<String> {
        self.server_addr.read().ok().and_then(|addr| addr.clone())
    }

    fn require_addr(&self) -> Result<String> {
        self.server_addr()
            .ok_or_else(|| RelayError::internal("discovery used before register"))
    }

    /// Live process addresses in the service registry
    pub async fn services(&self) -> Result<Vec<String>> {
        self.store.services(&self.keys.services).await
    }

    /// Current binding of `user_id`, if any
    pub async fn lookup(&self, user_id: &str) -> Result<Option<String>> {
        self.store.get_binding(&self.keys.bindings, user_id).await
    }

    pub fn peers(&self) -> &PeerPool {
        &self.peers
    }

    async fn transpond_one(&self, msg: &Message, target: &str, own_addr: &str) -> Result<()> {
        let addr = self
            .lookup(target)
            .await?
            .ok_or_else(|| RelayError::unbound_user(target))?;

        if addr == own_addr {
            // Bound here but not connected here: stale
            debug!("Binding of {} points at this process; treating as unbound", target);
            return Err(RelayError::unbound_user(target));
        }

        debug!("Transponding {} to {} via {}", msg.id, target, addr);
        self.peers
            .send(&addr, &Message::transpond(target, msg.clone()))
            .await
    }
}

#[async_trait]
impl Discover for StoreDiscovery {
    async fn register(&self, addr: &str) -> Result<()> {
        if let Ok(mut current) = self.server_addr.write() {
            *current = Some(addr.to_string());
        }

        let store = self.store.clone();
        let key = self.keys.services.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            match store.add_service(&key, &addr).await {
                Ok(()) => info!("Registered {} in {}", addr, key),
                Err(e) => warn!("Failed to register {}: {}", addr, e),
            }
        });

        Ok(())
    }

    async fn bound_user(&self, user_id: &str) -> Result<()> {
        let addr = self.require_addr()?;

        if self.lookup(user_id).await?.as_deref() == Some(addr.as_str()) {
            return Ok(());
        }

        self.store
            .set_binding(&self.keys.bindings, user_id, &addr)
            .await?;
        debug!("Bound {} to {}", user_id, addr);
        Ok(())
    }

    async fn relieve_user(&self, user_id: &str) -> Result<()> {
        let addr = self.require_addr()?;

        let removed = self
            .store
            .remove_binding_if(&self.keys.bindings, user_id, &addr)
            .await?;
        if removed {
            debug!("Relieved {}", user_id);
        } else {
            debug!("No binding of {} to {} to relieve", user_id, addr);
        }
        Ok(())
    }

    async fn transpond(&self, msg: &Message, targets: &[UserId]) -> Result<()> {
        let own_addr = self.require_addr()?;

        let mut first_error = None;
        for target in targets {
            if let Err(e) = self.transpond_one(msg, target, &own_addr).await {
                debug!("Transpond of {} to {} failed: {}", msg.id, target, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn peer_count(&self) -> usize {
        self.peers.len()
    }

    async fn close(&self) {
        self.peers.close().await;

        if let Some(addr) = self.server_addr() {
            if let Err(e) = self.store.remove_service(&self.keys.services, &addr).await {
                warn!("Failed to deregister {}: {}", addr, e);
            }
        }
    }
}

/// Build the discovery backend selected by configuration
pub async fn from_config(config: &DiscoveryConfig, peer: &PeerConfig) -> Result<Arc<dyn Discover>> {
    match config.kind {
        DiscoveryKind::Noop => Ok(Arc::new(NoopDiscovery)),
        DiscoveryKind::Redis => {
            let store = RedisStore::connect(&config.redis_url).await?;
            Ok(Arc::new(StoreDiscovery::new(
                Arc::new(store),
                &config.namespace,
                peer.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Method, Payload};
    use std::time::Duration;

    const A: &str = "10.0.0.1:9001";
    const B: &str = "10.0.0.2:9001";

    fn discovery(store: &Arc<MemoryStore>) -> StoreDiscovery {
        StoreDiscovery::new(
            store.clone(),
            "test.discover",
            PeerConfig {
                connect_timeout_ms: 100,
                send_timeout_ms: 100,
                ..PeerConfig::default()
            },
        )
    }

    fn chat() -> Message {
        Message::data(Method::ConversationChat, "bob", Payload::Empty)
    }

    #[tokio::test]
    async fn test_never_bound_user_is_unbound() {
        let store = Arc::new(MemoryStore::new());
        let node = discovery(&store);
        node.register(A).await.unwrap();

        let err = node
            .transpond(&chat(), &["ghost".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::unbound_user("ghost"));
    }

    #[tokio::test]
    async fn test_relieve_then_transpond_is_unbound() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        let b = discovery(&store);
        a.register(A).await.unwrap();
        b.register(B).await.unwrap();

        a.bound_user("alice").await.unwrap();
        assert_eq!(b.lookup("alice").await.unwrap().as_deref(), Some(A));

        a.relieve_user("alice").await.unwrap();
        a.relieve_user("alice").await.unwrap();
        assert!(matches!(
            b.transpond(&chat(), &["alice".to_string()]).await,
            Err(RelayError::UnboundUser(_))
        ));
    }

    #[tokio::test]
    async fn test_relieve_keeps_newer_binding() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        let b = discovery(&store);
        a.register(A).await.unwrap();
        b.register(B).await.unwrap();

        a.bound_user("alice").await.unwrap();
        b.bound_user("alice").await.unwrap();
        a.relieve_user("alice").await.unwrap();

        assert_eq!(a.lookup("alice").await.unwrap().as_deref(), Some(B));
    }

    #[tokio::test]
    async fn test_self_binding_is_stale() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        a.register(A).await.unwrap();
        a.bound_user("alice").await.unwrap();

        assert!(matches!(
            a.transpond(&chat(), &["alice".to_string()]).await,
            Err(RelayError::UnboundUser(_))
        ));
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        for _ in 0..5 {
            a.register(A).await.unwrap();
        }

        let mut services = Vec::new();
        for _ in 0..100 {
            services = a.services().await.unwrap();
            if !services.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(services, vec![A.to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_binds_leave_one_binding() {
        let store = Arc::new(MemoryStore::new());
        let a = Arc::new(discovery(&store));
        let b = Arc::new(discovery(&store));
        a.register(A).await.unwrap();
        b.register(B).await.unwrap();

        let (ra, rb) = tokio::join!(
            {
                let a = a.clone();
                async move { a.bound_user("carol").await }
            },
            {
                let b = b.clone();
                async move { b.bound_user("carol").await }
            }
        );
        ra.unwrap();
        rb.unwrap();

        let bound = a.lookup("carol").await.unwrap().unwrap();
        assert!(bound == A || bound == B);
        assert_eq!(b.lookup("carol").await.unwrap().unwrap(), bound);
    }

    #[tokio::test]
    async fn test_store_outage_fails_bind() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        a.register(A).await.unwrap();
        store.set_available(false);

        assert!(matches!(
            a.bound_user("alice").await,
            Err(RelayError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_transpond_tries_every_target() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        a.register(A).await.unwrap();

        let targets = vec!["x".to_string(), "y".to_string()];
        let err = a.transpond(&chat(), &targets).await.unwrap_err();
        assert_eq!(err, RelayError::unbound_user("x"));
    }

    #[tokio::test]
    async fn test_bind_before_register_fails() {
        let store = Arc::new(MemoryStore::new());
        let a = discovery(&store);
        assert!(matches!(
            a.bound_user("alice").await,
            Err(RelayError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_noop_discovery() {
        let noop = NoopDiscovery;
        noop.register(A).await.unwrap();
        noop.bound_user("alice").await.unwrap();
        noop.relieve_user("alice").await.unwrap();
        noop.transpond(&chat(), &["alice".to_string()]).await.unwrap();
        noop.close().await;
        assert_eq!(noop.peer_count(), 0);
    }
}
