//! Outbound connections to peer server processes
//!
//! One [`PeerClient`] per peer address, created on first use and evicted when
//! a send fails so the next send dials afresh.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use quinn::Endpoint;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, ClientEvent, RelayClient};
use crate::config::PeerConfig;
use crate::error::{RelayError, Result};
use crate::protocol::handshake::SERVICE_AUTH_METHOD;
use crate::protocol::message::{FrameType, Message};
use crate::transport::tls::client_endpoint;

/// Authenticated service connection to one peer
pub struct PeerClient {
    addr: String,
    client: RelayClient,
}

impl PeerClient {
    async fn connect(endpoint: &Endpoint, addr: &str, config: &PeerConfig) -> Result<Self> {
        let server_addr = resolve(addr).await?;

        let client_config = ClientConfig {
            server_addr,
            connect_timeout: config.connect_timeout(),
            keep_alive: config.keep_alive(),
            idle_timeout: config.idle_timeout(),
            max_message_size: config.max_message_size,
            auth_method: SERVICE_AUTH_METHOD.to_string(),
            credentials: config.service_token.clone(),
            auto_ack: false,
            ..ClientConfig::default()
        };

        let (client, mut events) = RelayClient::connect_with(endpoint, client_config)
            .await
            .map_err(|e| RelayError::peer_unreachable(format!("{}: {}", addr, e)))?;

        let peer = addr.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ClientEvent::Message(msg) if msg.frame_type == FrameType::Err => {
                        warn!("Peer {} rejected a relayed frame: {:?}", peer, msg.data);
                    }
                    ClientEvent::Message(_) => {}
                    ClientEvent::Disconnected(reason) => {
                        debug!("Peer {} disconnected: {}", peer, reason);
                        break;
                    }
                }
            }
        });

        info!("Opened peer connection to {}", addr);
        Ok(Self {
            addr: addr.to_string(),
            client,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        self.client.send(msg).await
    }

    async fn close(&self) {
        self.client.close("peer pool closed").await;
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| RelayError::peer_unreachable(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| RelayError::peer_unreachable(format!("{}: no address", addr)))
}

type PeerSlot = Arc<OnceCell<Arc<PeerClient>>>;

/// Lazily populated cache of peer clients keyed by address
pub struct PeerPool {
    config: PeerConfig,
    endpoint: OnceCell<Endpoint>,
    clients: DashMap<String, PeerSlot>,
}

impl PeerPool {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            endpoint: OnceCell::new(),
            clients: DashMap::new(),
        }
    }

    async fn endpoint(&self) -> Result<&Endpoint> {
        self.endpoint
            .get_or_try_init(|| async {
                let settings = self.config.transport_settings();
                client_endpoint(SocketAddr::from(([0u8; 4], 0)), &settings)
            })
            .await
    }

    /// Cached client for `addr`, dialing if none exists or the cached one closed
    pub async fn get_or_create(&self, addr: &str) -> Result<Arc<PeerClient>> {
        for _ in 0..2 {
            let slot = self
                .clients
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let endpoint = self.endpoint().await?;
            let result = slot
                .get_or_try_init(|| async {
                    PeerClient::connect(endpoint, addr, &self.config)
                        .await
                        .map(Arc::new)
                })
                .await;

            match result {
                Ok(client) if !client.is_closed() => return Ok(client.clone()),
                Ok(_) => {
                    debug!("Cached peer client for {} is closed", addr);
                    self.evict_slot(addr, &slot);
                }
                Err(e) => {
                    self.evict_slot(addr, &slot);
                    return Err(e);
                }
            }
        }

        Err(RelayError::peer_unreachable(format!(
            "{}: connection closed immediately",
            addr
        )))
    }

    /// Send one frame to the peer at `addr`. Transport failures evict the
    /// cached client; an oversized frame is refused before it is written.
    pub async fn send(&self, addr: &str, msg: &Message) -> Result<()> {
        let client = self.get_or_create(addr).await?;

        let result = tokio::time::timeout(self.config.send_timeout(), client.send(msg))
            .await
            .map_err(|_| RelayError::timeout("peer send timed out"))
            .and_then(|sent| sent);

        match result {
            Ok(()) => Ok(()),
            Err(e @ RelayError::MessageTooLarge(_)) => Err(e),
            Err(e) => {
                warn!("Send to peer {} failed: {}", addr, e);
                self.evict_client(addr, &client);
                Err(RelayError::peer_unreachable(format!("{}: {}", addr, e)))
            }
        }
    }

    pub fn evict(&self, addr: &str) {
        self.clients.remove(addr);
    }

    /// Evict `addr` only while it still caches `client`, so a concurrent
    /// redial is not thrown away
    fn evict_client(&self, addr: &str, client: &Arc<PeerClient>) {
        self.clients.remove_if(addr, |_, slot| {
            slot.get().is_some_and(|cached| Arc::ptr_eq(cached, client))
        });
    }

    /// Whether a live client for `addr` is cached
    pub fn is_connected(&self, addr: &str) -> bool {
        self.clients
            .get(addr)
            .and_then(|slot| slot.get().map(|client| !client.is_closed()))
            .unwrap_or(false)
    }

    fn evict_slot(&self, addr: &str, slot: &PeerSlot) {
        self.clients
            .remove_if(addr, |_, current| Arc::ptr_eq(current, slot));
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close every cached client and the shared endpoint
    pub async fn close(&self) {
        let slots: Vec<PeerSlot> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.clients.clear();

        for slot in slots {
            if let Some(client) = slot.get() {
                client.close().await;
            }
        }

        if let Some(endpoint) = self.endpoint.get() {
            endpoint.close(0u32.into(), b"shutdown");
        }
    }
}
