//! Delivery server
//!
//! Accepts QUIC connections, authenticates them, binds users through the
//! discovery service and routes their frames.
//!
//! ## Layout
//!
//! - **Connection handler**: per-connection handshake, read loop and teardown
//! - **Registry**: users attached to this process
//! - **Router**: method dispatch and local-first delivery
//! - **Handlers**: built-in routes

pub mod connection_handler;
pub mod handlers;
pub mod registry;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, SignedTokenAuthenticator};
use crate::config::ServerConfig;
use crate::discovery::{Discover, NoopDiscovery};
use crate::error::{RelayError, Result};
use crate::protocol::message::Method;
use crate::transport::tls::{TransportSettings, server_config};

pub use connection_handler::{ConnectionHandler, ConnectionState};
pub use handlers::{MembershipSource, StaticMembership, default_routes};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outgoing};
pub use router::{Handler, Outbound, RouteContext, Router};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a connection needs, built once per server
pub struct ServerContext {
    pub config: ServerConfig,
    pub router: Arc<Router>,
    pub authenticator: Arc<dyn Authenticator>,
    pub shutdown: CancellationToken,
}

/// Assembles a [`Server`] from configuration and collaborators
pub struct ServerBuilder {
    config: ServerConfig,
    discovery: Option<Arc<dyn Discover>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    membership: Option<Arc<dyn MembershipSource>>,
    routes: Vec<(Method, Arc<dyn Handler>)>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            discovery: None,
            authenticator: None,
            membership: None,
            routes: Vec::new(),
        }
    }

    /// Discovery backend; [`NoopDiscovery`] if not set
    pub fn discovery(mut self, discovery: Arc<dyn Discover>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Authenticator; a signed-token authenticator over `auth_secret` if not set
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Group membership for group chats; empty if not set
    pub fn membership(mut self, membership: Arc<dyn MembershipSource>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Extra route, overriding a built-in one for the same method
    pub fn route(mut self, method: Method, handler: Arc<dyn Handler>) -> Self {
        self.routes.push((method, handler));
        self
    }

    /// Bind the endpoint and register with discovery
    pub async fn bind(self) -> Result<Server> {
        let config = self.config;
        config.validate()?;

        let authenticator: Arc<dyn Authenticator> = match (self.authenticator, &config.auth_secret)
        {
            (Some(authenticator), _) => authenticator,
            (None, Some(secret)) => Arc::new(SignedTokenAuthenticator::new(secret.clone())),
            (None, None) => {
                return Err(RelayError::config(
                    "no authenticator supplied and auth_secret is unset",
                ));
            }
        };

        let discovery = self
            .discovery
            .unwrap_or_else(|| Arc::new(NoopDiscovery));
        let membership = self
            .membership
            .unwrap_or_else(|| Arc::new(StaticMembership::new()));

        let registry = Arc::new(ConnectionRegistry::new());
        let mut router = Router::new(registry, discovery.clone(), config.retry);
        default_routes(&mut router, membership);
        for (method, handler) in self.routes {
            router.route(method, handler);
        }

        let settings = TransportSettings {
            idle_timeout: config.idle_timeout(),
            keep_alive: None,
        };
        let endpoint =
            Endpoint::server(server_config(&settings)?, config.bind_addr).map_err(|e| {
                RelayError::network(format!("Failed to bind {}: {}", config.bind_addr, e))
            })?;
        let local_addr = endpoint.local_addr()?;

        let advertise_addr = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());
        if local_addr.ip().is_unspecified() && config.advertise_addr.is_none() {
            warn!(
                "Advertising unspecified address {}; peers will not reach it",
                advertise_addr
            );
        }
        discovery.register(&advertise_addr).await?;

        Ok(Server {
            endpoint,
            ctx: Arc::new(ServerContext {
                config,
                router: Arc::new(router),
                authenticator,
                shutdown: CancellationToken::new(),
            }),
            tracker: TaskTracker::new(),
            local_addr,
            advertise_addr,
        })
    }
}

/// Server statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    /// Client and peer connections being served, handshakes included
    pub open_connections: usize,
    /// Users attached to this process
    pub connected_users: usize,
    /// Cached outbound connections to other processes
    pub peer_connections: usize,
    pub max_connections: usize,
    pub bind_address: SocketAddr,
    pub advertise_addr: String,
}

/// Running delivery server
pub struct Server {
    endpoint: Endpoint,
    ctx: Arc<ServerContext>,
    tracker: TaskTracker,
    local_addr: SocketAddr,
    advertise_addr: String,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Accept connections until [`Server::stop`] is called
    pub async fn run(&self) -> Result<()> {
        info!(
            "Listening on {} (advertised as {})",
            self.local_addr, self.advertise_addr
        );

        let shutdown = self.ctx.shutdown.clone();
        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = self.endpoint.accept() => incoming,
            };

            let Some(incoming) = incoming else {
                debug!("Endpoint closed");
                break;
            };

            if self.tracker.len() >= self.ctx.config.max_connections {
                warn!(
                    "Refusing {}: connection limit {} reached",
                    incoming.remote_address(),
                    self.ctx.config.max_connections
                );
                incoming.refuse();
                continue;
            }

            let ctx = self.ctx.clone();
            self.tracker.spawn(async move {
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        debug!("QUIC handshake failed: {}", e);
                        return;
                    }
                };
                if let Err(e) = ConnectionHandler::new(connection, ctx).run().await {
                    debug!("Connection ended with error: {}", e);
                }
            });
        }

        info!("Accept loop stopped");
        Ok(())
    }

    /// Stop accepting, close and drain every connection, then release
    /// discovery resources
    pub async fn stop(&self) {
        info!("Stopping server on {}", self.local_addr);
        self.ctx.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("{} connections still open after drain timeout", self.tracker.len());
        }

        self.endpoint.close(0u32.into(), b"server shutdown");
        self.ctx.router.discovery().close().await;
        info!("Server stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address registered with discovery
    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.ctx.router.registry()
    }

    /// Point-in-time counters
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            open_connections: self.tracker.len(),
            connected_users: self.registry().len(),
            peer_connections: self.ctx.router.discovery().peer_count(),
            max_connections: self.ctx.config.max_connections,
            bind_address: self.local_addr,
            advertise_addr: self.advertise_addr.clone(),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
}
