//! QUIC client for the delivery layer
//!
//! Used by end-user clients (token auth) and by servers relaying to their
//! peers (service auth). One bidirectional control stream carries the
//! handshake followed by message frames in both directions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use quinn::{Connection, Endpoint};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::codec::DecodedFrame;
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::handshake::{Auth, Goodbye, TOKEN_AUTH_METHOD};
use crate::protocol::message::{FrameType, Message, UserId};
use crate::transport::stream::{FrameReader, FrameWriter, Inbound};
use crate::transport::tls::{TransportSettings, client_endpoint, wildcard_for};

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Local bind address; unspecified address of the server's family if unset
    pub bind_addr: Option<SocketAddr>,
    /// TLS server name
    pub server_name: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    /// Maximum frame payload in either direction; sends over it fail with
    /// `MessageTooLarge` and leave the connection open
    pub max_message_size: usize,
    /// "token" for users, "service" for peer servers
    pub auth_method: String,
    pub credentials: String,
    /// Acknowledge sequenced Data frames as they arrive
    pub auto_ack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 4433)),
            bind_addr: None,
            server_name: "localhost".to_string(),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            max_message_size: MAX_FRAME_SIZE,
            auth_method: TOKEN_AUTH_METHOD.to_string(),
            credentials: String::new(),
            auto_ack: true,
        }
    }
}

impl ClientConfig {
    /// Configuration for a user presenting `token` to `server_addr`
    pub fn with_token(server_addr: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            server_addr,
            credentials: token.into(),
            ..Self::default()
        }
    }
}

/// Events delivered to the owner of a client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A message frame from the server
    Message(Message),
    /// The control stream ended
    Disconnected(String),
}

/// Connected, authenticated client
pub struct RelayClient {
    connection: Connection,
    writer: Arc<Mutex<FrameWriter>>,
    user_id: UserId,
    session_id: String,
    closed: Arc<AtomicBool>,
    // Set when the client created its own endpoint
    endpoint: Option<Endpoint>,
}

impl RelayClient {
    /// Connect on a private endpoint
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let settings = TransportSettings {
            idle_timeout: config.idle_timeout,
            keep_alive: Some(config.keep_alive),
        };
        let bind_addr = config
            .bind_addr
            .unwrap_or_else(|| wildcard_for(config.server_addr));
        let endpoint = client_endpoint(bind_addr, &settings)?;

        let (mut client, events) = Self::connect_with(&endpoint, config).await?;
        client.endpoint = Some(endpoint);
        Ok((client, events))
    }

    /// Connect through an existing endpoint, sharing its socket
    pub async fn connect_with(
        endpoint: &Endpoint,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        debug!("Connecting to {}", config.server_addr);

        let connecting = endpoint
            .connect(config.server_addr, &config.server_name)
            .map_err(|e| RelayError::connection(format!("Failed to initiate connection: {}", e)))?;

        let connection = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| RelayError::timeout("Connection timeout"))??;

        let (send, recv) = connection.open_bi().await?;
        let mut writer = FrameWriter::new(send, config.max_message_size);
        let mut reader = FrameReader::new(recv, config.max_message_size);

        writer
            .write(&Auth {
                method: config.auth_method.clone(),
                credentials: config.credentials.clone(),
            })
            .await?;

        let reply = tokio::time::timeout(config.connect_timeout, reader.next())
            .await
            .map_err(|_| RelayError::timeout("Handshake timeout"))??;

        let ok = match reply {
            Some(Inbound::Frame(DecodedFrame::AuthOk(ok))) => ok,
            Some(Inbound::Frame(DecodedFrame::AuthFailed(failed))) => {
                connection.close(0u32.into(), b"auth failed");
                return Err(RelayError::auth_failed(failed.message));
            }
            Some(_) => {
                connection.close(0u32.into(), b"protocol error");
                return Err(RelayError::protocol("Unexpected handshake reply"));
            }
            None => {
                return Err(RelayError::connection(
                    "Server closed the stream during handshake",
                ));
            }
        };

        info!(
            "Connected to {} (user: {:?}, session: {})",
            config.server_addr, ok.user_id, ok.session_id
        );

        let writer = Arc::new(Mutex::new(writer));
        let closed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(receive_loop(
            reader,
            writer.clone(),
            event_tx,
            closed.clone(),
            config.auto_ack,
        ));

        Ok((
            Self {
                connection,
                writer,
                user_id: ok.user_id,
                session_id: ok.session_id,
                closed,
                endpoint: None,
            },
            event_rx,
        ))
    }

    /// Send one message frame
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::connection("Client is closed"));
        }
        self.writer.lock().await.write(msg).await
    }

    /// Send Goodbye and close the connection
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) && self.connection.close_reason().is_some() {
            return;
        }

        {
            let mut writer = self.writer.lock().await;
            let goodbye = Goodbye {
                reason: reason.to_string(),
            };
            if let Err(e) = writer.write(&goodbye).await {
                debug!("Goodbye not sent: {}", e);
            }
            let _ = writer.finish();
        }

        self.connection.close(0u32.into(), reason.as_bytes());
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.close_reason().is_some()
    }

    /// Identity confirmed by the server (empty for service connections)
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

async fn receive_loop(
    mut reader: FrameReader,
    writer: Arc<Mutex<FrameWriter>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    closed: Arc<AtomicBool>,
    auto_ack: bool,
) {
    let reason = loop {
        match reader.next().await {
            Ok(Some(Inbound::Frame(DecodedFrame::Message(msg)))) => {
                if auto_ack && msg.frame_type == FrameType::Data && msg.ack_seq > 0 {
                    let ack = Message::ack(msg.id.clone(), msg.ack_seq);
                    if let Err(e) = writer.lock().await.write(&ack).await {
                        debug!("Failed to ack {}: {}", msg.id, e);
                    }
                }
                let _ = event_tx.send(ClientEvent::Message(msg));
            }
            Ok(Some(Inbound::Frame(DecodedFrame::Goodbye(goodbye)))) => break goodbye.reason,
            Ok(Some(Inbound::Frame(other))) => {
                debug!("Ignoring {:?} frame after handshake", other.frame_kind());
            }
            Ok(Some(Inbound::Malformed(e))) => warn!("Dropping frame from server: {}", e),
            Ok(None) => break "stream finished".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    closed.store(true, Ordering::SeqCst);
    let _ = event_tx.send(ClientEvent::Disconnected(reason));
}
