//! Per-connection lifecycle
//!
//! `Connecting -> Authenticated -> Active -> Closing -> Closed`. The handler
//! owns the read side of the control stream; a writer task owns the write
//! side and a dispatcher task runs handlers so slow deliveries never stall
//! reads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Connection;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ServerContext;
use super::registry::{ConnectionHandle, Outgoing};
use crate::ack::AckTracker;
use crate::auth::service_token_matches;
use crate::error::{RelayError, Result};
use crate::generate_message_id;
use crate::protocol::codec::DecodedFrame;
use crate::protocol::handshake::{AuthFailed, AuthOk, Goodbye, SERVICE_AUTH_METHOD};
use crate::protocol::message::{FrameType, Message, UserId};
use crate::transport::stream::{FrameReader, FrameWriter, Inbound};

const RELIEVE_ATTEMPTS: u32 = 3;
const LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

/// Who is on the other end after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    User(UserId),
    /// Another server process relaying frames
    Peer,
}

pub struct ConnectionHandler {
    connection: Connection,
    ctx: Arc<ServerContext>,
    conn_id: String,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub fn new(connection: Connection, ctx: Arc<ServerContext>) -> Self {
        Self {
            connection,
            ctx,
            conn_id: generate_message_id(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {} {:?} -> {:?}", self.conn_id, self.state, next);
        self.state = next;
    }

    /// Drive the connection to completion
    pub async fn run(mut self) -> Result<()> {
        let addr = self.remote_address();
        info!("New connection from {}", addr);

        let (send, recv) = tokio::time::timeout(
            self.ctx.config.handshake_timeout(),
            self.connection.accept_bi(),
        )
        .await
        .map_err(|_| RelayError::timeout("control stream not opened"))??;

        let mut writer = FrameWriter::new(send, self.ctx.config.max_message_size);
        let mut reader = FrameReader::new(recv, self.ctx.config.max_message_size);

        let role = match self.handshake(&mut reader).await {
            Ok(role) => role,
            Err(e) => {
                warn!("Handshake with {} failed: {}", addr, e);
                self.reject(&mut writer, &e).await;
                return Err(e);
            }
        };

        self.transition(ConnectionState::Authenticated);

        match role {
            Role::User(user_id) => self.run_user(user_id, reader, writer).await,
            Role::Peer => self.run_peer(reader, writer).await,
        }
    }

    async fn handshake(&self, reader: &mut FrameReader) -> Result<Role> {
        let first = tokio::time::timeout(self.ctx.config.handshake_timeout(), reader.next())
            .await
            .map_err(|_| RelayError::timeout("no Auth frame"))??;

        let auth = match first {
            Some(Inbound::Frame(DecodedFrame::Auth(auth))) => auth,
            Some(Inbound::Frame(other)) => {
                return Err(RelayError::protocol(format!(
                    "expected Auth, got {:?}",
                    other.frame_kind()
                )));
            }
            Some(Inbound::Malformed(e)) => return Err(e),
            None => return Err(RelayError::connection("stream closed before Auth")),
        };

        if auth.method == SERVICE_AUTH_METHOD {
            if !service_token_matches(&self.ctx.config.peer.service_token, &auth.credentials) {
                return Err(RelayError::auth_failed("invalid service token"));
            }
            return Ok(Role::Peer);
        }

        let user_id = self.ctx.authenticator.authenticate(&auth.credentials)?;
        Ok(Role::User(user_id))
    }

    /// Send AuthFailed and close once the client has seen it
    async fn reject(&mut self, writer: &mut FrameWriter, error: &RelayError) {
        let failed = AuthFailed {
            code: error.code(),
            message: error.to_string(),
        };
        if writer.write(&failed).await.is_ok() {
            let _ = writer.finish();
            let _ = tokio::time::timeout(LINGER, self.connection.closed()).await;
        }
        self.connection.close(1u32.into(), b"authentication failed");
        self.transition(ConnectionState::Closed);
    }

    async fn run_user(
        mut self,
        user_id: UserId,
        mut reader: FrameReader,
        mut writer: FrameWriter,
    ) -> Result<()> {
        let addr = self.remote_address();
        let router = self.ctx.router.clone();
        let registry = router.registry().clone();
        let ack_mode = self.ctx.config.ack_mode;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(
            ConnectionHandle::new(
                self.conn_id.clone(),
                user_id.clone(),
                addr,
                out_tx.clone(),
                Arc::new(AckTracker::new(self.ctx.config.retry)),
                ack_mode,
            )
            .with_max_frame_size(self.ctx.config.max_message_size),
        );

        if let Some(previous) = registry.insert(handle.clone()) {
            previous.close("superseded by a newer connection");
        }

        if let Err(e) = router.discovery().bound_user(&user_id).await {
            error!("Failed to bind {}: {}", user_id, e);
            registry.remove_if_current(&user_id, &self.conn_id);
            self.reject(&mut writer, &e).await;
            return Err(e);
        }

        writer
            .write(&AuthOk {
                user_id: user_id.clone(),
                session_id: self.conn_id.clone(),
            })
            .await?;

        info!("User {} connected from {} ({})", user_id, addr, self.conn_id);
        self.transition(ConnectionState::Active);

        let closed = self.ctx.shutdown.child_token();
        let writer_task = spawn_writer(writer, out_rx, closed.clone());
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Message>();
        {
            let router = router.clone();
            let user_id = user_id.clone();
            tokio::spawn(async move {
                while let Some(msg) = dispatch_rx.recv().await {
                    router.dispatch(&user_id, msg).await;
                }
            });
        }

        let reason = loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break self.close_reason(),
                next = reader.next() => next,
            };

            match next {
                Ok(Some(Inbound::Frame(DecodedFrame::Message(mut msg)))) => match msg.frame_type {
                    FrameType::Ping => {
                        let _ = handle.send(Message::ping().with_id(msg.id));
                    }
                    FrameType::Ack => {
                        if !handle.acks().on_ack(&msg.id, msg.ack_seq) {
                            debug!("Stale ack {}#{} from {}", msg.id, msg.ack_seq, user_id);
                        }
                    }
                    FrameType::Err => debug!("Client {} reported: {:?}", user_id, msg.data),
                    FrameType::Transpond => {
                        let err =
                            RelayError::protocol("transpond frames are accepted from peers only");
                        let _ = handle.send(Message::error(err).with_id(msg.id));
                    }
                    FrameType::Data | FrameType::NoAck => {
                        if msg.id.is_empty() {
                            msg.id = generate_message_id();
                        }
                        msg.from_id = user_id.clone();

                        if msg.frame_type == FrameType::Data && ack_mode.acks_inbound() {
                            let _ = handle.send(Message::ack(msg.id.clone(), msg.ack_seq));
                        }

                        debug!("{} -> {} ({})", user_id, msg.method, msg.id);
                        if dispatch_tx.send(msg).is_err() {
                            break "dispatcher stopped".to_string();
                        }
                    }
                },
                Ok(Some(Inbound::Frame(DecodedFrame::Goodbye(Goodbye { reason })))) => break reason,
                Ok(Some(Inbound::Frame(other))) => {
                    let err = RelayError::protocol(format!(
                        "unexpected {:?} frame",
                        other.frame_kind()
                    ));
                    let _ = handle.send(Message::error(err));
                }
                Ok(Some(Inbound::Malformed(e))) => {
                    warn!("Malformed frame from {}: {}", user_id, e);
                    let _ = handle.send(Message::error(e));
                }
                Ok(None) => break "stream finished".to_string(),
                Err(e) => break e.to_string(),
            }
        };

        self.transition(ConnectionState::Closing);
        info!("User {} disconnecting: {}", user_id, reason);

        drop(dispatch_tx);
        handle.acks().clear();
        if registry.remove_if_current(&user_id, &self.conn_id) {
            self.relieve(&user_id).await;
        }

        handle.close(&reason);
        drop(handle);
        drop(out_tx);
        self.finish(writer_task, &reason).await;
        Ok(())
    }

    async fn run_peer(mut self, mut reader: FrameReader, mut writer: FrameWriter) -> Result<()> {
        let addr = self.remote_address();

        writer
            .write(&AuthOk {
                user_id: UserId::new(),
                session_id: self.conn_id.clone(),
            })
            .await?;

        info!("Peer {} connected ({})", addr, self.conn_id);
        self.transition(ConnectionState::Active);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = self.ctx.shutdown.child_token();
        let writer_task = spawn_writer(writer, out_rx, closed.clone());
        let reply = |msg: Message| {
            let _ = out_tx.send(Outgoing::Message(msg));
        };

        let router = self.ctx.router.clone();
        let reason = loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break self.close_reason(),
                next = reader.next() => next,
            };

            match next {
                Ok(Some(Inbound::Frame(DecodedFrame::Message(msg)))) => match msg.frame_type {
                    FrameType::Transpond => {
                        let id = msg.id.clone();
                        if let Err(e) = router.deliver_transponded(msg) {
                            reply(Message::error(e).with_id(id));
                        }
                    }
                    FrameType::Ping => reply(Message::ping().with_id(msg.id)),
                    _ => {
                        let err =
                            RelayError::protocol("peer connections accept transpond frames only");
                        reply(Message::error(err).with_id(msg.id));
                    }
                },
                Ok(Some(Inbound::Frame(DecodedFrame::Goodbye(Goodbye { reason })))) => break reason,
                Ok(Some(Inbound::Frame(other))) => {
                    let err = RelayError::protocol(format!(
                        "unexpected {:?} frame",
                        other.frame_kind()
                    ));
                    reply(Message::error(err));
                }
                Ok(Some(Inbound::Malformed(e))) => {
                    warn!("Malformed frame from peer {}: {}", addr, e);
                    reply(Message::error(e));
                }
                Ok(None) => break "stream finished".to_string(),
                Err(e) => break e.to_string(),
            }
        };

        self.transition(ConnectionState::Closing);
        info!("Peer {} disconnecting: {}", addr, reason);

        let _ = out_tx.send(Outgoing::Close(reason.clone()));
        drop(out_tx);
        self.finish(writer_task, &reason).await;
        Ok(())
    }

    fn close_reason(&self) -> String {
        if self.ctx.shutdown.is_cancelled() {
            "server shutting down".to_string()
        } else {
            "closed by server".to_string()
        }
    }

    /// Remove this process's binding for `user_id`, retrying a few times.
    /// Failures are logged only.
    async fn relieve(&self, user_id: &str) {
        let discovery = self.ctx.router.discovery();
        let backoff = self.ctx.config.retry.peer_retry_backoff();

        for attempt in 1..=RELIEVE_ATTEMPTS {
            match discovery.relieve_user(user_id).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "Failed to relieve {} (attempt {}/{}): {}",
                        user_id, attempt, RELIEVE_ATTEMPTS, e
                    );
                    if attempt < RELIEVE_ATTEMPTS {
                        tokio::time::sleep(backoff * attempt).await;
                    }
                }
            }
        }

        error!("Giving up relieving {}; binding may be stale", user_id);
    }

    async fn finish(mut self, writer_task: JoinHandle<()>, reason: &str) {
        if tokio::time::timeout(LINGER, writer_task).await.is_err() {
            debug!("Writer for {} did not drain in time", self.conn_id);
        }
        self.connection.close(0u32.into(), reason.as_bytes());
        self.transition(ConnectionState::Closed);
    }
}

/// Write queued frames until a Close request or every sender is gone.
/// `closed` is cancelled when the writer stops.
fn spawn_writer(
    mut writer: FrameWriter,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
    closed: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            match item {
                Outgoing::Message(msg) => match writer.write(&msg).await {
                    Ok(()) => {}
                    Err(RelayError::MessageTooLarge(reason)) => {
                        warn!("Dropped frame {}: {}", msg.id, reason);
                    }
                    Err(e) => {
                        debug!("Write failed: {}", e);
                        break;
                    }
                },
                Outgoing::Close(reason) => {
                    let _ = writer.write(&Goodbye { reason }).await;
                    let _ = writer.finish();
                    break;
                }
            }
        }
        debug!("Writer done after {} frames", writer.frames_sent());
        closed.cancel();
    })
}
