//! Per-process table of attached user connections
//!
//! Keyed by user id in a sharded map so connects and disconnects of
//! unrelated users never contend on one lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ack::AckTracker;
use crate::config::AckMode;
use crate::error::{RelayError, Result};
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::message::{Message, UserId};
use crate::transport::stream::encode_checked;

/// Work for a connection's writer task
#[derive(Debug)]
pub enum Outgoing {
    Message(Message),
    /// Send Goodbye and close
    Close(String),
}

/// Handle to one live user connection
pub struct ConnectionHandle {
    conn_id: String,
    user_id: UserId,
    remote_addr: SocketAddr,
    connected_at: Instant,
    outbound: mpsc::UnboundedSender<Outgoing>,
    acks: Arc<AckTracker>,
    ack_mode: AckMode,
    max_frame_size: usize,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: String,
        user_id: UserId,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outgoing>,
        acks: Arc<AckTracker>,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            conn_id,
            user_id,
            remote_addr,
            connected_at: Instant::now(),
            outbound,
            acks,
            ack_mode,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Largest frame payload the client accepts
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn acks(&self) -> &Arc<AckTracker> {
        &self.acks
    }

    /// Queue a frame without tracking
    pub fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(Outgoing::Message(msg))
            .map_err(|_| RelayError::connection(format!("Connection {} is closed", self.conn_id)))
    }

    /// Deliver a frame; under `rigor`, Data frames wait for their Ack.
    /// Frames the client could not read fail with `MessageTooLarge`.
    pub async fn deliver(&self, msg: Message) -> Result<()> {
        encode_checked(&msg, self.max_frame_size)?;
        if !self.ack_mode.tracks_outbound() {
            return self.send(msg);
        }
        self.acks.deliver(msg, |m| self.send(m.clone())).await
    }

    /// Deliver without waiting: the first transmission happens now and any
    /// retries run in a background task that logs abandonment
    pub fn deliver_detached(self: &Arc<Self>, mut msg: Message) -> Result<()> {
        encode_checked(&msg, self.max_frame_size)?;
        if !self.ack_mode.tracks_outbound() {
            return self.send(msg);
        }

        let Some(pending) = self.acks.track(&mut msg) else {
            return self.send(msg);
        };
        self.send(msg.clone())?;

        let handle = self.clone();
        tokio::spawn(async move {
            let id = msg.id.clone();
            let acks = handle.acks.clone();
            if let Err(e) = acks.supervise(pending, msg, |m| handle.send(m.clone())).await {
                warn!("Relayed {} to {} not acknowledged: {}", id, handle.user_id, e);
            }
        });
        Ok(())
    }

    /// Ask the writer to say Goodbye and close
    pub fn close(&self, reason: &str) {
        let _ = self.outbound.send(Outgoing::Close(reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Attached connections keyed by user id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, returning the one it supersedes
    pub fn insert(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let previous = self
            .connections
            .insert(handle.user_id.clone(), handle.clone());
        if let Some(previous) = &previous {
            debug!(
                "Connection {} for {} superseded by {}",
                previous.conn_id, handle.user_id, handle.conn_id
            );
        }
        previous
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(user_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Detach `user_id` only if `conn_id` is still its registered connection.
    /// Returns whether the entry was removed.
    pub fn remove_if_current(&self, user_id: &str, conn_id: &str) -> bool {
        self.connections
            .remove_if(user_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    /// Ids of every attached user, sorted
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of every handle
    pub fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
