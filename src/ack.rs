//! Ack/Retry engine
//!
//! Tracks Data frames that require an acknowledgment. Each tracked frame gets
//! a sequence number unique to its tracker; the frame is resent whenever
//! `ack_timeout` passes without a matching Ack and abandoned once it has been
//! transmitted `max_err_count` times.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{RelayError, Result};
use crate::protocol::message::Message;

struct Outstanding {
    id: String,
    acked: oneshot::Sender<()>,
}

/// Handle for one tracked frame, consumed by [`AckTracker::supervise`]
#[derive(Debug)]
pub struct Pending {
    seq: u64,
    acked: oneshot::Receiver<()>,
}

impl Pending {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Outstanding acknowledgments for one connection
pub struct AckTracker {
    policy: RetryPolicy,
    outstanding: DashMap<u64, Outstanding>,
    next_seq: AtomicU64,
}

impl AckTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            outstanding: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Assign a sequence number and start waiting for its Ack.
    /// Frames other than Data are not tracked.
    pub fn track(&self, msg: &mut Message) -> Option<Pending> {
        if !msg.requires_ack() {
            return None;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        msg.ack_seq = seq;
        msg.mark_sent();
        self.outstanding.insert(
            seq,
            Outstanding {
                id: msg.id.clone(),
                acked: tx,
            },
        );

        Some(Pending { seq, acked: rx })
    }

    /// Resolve an Ack frame. Returns false for unknown or mismatched acks.
    pub fn on_ack(&self, id: &str, seq: u64) -> bool {
        match self.outstanding.remove_if(&seq, |_, entry| entry.id == id) {
            Some((_, entry)) => {
                let _ = entry.acked.send(());
                true
            }
            None => false,
        }
    }

    /// Wait for the Ack of an already transmitted frame, resending on timeout
    pub async fn supervise<F>(
        &self,
        mut pending: Pending,
        mut msg: Message,
        mut transmit: F,
    ) -> Result<()>
    where
        F: FnMut(&Message) -> Result<()>,
    {
        loop {
            match tokio::time::timeout(self.policy.ack_timeout(), &mut pending.acked).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => {
                    return Err(RelayError::connection(format!(
                        "Connection closed before {} was acknowledged",
                        msg.id
                    )));
                }
                Err(_) => {
                    let attempts = msg.record_failure();
                    if attempts >= self.policy.max_err_count {
                        self.forget(&pending);
                        warn!("Abandoning {} after {} attempts", msg.id, attempts);
                        return Err(RelayError::delivery_abandoned(format!(
                            "{} unacknowledged after {} attempts",
                            msg.id, attempts
                        )));
                    }

                    debug!("Resending {} (attempt {})", msg.id, attempts + 1);
                    msg.mark_sent();
                    if let Err(e) = transmit(&msg) {
                        self.forget(&pending);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Transmit `msg` and, for Data frames, keep resending until acknowledged
    pub async fn deliver<F>(&self, mut msg: Message, mut transmit: F) -> Result<()>
    where
        F: FnMut(&Message) -> Result<()>,
    {
        let Some(pending) = self.track(&mut msg) else {
            return transmit(&msg);
        };

        if let Err(e) = transmit(&msg) {
            self.forget(&pending);
            return Err(e);
        }

        self.supervise(pending, msg, transmit).await
    }

    /// Drop every outstanding entry; supervisors observe a closed connection
    pub fn clear(&self) {
        self.outstanding.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn forget(&self, pending: &Pending) {
        self.outstanding.remove(&pending.seq);
    }
}
