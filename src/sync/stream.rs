//! Real-time state stream: one snapshot, then ordered patches.
//!
//! Every project has a single ordered channel. A new subscriber gets a
//! full snapshot stamped with the current sequence number, then patch
//! batches, orchestrator events, and heartbeats, each with an increasing
//! sequence number. There is no patch replay: a subscriber that lags
//! behind the channel capacity or observes a sequence gap must request a
//! fresh snapshot.

use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::error::{Error, Result};
use crate::llog_warn;
use crate::orchestration::orchestrator::EngineEvent;
use crate::sync::patch::{PatchOp, StateSnapshot};

/// One message on the stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Monotonic per-project sequence number.
    pub seq: u64,
    pub payload: StreamPayload,
}

/// Stream message payloads.
#[derive(Debug, Clone)]
pub enum StreamPayload {
    /// All patches produced by one mutation, applied atomically in order.
    Patch(Vec<PatchOp>),
    /// An orchestrator event (plan updates, state changes, task lifecycle).
    Event(EngineEvent),
    /// Periodic keep-alive. Absence beyond a timeout means disconnection.
    Heartbeat,
}

/// Producer side of a project's stream. Owned by the coordinator; all
/// emission happens on its single-writer path, which is what makes the
/// per-subscriber ordering guarantee hold.
pub struct ChangeStream {
    tx: broadcast::Sender<StreamMessage>,
    seq: u64,
}

impl ChangeStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, seq: 0 }
    }

    /// Register a subscriber. The returned snapshot is stamped with the
    /// current sequence number; the receiver sees every message emitted
    /// after this call, in emission order.
    pub fn subscribe(&self, snapshot: StateSnapshot) -> StreamClient {
        StreamClient {
            snapshot,
            rx: self.tx.subscribe(),
            last_seq: self.seq,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    /// Emit one mutation's patches as an atomic batch.
    pub fn emit_patches(&mut self, patches: Vec<PatchOp>) {
        if patches.is_empty() {
            return;
        }
        self.emit(StreamPayload::Patch(patches));
    }

    pub fn emit_event(&mut self, event: EngineEvent) {
        self.emit(StreamPayload::Event(event));
    }

    pub fn heartbeat(&mut self) {
        self.emit(StreamPayload::Heartbeat);
    }

    fn emit(&mut self, payload: StreamPayload) {
        self.seq += 1;
        // No receivers is not an error; state is still canonical here.
        let _ = self.tx.send(StreamMessage {
            seq: self.seq,
            payload,
        });
    }
}

/// Subscriber side: a mirror of canonical state kept current by applying
/// patches in arrival order.
pub struct StreamClient {
    snapshot: StateSnapshot,
    rx: broadcast::Receiver<StreamMessage>,
    last_seq: u64,
}

impl StreamClient {
    /// The mirrored state as of the last applied message.
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Receive the next message without applying it.
    ///
    /// Lag (the broadcast ring overwrote unread messages) and closure both
    /// surface as `TransientSync`: the client must resubscribe for a fresh
    /// snapshot, since patch replay is not supported.
    pub async fn next(&mut self) -> Result<StreamMessage> {
        match self.rx.recv().await {
            Ok(msg) => Ok(msg),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                llog_warn!("stream subscriber lagged by {} messages", n);
                Err(Error::TransientSync(format!(
                    "subscriber lagged by {} messages; resnapshot required",
                    n
                )))
            }
            Err(broadcast::error::RecvError::Closed) => Err(Error::TransientSync(
                "stream closed; resnapshot required".to_string(),
            )),
        }
    }

    /// Receive with a deadline. A missed heartbeat window maps to
    /// `Timeout`, which callers treat as a disconnection.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<StreamMessage> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Receive the next message and fold it into the mirror.
    ///
    /// A sequence gap means this subscriber missed a message and must
    /// resnapshot; applying further patches would diverge silently.
    pub async fn sync(&mut self) -> Result<StreamMessage> {
        let msg = self.next().await?;
        self.apply(&msg)?;
        Ok(msg)
    }

    /// Fold an already-received message into the mirror.
    pub fn apply(&mut self, msg: &StreamMessage) -> Result<()> {
        if msg.seq != self.last_seq + 1 {
            return Err(Error::TransientSync(format!(
                "sequence gap: expected {}, got {}; resnapshot required",
                self.last_seq + 1,
                msg.seq
            )));
        }
        self.last_seq = msg.seq;

        if let StreamPayload::Patch(patches) = &msg.payload {
            for patch in patches {
                self.snapshot.apply(patch)?;
            }
        }
        Ok(())
    }
}
