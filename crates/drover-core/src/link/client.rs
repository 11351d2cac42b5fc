//! Command/reply correlation over the link fifo.
//!
//! A reply packet carries the request's sequence as its first data byte;
//! the remaining bytes are the reply payload. The client keeps pending
//! commands in send order and resolves them by that sequence.
//!
//! # In-order peer contract
//!
//! The firmware processes commands strictly in order and never replies
//! backwards. The client leans on that: when a reply for sequence N
//! arrives, every pending command older than N can no longer be answered
//! and is failed with [`LinkError::NoReply`]. A peer that replied out of
//! order would violate this contract, not the client.
//!
//! Event packets (code bit 7) are never correlated; they flow out on the
//! event channel untouched.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use drover_proto::packet::{CODE_ERROR, CODE_EVENT, Packet, PacketSeq};

use super::{
    fifo::{Fifo, FifoHandle, PacketHandler, StateNotifier},
    parser::SyncState,
};
use crate::{
    error::{LinkError, RunError},
    runner::{RunContext, Runnable},
};

/// A successful command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code with the event and error bits cleared.
    pub code: u8,
    /// Reply payload (request sequence byte stripped).
    pub data: Bytes,
}

struct PendingCommand {
    seq: PacketSeq,
    tx: oneshot::Sender<Result<Reply, LinkError>>,
}

struct ClientShared {
    pending: tokio::sync::Mutex<Vec<PendingCommand>>,
}

/// The result side of a submitted command.
pub struct PendingReply {
    seq: Option<PacketSeq>,
    rx: oneshot::Receiver<Result<Reply, LinkError>>,
}

impl PendingReply {
    /// The request sequence, if the send succeeded.
    pub fn request_seq(&self) -> Option<PacketSeq> {
        self.seq
    }

    /// Waits for the reply. Resolves with [`LinkError::Closed`] if the
    /// driver stopped before one arrived.
    pub async fn result(self) -> Result<Reply, LinkError> {
        self.rx.await.unwrap_or(Err(LinkError::Closed))
    }
}

/// Client-side operations over a link fifo.
pub struct Client {
    fifo: FifoHandle,
    shared: Arc<ClientShared>,
    events: mpsc::Receiver<Packet>,
    states: mpsc::Receiver<SyncState>,
}

impl Client {
    /// Wraps a fifo, wiring its handler and notifier. The returned
    /// [`ClientDriver`] must be run for anything to move.
    pub fn new(mut fifo: Fifo) -> (Self, ClientDriver) {
        let shared = Arc::new(ClientShared { pending: tokio::sync::Mutex::new(Vec::new()) });
        let (event_tx, events) = mpsc::channel(1);
        let (state_tx, states) = mpsc::channel(1);
        fifo.set_handler(Box::new(ClientSink { shared: shared.clone(), event_tx }));
        fifo.set_notifier(Box::new(StateSink { state_tx }));
        let client = Self { fifo: fifo.handle(), shared: shared.clone(), events, states };
        (client, ClientDriver { fifo, shared })
    }

    /// Current link state.
    pub fn state(&self) -> SyncState {
        self.fifo.state()
    }

    /// The next state transition. `None` when the driver stopped.
    pub async fn next_state(&mut self) -> Option<SyncState> {
        self.states.recv().await
    }

    /// The next event packet. `None` when the driver stopped.
    pub async fn next_event(&mut self) -> Option<Packet> {
        self.events.recv().await
    }

    /// Sends a command and returns its pending reply.
    ///
    /// A failed send still resolves the reply (with the send error), so
    /// callers have a single await point either way.
    pub async fn submit(&self, code: u8, data: impl Into<Bytes>) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        // Holding the pending lock across the send keeps list order equal
        // to wire order, which the no-reply rule depends on.
        let mut pending = self.shared.pending.lock().await;
        match self.fifo.send(code, data.into()).await {
            Ok(seq) => {
                pending.push(PendingCommand { seq, tx });
                PendingReply { seq: Some(seq), rx }
            },
            Err(err) => {
                let _ = tx.send(Err(err));
                PendingReply { seq: None, rx }
            },
        }
    }
}

/// Runs the fifo on behalf of a [`Client`].
pub struct ClientDriver {
    fifo: Fifo,
    shared: Arc<ClientShared>,
}

#[async_trait]
impl Runnable for ClientDriver {
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunError> {
        let res = Box::new(self.fifo).run(ctx).await;
        // No more replies can arrive; dropping the pending senders
        // resolves every outstanding command with `Closed`.
        self.shared.pending.lock().await.clear();
        res
    }

    fn name(&self) -> &str {
        "link-client"
    }
}

struct ClientSink {
    shared: Arc<ClientShared>,
    event_tx: mpsc::Sender<Packet>,
}

#[async_trait]
impl PacketHandler for ClientSink {
    async fn handle_packet(&mut self, _ctx: &RunContext, packet: Packet) {
        if packet.code & CODE_EVENT != 0 {
            let _ = self.event_tx.send(packet).await;
            return;
        }
        // A reply without a request sequence is not addressable; drop it.
        let Some(seq) = packet.data.first().copied().and_then(PacketSeq::from_byte) else {
            return;
        };
        let (earlier, hit) = {
            let mut pending = self.shared.pending.lock().await;
            let Some(pos) = pending.iter().position(|cmd| cmd.seq == seq) else {
                return;
            };
            let mut drained: Vec<PendingCommand> = pending.drain(..=pos).collect();
            let hit = drained.pop().expect("drained range includes the match");
            (drained, hit)
        };
        for cmd in earlier {
            let _ = cmd.tx.send(Err(LinkError::NoReply));
        }
        let result = if packet.code & CODE_ERROR != 0 {
            Err(LinkError::Command { code: packet.code & 0x7e })
        } else {
            Ok(Reply { code: packet.code & 0x7e, data: packet.data.slice(1..) })
        };
        let _ = hit.tx.send(result);
    }
}

struct StateSink {
    state_tx: mpsc::Sender<SyncState>,
}

#[async_trait]
impl StateNotifier for StateSink {
    async fn state_changed(&mut self, _ctx: &RunContext, state: SyncState) {
        let _ = self.state_tx.send(state).await;
    }
}
