//! Drives the link parser over an async byte channel.
//!
//! The [`Fifo`] owns the read half and the parser; a cloneable
//! [`FifoHandle`] owns the write path. Every parse step yields a
//! [`ParseResult`] which the fifo applies in order: notify on state
//! change, answer handshakes (`[sync, own_seq]`), adjust the single sync
//! timer, and hand completed packets to the handler.
//!
//! Outbound packets are only accepted once the link is ready; their
//! sequence starts at a random value and advances by one per send. The
//! write path is a single lock so a handshake answer can never interleave
//! with a packet in flight.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};

use drover_proto::packet::{Packet, PacketSeq};

use super::parser::{ParseResult, Parser, SyncState, TimerAction};
use crate::{
    error::{LinkError, RunError},
    runner::{RunContext, Runnable},
};

/// Receives completed inbound packets.
#[async_trait]
pub trait PacketHandler: Send {
    /// Called for each framed packet, in arrival order.
    async fn handle_packet(&mut self, ctx: &RunContext, packet: Packet);
}

/// Observes link state transitions.
#[async_trait]
pub trait StateNotifier: Send {
    /// Called whenever the observable state changes.
    async fn state_changed(&mut self, ctx: &RunContext, state: SyncState);
}

/// Default per-byte sync timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

struct Shared {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    state: Mutex<LinkState>,
}

struct LinkState {
    sync: SyncState,
    seq: PacketSeq,
}

/// The send side of a [`Fifo`]; cloneable and usable from any task.
#[derive(Clone)]
pub struct FifoHandle {
    shared: Arc<Shared>,
}

impl FifoHandle {
    /// Current observable link state.
    pub fn state(&self) -> SyncState {
        self.shared.state.lock().expect("lock poisoned").sync
    }

    /// Sends a packet, assigning the next outbound sequence.
    ///
    /// # Errors
    ///
    /// [`LinkError::NotReady`] before the link is synchronized; the
    /// caller retries after the next state change. I/O errors come from
    /// the underlying channel.
    pub async fn send(&self, code: u8, data: impl Into<Bytes>) -> Result<PacketSeq, LinkError> {
        let mut writer = self.shared.writer.lock().await;
        let seq = {
            let state = self.shared.state.lock().expect("lock poisoned");
            if !state.sync.is_ready() {
                return Err(LinkError::NotReady);
            }
            state.seq
        };
        let packet = Packet::new(seq, code, data.into());
        writer.write_all(&packet.encode()?).await?;
        writer.flush().await?;
        self.shared.state.lock().expect("lock poisoned").seq = seq.next();
        Ok(seq)
    }

    async fn write_sync(&self, sync: u8) -> Result<(), LinkError> {
        let mut writer = self.shared.writer.lock().await;
        let seq = self.shared.state.lock().expect("lock poisoned").seq;
        writer.write_all(&[sync, seq.value()]).await?;
        writer.flush().await?;
        Ok(())
    }

    fn set_state(&self, sync: SyncState) -> bool {
        let mut state = self.shared.state.lock().expect("lock poisoned");
        if state.sync == sync {
            false
        } else {
            state.sync = sync;
            true
        }
    }
}

/// Packet send/receive over a byte duplex. See the module docs.
pub struct Fifo {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    handle: FifoHandle,
    parser: Parser,
    timeout: Duration,
    deadline: Option<Instant>,
    handler: Option<Box<dyn PacketHandler>>,
    notifier: Option<Box<dyn StateNotifier>>,
}

impl Fifo {
    /// Wraps a byte duplex.
    pub fn new(channel: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        let (reader, writer) = tokio::io::split(channel);
        Self {
            reader: Box::new(reader),
            handle: FifoHandle {
                shared: Arc::new(Shared {
                    writer: tokio::sync::Mutex::new(Box::new(writer)),
                    state: Mutex::new(LinkState {
                        sync: SyncState::SYNCING,
                        seq: PacketSeq::random(),
                    }),
                }),
            },
            parser: Parser::new(),
            timeout: DEFAULT_TIMEOUT,
            deadline: None,
            handler: None,
            notifier: None,
        }
    }

    /// Overrides the sync timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pins the initial outbound sequence; tests use this for
    /// deterministic byte scripts.
    pub fn with_initial_seq(self, seq: PacketSeq) -> Self {
        self.handle.shared.state.lock().expect("lock poisoned").seq = seq;
        self
    }

    /// Installs the packet handler.
    pub fn set_handler(&mut self, handler: Box<dyn PacketHandler>) {
        self.handler = Some(handler);
    }

    /// Installs the state notifier.
    pub fn set_notifier(&mut self, notifier: Box<dyn StateNotifier>) {
        self.notifier = Some(notifier);
    }

    /// The send handle.
    pub fn handle(&self) -> FifoHandle {
        self.handle.clone()
    }

    async fn apply(&mut self, ctx: &RunContext, pr: ParseResult) -> Result<(), RunError> {
        let changed = self.handle.set_state(pr.state);
        if let Some(sync) = pr.sync {
            self.handle.write_sync(sync).await?;
        }
        match pr.timer_action() {
            TimerAction::Restart => self.deadline = Some(Instant::now() + self.timeout),
            TimerAction::Stop => self.deadline = None,
            TimerAction::NoChange => {},
        }
        if changed {
            if let Some(notifier) = self.notifier.as_mut() {
                notifier.state_changed(ctx, pr.state).await;
            }
        }
        if let Some(packet) = pr.packet {
            if let Some(handler) = self.handler.as_mut() {
                handler.handle_packet(ctx, packet).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Runnable for Fifo {
    async fn run(mut self: Box<Self>, ctx: RunContext) -> Result<(), RunError> {
        let pr = self.parser.reset();
        self.apply(&ctx, pr).await?;

        let mut buf = [0u8; 1];
        loop {
            enum Event {
                Byte(u8),
                Timeout,
            }
            let event = match self.deadline {
                Some(deadline) => tokio::select! {
                    _ = ctx.cancelled() => return Err(RunError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Event::Timeout,
                    read = self.reader.read(&mut buf) => match read? {
                        0 => return Err(LinkError::Closed.into()),
                        _ => Event::Byte(buf[0]),
                    },
                },
                None => tokio::select! {
                    _ = ctx.cancelled() => return Err(RunError::Cancelled),
                    read = self.reader.read(&mut buf) => match read? {
                        0 => return Err(LinkError::Closed.into()),
                        _ => Event::Byte(buf[0]),
                    },
                },
            };
            let pr = match event {
                Event::Byte(b) => self.parser.parse(b),
                Event::Timeout => {
                    self.deadline = None;
                    self.parser.timeout()
                },
            };
            self.apply(&ctx, pr).await?;
        }
    }

    fn name(&self) -> &str {
        "link-fifo"
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, duplex};

    use drover_proto::packet::{SYNC_ACK, SYNC_REQ};

    use super::*;

    fn seq(n: u8) -> PacketSeq {
        PacketSeq::from_byte(n).expect("valid seq")
    }

    #[tokio::test]
    async fn send_before_sync_is_rejected() {
        let (local, _remote) = duplex(64);
        let fifo = Fifo::new(local);
        let handle = fifo.handle();
        assert!(matches!(
            handle.send(1, Bytes::new()).await,
            Err(LinkError::NotReady)
        ));
    }

    #[tokio::test]
    async fn run_emits_sync_request_and_answers_ack() {
        let (local, remote) = duplex(64);
        let fifo = Fifo::new(local).with_initial_seq(seq(1));
        let handle = fifo.handle();
        let ctx = RunContext::new();
        let task = tokio::spawn(Box::new(fifo).run(ctx.clone()));

        let (mut peer_read, mut peer_write) = tokio::io::split(remote);
        let mut buf = [0u8; 2];
        peer_read.read_exact(&mut buf).await.expect("read sync req");
        assert_eq!(buf, [SYNC_REQ, 1]);

        peer_write.write_all(&[SYNC_ACK, 0x10]).await.expect("write ack");
        // Wait for the fifo to apply the handshake.
        while !handle.state().is_ready() {
            tokio::task::yield_now().await;
        }

        let sent = handle.send(2, Bytes::from_static(&[5])).await.expect("send");
        assert_eq!(sent.value(), 1);
        let mut pkt = [0u8; 3];
        peer_read.read_exact(&mut pkt).await.expect("read packet");
        assert_eq!(pkt, [1, 0x12, 5]);

        // Next send advances the sequence.
        let sent = handle.send(2, Bytes::new()).await.expect("send");
        assert_eq!(sent.value(), 2);

        ctx.cancel();
        let res = task.await.expect("join");
        assert!(matches!(res, Err(RunError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_timeout_resyncs() {
        let (local, remote) = duplex(64);
        let fifo = Fifo::new(local).with_initial_seq(seq(9));
        let ctx = RunContext::new();
        let task = tokio::spawn(Box::new(fifo).run(ctx.clone()));

        let (mut peer_read, mut peer_write) = tokio::io::split(remote);
        let mut buf = [0u8; 2];
        peer_read.read_exact(&mut buf).await.expect("read sync req");
        assert_eq!(buf, [SYNC_REQ, 9]);

        // Start a handshake but never finish it; the timer must fire and
        // the fifo must request sync again.
        peer_write.write_all(&[SYNC_ACK]).await.expect("write");
        peer_read.read_exact(&mut buf).await.expect("read resync");
        assert_eq!(buf, [SYNC_REQ, 9]);

        ctx.cancel();
        let _ = task.await.expect("join");
    }
}
