//! Operator-side connection to a controller: commands with correlated
//! futures, events into the loop.
//!
//! # Pending command lifecycle
//!
//! Every command gets the next nonzero `u32` sequence and a
//! [`CommandFuture`]. Until resolved, the pending entry is reachable by
//! exactly two structures, the sequence map and the insertion-ordered
//! expiry queue, and it leaves both together:
//!
//! - a reply resolves it with the decoded message (or the remote error),
//! - the idle-priority sweep resolves it with [`ConnError::Expired`]
//!   once its deadline passes,
//! - teardown drops the map, which closes every remaining future.
//!
//! Because expirations are uniform, the queue is deadline-ordered and the
//! sweep stops at the first entry still in the future.
//!
//! Events are never correlated: they are posted straight into the loop's
//! message store and trigger the next iteration.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

use drover_proto::{
    Registry, Typed,
    messages::{CommandErr, Decoded, WireMessage},
};

use crate::{
    error::{ConnError, RunError},
    pipe::{Pipe, PipeSender, TypedHandler},
    runner::RunContext,
    scheduler::{self, ControlContext, Loop, LoopAdder},
    transport::{PacketRead, PacketWrite},
};

/// Default time a command waits for its reply.
pub const DEFAULT_COMMAND_EXPIRATION: Duration = Duration::from_secs(1);

/// The eventual result of a command.
pub struct CommandFuture {
    seq: u32,
    rx: oneshot::Receiver<Result<Decoded, ConnError>>,
}

impl CommandFuture {
    /// The command's sequence.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Waits for the reply. Resolves with [`ConnError::Closed`] if the
    /// connection was torn down first; no future is ever left hanging.
    pub async fn result(self) -> Result<Decoded, ConnError> {
        self.rx.await.unwrap_or(Err(ConnError::Closed))
    }
}

struct PendingCommand {
    deadline: Instant,
    tx: oneshot::Sender<Result<Decoded, ConnError>>,
}

#[derive(Default)]
struct ConnInner {
    seq: u32,
    pending: HashMap<u32, PendingCommand>,
    order: VecDeque<u32>,
}

impl ConnInner {
    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        self.seq
    }

    fn insert(&mut self, seq: u32, cmd: PendingCommand) {
        self.pending.insert(seq, cmd);
        self.order.push_back(seq);
    }

    fn complete(&mut self, seq: u32) -> Option<PendingCommand> {
        let cmd = self.pending.remove(&seq)?;
        self.order.retain(|s| *s != seq);
        Some(cmd)
    }
}

struct ConnShared {
    expiration: Duration,
    inner: Mutex<ConnInner>,
}

/// The connection. Create with [`Conn::new`], wire into a loop with
/// [`Loop::add`], then issue commands from anywhere.
pub struct Conn {
    sender: PipeSender,
    shared: Arc<ConnShared>,
    pipe: Option<Pipe>,
}

impl Conn {
    /// Builds a connection over a packet transport pair.
    pub fn new(
        reader: Box<dyn PacketRead>,
        writer: Box<dyn PacketWrite>,
        registry: Arc<Registry>,
    ) -> Self {
        Self::with_expiration(reader, writer, registry, DEFAULT_COMMAND_EXPIRATION)
    }

    /// Builds a connection with a custom command expiration.
    pub fn with_expiration(
        reader: Box<dyn PacketRead>,
        writer: Box<dyn PacketWrite>,
        registry: Arc<Registry>,
        expiration: Duration,
    ) -> Self {
        let shared = Arc::new(ConnShared { expiration, inner: Mutex::new(ConnInner::default()) });
        let mut pipe = Pipe::new(reader, writer, registry);
        pipe.set_handler(Arc::new(ConnHandler { shared: shared.clone() }));
        Self { sender: pipe.sender(), shared, pipe: Some(pipe) }
    }

    /// Sends a command and returns its future.
    ///
    /// The pending entry is registered before the write goes out, so a
    /// reply can never race past its own registration. A failed write
    /// resolves the future immediately with the send error.
    pub async fn do_command(&self, msg: &dyn WireMessage) -> CommandFuture {
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut inner = self.shared.inner.lock().expect("lock poisoned");
            let seq = inner.next_seq();
            let deadline = Instant::now() + self.shared.expiration;
            inner.insert(seq, PendingCommand { deadline, tx });
            seq
        };
        if let Err(err) = self.sender.send_command(msg, seq).await {
            let mut inner = self.shared.inner.lock().expect("lock poisoned");
            if let Some(cmd) = inner.complete(seq) {
                let _ = cmd.tx.send(Err(ConnError::Io(err)));
            }
        }
        CommandFuture { seq, rx }
    }
}

impl LoopAdder for Conn {
    /// Adds the receive task and the idle-priority expiry sweep. The
    /// conn itself stays usable for [`Conn::do_command`].
    fn add_to_loop(&mut self, lp: &mut Loop) {
        if let Some(pipe) = self.pipe.take() {
            lp.add_runnable(pipe);
        }
        lp.add_controller(scheduler::IDLE, ExpirySweep { shared: self.shared.clone() });
    }
}

struct ConnHandler {
    shared: Arc<ConnShared>,
}

#[async_trait]
impl TypedHandler for ConnHandler {
    async fn handle_typed(
        &self,
        ctx: &RunContext,
        msg: Decoded,
        typed: &Typed,
    ) -> Result<(), RunError> {
        if typed.is_event() {
            if let Some(lp) = ctx.loop_handle() {
                lp.post_message(msg);
                lp.trigger_next();
            }
            return Ok(());
        }
        let Some(cmd) = self
            .shared
            .inner
            .lock()
            .expect("lock poisoned")
            .complete(typed.sequence)
        else {
            // Late or duplicate reply; its command already resolved.
            debug!(sequence = typed.sequence, "reply without pending command");
            return Ok(());
        };
        let result = match msg.downcast::<CommandErr>() {
            Ok(err) => Err(ConnError::Remote(*err)),
            Err(msg) => Ok(msg),
        };
        let _ = cmd.tx.send(result);
        Ok(())
    }
}

struct ExpirySweep {
    shared: Arc<ConnShared>,
}

impl scheduler::Controller for ExpirySweep {
    fn control(&mut self, cc: &mut ControlContext<'_>) -> Result<(), RunError> {
        let now = cc.time();
        let mut inner = self.shared.inner.lock().expect("lock poisoned");
        while let Some(&seq) = inner.order.front() {
            let expired = match inner.pending.get(&seq) {
                Some(cmd) => cmd.deadline <= now,
                None => {
                    debug_assert!(false, "pending queue out of sync with map");
                    true
                },
            };
            if !expired {
                // Deadline-ordered queue: the first live entry ends the sweep.
                break;
            }
            inner.order.pop_front();
            if let Some(cmd) = inner.pending.remove(&seq) {
                let _ = cmd.tx.send(Err(ConnError::Expired));
            }
        }
        Ok(())
    }
}
