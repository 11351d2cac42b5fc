//! Controller-side message registration: the mirror image of the conn.
//!
//! Inbound commands become [`CommandMsg`]s posted into the loop, each
//! wrapping a [`Command`] capability whose [`Command::done`] sends the
//! reply at the original sequence. Inbound events are posted as plain
//! messages. Both trigger the next iteration.
//!
//! Controllers are synchronous, so neither `done` nor
//! [`Registrar::send_event`] may block: both enqueue the pre-encoded
//! envelope onto a reply pump, a small runnable that drains the queue
//! into the pipe.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use drover_proto::{
    Registry, Typed,
    messages::{CommandErr, Decoded, WireMessage},
};

use crate::{
    error::{ErrorList, RunError},
    message::Message,
    pipe::{Pipe, PipeSender, TypedHandler},
    runner::{RunContext, Runnable},
    scheduler::{self, ControlContext, Loop, LoopAdder},
    transport::{PacketRead, PacketWrite},
};

/// A received command waiting to be answered.
pub struct Command {
    seq: u32,
    msg: Decoded,
    reply_tx: mpsc::UnboundedSender<Typed>,
}

impl Command {
    /// The command message.
    pub fn msg(&self) -> &(dyn std::any::Any + Send) {
        &*self.msg
    }

    /// The command message, downcast.
    pub fn msg_as<T: std::any::Any>(&self) -> Option<&T> {
        self.msg.downcast_ref()
    }

    /// Sends the reply at the command's sequence.
    ///
    /// # Errors
    ///
    /// Fails only when the registrar has shut down.
    ///
    /// # Panics
    ///
    /// Panics if the reply is not command kind.
    pub fn done(self, reply: &dyn WireMessage) -> Result<(), RunError> {
        let mut typed = Typed::from_msg(reply);
        assert!(typed.is_command(), "reply {:#010x} is not command kind", typed.type_id);
        typed.sequence = self.seq;
        self.reply_tx
            .send(typed)
            .map_err(|_| RunError::Other("registrar closed".into()))
    }
}

/// Wraps a [`Command`] for the loop's message store.
pub struct CommandMsg {
    /// The command capability.
    pub command: Command,
}

/// Registers a controller on a packet transport and feeds its loop.
pub struct Registrar {
    reply_tx: mpsc::UnboundedSender<Typed>,
    pipe: Option<Pipe>,
    pump: Option<ReplyPump>,
}

impl Registrar {
    /// Builds a registrar over a packet transport pair.
    pub fn new(
        reader: Box<dyn PacketRead>,
        writer: Box<dyn PacketWrite>,
        registry: Arc<Registry>,
    ) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut pipe = Pipe::new(reader, writer, registry);
        pipe.set_handler(Arc::new(RegistrarHandler { reply_tx: reply_tx.clone() }));
        let pump = ReplyPump { rx: reply_rx, sender: pipe.sender() };
        Self { reply_tx, pipe: Some(pipe), pump: Some(pump) }
    }

    /// Sends an event to whoever is connected.
    ///
    /// # Errors
    ///
    /// Fails only when the registrar has shut down.
    ///
    /// # Panics
    ///
    /// Panics if the message is not event kind.
    pub fn send_event(&self, msg: &dyn WireMessage) -> Result<(), RunError> {
        let typed = Typed::from_msg(msg);
        assert!(typed.is_event(), "message {:#010x} is not an event", typed.type_id);
        self.reply_tx
            .send(typed)
            .map_err(|_| RunError::Other("registrar closed".into()))
    }
}

impl LoopAdder for Registrar {
    fn add_to_loop(&mut self, lp: &mut Loop) {
        if let Some(pipe) = self.pipe.take() {
            lp.add_runnable(pipe);
        }
        if let Some(pump) = self.pump.take() {
            lp.add_runnable(pump);
        }
    }
}

struct RegistrarHandler {
    reply_tx: mpsc::UnboundedSender<Typed>,
}

#[async_trait]
impl TypedHandler for RegistrarHandler {
    async fn handle_typed(
        &self,
        ctx: &RunContext,
        msg: Decoded,
        typed: &Typed,
    ) -> Result<(), RunError> {
        let Some(lp) = ctx.loop_handle() else {
            return Ok(());
        };
        let posted: Message = if typed.is_command() {
            Box::new(CommandMsg {
                command: Command {
                    seq: typed.sequence,
                    msg,
                    reply_tx: self.reply_tx.clone(),
                },
            })
        } else {
            msg
        };
        lp.post_message(posted);
        lp.trigger_next();
        Ok(())
    }
}

struct ReplyPump {
    rx: mpsc::UnboundedReceiver<Typed>,
    sender: PipeSender,
}

#[async_trait]
impl Runnable for ReplyPump {
    async fn run(mut self: Box<Self>, ctx: RunContext) -> Result<(), RunError> {
        loop {
            let typed = tokio::select! {
                _ = ctx.cancelled() => return Err(RunError::Cancelled),
                recv = self.rx.recv() => match recv {
                    Some(typed) => typed,
                    None => return Ok(()),
                },
            };
            self.sender.send_typed(typed).await?;
        }
    }

    fn name(&self) -> &str {
        "registrar-replies"
    }
}

/// Fans `send_event` out across several registrars.
#[derive(Default)]
pub struct RegistrarMux {
    registrars: Vec<Registrar>,
}

impl RegistrarMux {
    /// An empty mux.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registrar to the fan-out.
    pub fn push(&mut self, registrar: Registrar) {
        self.registrars.push(registrar);
    }

    /// True when no registrar is attached.
    pub fn is_empty(&self) -> bool {
        self.registrars.is_empty()
    }

    /// Sends an event through every registrar, aggregating failures.
    pub fn send_event(&self, msg: &dyn WireMessage) -> Result<(), RunError> {
        let mut errs = ErrorList::default();
        for registrar in &self.registrars {
            errs.add(registrar.send_event(msg));
        }
        errs.aggregate()
    }
}

impl LoopAdder for RegistrarMux {
    fn add_to_loop(&mut self, lp: &mut Loop) {
        for registrar in &mut self.registrars {
            registrar.add_to_loop(lp);
        }
    }
}

/// Idle-priority sweep answering any command no controller claimed.
pub struct UnsupportedCommands;

impl scheduler::Controller for UnsupportedCommands {
    fn control(&mut self, cc: &mut ControlContext<'_>) -> Result<(), RunError> {
        cc.messages().process(|mctx| {
            if let Some(cmd_msg) = mctx.take_as::<CommandMsg>() {
                if let Err(err) = cmd_msg.command.done(&CommandErr::unsupported()) {
                    tracing::warn!(error = %err, "dropping unanswerable command");
                }
            }
        });
        Ok(())
    }
}

impl LoopAdder for UnsupportedCommands {
    fn add_to_loop(&mut self, lp: &mut Loop) {
        lp.add_controller(scheduler::IDLE, UnsupportedCommands);
    }
}
