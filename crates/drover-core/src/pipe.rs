//! A single duplex of typed messages over a packet transport.
//!
//! The pipe decodes in two stages: the envelope first, then the payload
//! against the registry. A command whose payload fails to decode is
//! answered with a `CommandErr` at the request's sequence so the sender's
//! future resolves instead of expiring; a failing event is dropped.
//! Envelope-level garbage terminates the pipe: the transport itself is
//! not trustworthy anymore.
//!
//! All sends serialize through one lock, keeping message atomicity on the
//! transport regardless of how many tasks are sending.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use drover_proto::{
    Registry, Typed,
    messages::{CommandErr, Decoded, WireMessage},
};

use crate::{
    error::RunError,
    runner::{RunContext, Runnable},
    transport::{PacketRead, PacketWrite},
};

/// Receives decoded inbound messages together with their envelope.
#[async_trait]
pub trait TypedHandler: Send + Sync {
    /// Called per good inbound message. An error terminates the pipe.
    async fn handle_typed(
        &self,
        ctx: &RunContext,
        msg: Decoded,
        typed: &Typed,
    ) -> Result<(), RunError>;
}

/// The shared send side of a pipe.
#[derive(Clone)]
pub struct PipeSender {
    writer: Arc<tokio::sync::Mutex<Box<dyn PacketWrite>>>,
}

impl PipeSender {
    /// Sends a command-kind message with an assigned sequence.
    ///
    /// # Panics
    ///
    /// Panics if the message is not command kind; that is a programming
    /// error, not a runtime condition.
    pub async fn send_command(&self, msg: &dyn WireMessage, seq: u32) -> std::io::Result<()> {
        let mut typed = Typed::from_msg(msg);
        assert!(typed.is_command(), "message {:#010x} is not a command", typed.type_id);
        typed.sequence = seq;
        self.send_typed(typed).await
    }

    /// Sends an event-kind message.
    ///
    /// # Panics
    ///
    /// Panics if the message is not event kind.
    pub async fn send_event(&self, msg: &dyn WireMessage) -> std::io::Result<()> {
        let typed = Typed::from_msg(msg);
        assert!(typed.is_event(), "message {:#010x} is not an event", typed.type_id);
        self.send_typed(typed).await
    }

    /// Sends a pre-built envelope.
    pub async fn send_typed(&self, typed: Typed) -> std::io::Result<()> {
        let packet = typed.encode_bytes();
        let mut writer = self.writer.lock().await;
        writer.write_packet(packet).await
    }
}

/// The duplex itself; run it to receive.
pub struct Pipe {
    reader: Box<dyn PacketRead>,
    sender: PipeSender,
    registry: Arc<Registry>,
    handler: Option<Arc<dyn TypedHandler>>,
}

impl Pipe {
    /// Builds a pipe over a transport pair.
    pub fn new(
        reader: Box<dyn PacketRead>,
        writer: Box<dyn PacketWrite>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            reader,
            sender: PipeSender { writer: Arc::new(tokio::sync::Mutex::new(writer)) },
            registry,
            handler: None,
        }
    }

    /// Installs the inbound handler.
    pub fn set_handler(&mut self, handler: Arc<dyn TypedHandler>) {
        self.handler = Some(handler);
    }

    /// The send side, cloneable into any task.
    pub fn sender(&self) -> PipeSender {
        self.sender.clone()
    }
}

#[async_trait]
impl Runnable for Pipe {
    async fn run(mut self: Box<Self>, ctx: RunContext) -> Result<(), RunError> {
        loop {
            let packet = tokio::select! {
                _ = ctx.cancelled() => return Err(RunError::Cancelled),
                read = self.reader.read_packet() => read?,
            };
            let typed = Typed::decode_bytes(&packet)?;
            match self.registry.decode(&typed) {
                Ok(msg) => {
                    if let Some(handler) = &self.handler {
                        handler.handle_typed(&ctx, msg, &typed).await?;
                    }
                },
                Err(err) => {
                    debug!(type_id = typed.type_id, error = %err, "undecodable message");
                    if typed.is_command() {
                        self.sender
                            .send_command(&CommandErr::new(err.to_string()), typed.sequence)
                            .await?;
                    }
                    // Undecodable events carry no obligation; skip.
                },
            }
        }
    }

    fn name(&self) -> &str {
        "pipe"
    }
}

