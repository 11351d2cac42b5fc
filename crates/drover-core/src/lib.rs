//! Drover runtime core
//!
//! This crate contains the three interlocking subsystems of the drover
//! robotics framework: the firmware link, the typed message channel, and
//! the control loop that hosts both.
//!
//! # Architecture
//!
//! ```text
//!       firmware ◄── bytes ──► link (parser / fifo / client)
//!                                        │ packets
//!       operator ◄── typed ──► pipe ── conn / registrar
//!          brains    packets             │ messages
//!                                        ▼
//!                              control loop (16 priority levels)
//!                                 ▲              ▲
//!                            controllers     runnables
//! ```
//!
//! # Key Principles
//!
//! - Controllers never block: they run as short synchronous callbacks on
//!   the loop's task and talk across iterations through the message
//!   store.
//! - Anything that blocks is a [`runner::Runnable`] under the loop's
//!   cancellation scope, feeding the loop with
//!   [`scheduler::LoopHandle::post_message`] +
//!   [`scheduler::LoopHandle::trigger_next`].
//! - Transports and buses are capability sets
//!   ([`transport::PacketRead`]/[`transport::PacketWrite`],
//!   [`pubsub::PubSub`]), not hierarchies; the concrete broker lives
//!   outside the core.
//!
//! # Modules
//!
//! - [`scheduler`]: the priority loop, controllers, hooks
//! - [`message`]: the per-iteration message store
//! - [`runner`]: background task supervision and cancellation
//! - [`link`]: the re-synchronizing firmware link
//! - [`pipe`], [`conn`], [`registrar`]: the typed channel
//! - [`pubsub`]: the abstract bus, topic matching, discovery
//! - [`transport`], [`stream`]: packet transports
//! - [`meta`], [`config`], [`error`]: identity, configuration, errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod conn;
pub mod error;
pub mod link;
pub mod message;
pub mod meta;
pub mod pipe;
pub mod pubsub;
pub mod registrar;
pub mod runner;
pub mod scheduler;
pub mod stream;
pub mod transport;

pub use config::Config;
pub use conn::{CommandFuture, Conn};
pub use error::{ConnError, LinkError, RunError};
pub use message::{Message, MessageStore};
pub use meta::{ControllerInfo, ControllerMeta, ControllerRef};
pub use pipe::{Pipe, PipeSender};
pub use registrar::{Command, CommandMsg, Registrar, RegistrarMux, UnsupportedCommands};
pub use runner::{RunContext, Runnable, Runner};
pub use scheduler::{ControlContext, Controller, Loop, LoopAdder, LoopHandle};
