//! Deterministic test doubles for drover scenarios.
//!
//! This crate provides in-memory implementations of the core's transport
//! and bus capabilities, so whole controller⇄operator conversations run
//! inside one process under tokio's (pausable) clock:
//!
//! - [`MemBus`]: a broker with retained messages and wildcard routing
//! - [`packet_pair`]: cross-wired in-process packet transports
//! - [`Telemetry`]: a custom-group event message for pub/sub scenarios

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod loopback;
mod mem_bus;
mod messages;

pub use loopback::{ChanPacketReader, ChanPacketWriter, packet_pair};
pub use mem_bus::MemBus;
pub use messages::{TELEMETRY, Telemetry};
