//! The firmware link: framing, synchronization, and request correlation
//! over a lossy peer-to-peer byte channel.
//!
//! Three layers, each usable on its own:
//!
//! - [`Parser`]: a pure byte-at-a-time state machine that frames packets
//!   and re-synchronizes after arbitrary garbage. No I/O.
//! - [`Fifo`]: drives the parser from an async byte duplex, answers
//!   handshakes, manages the sync timer, and sends outbound packets with
//!   a monotonically advancing sequence.
//! - [`Client`]: correlates command packets with their replies by
//!   sequence and surfaces unsolicited events.

mod client;
mod fifo;
mod parser;

pub use client::{Client, ClientDriver, PendingReply, Reply};
pub use fifo::{Fifo, FifoHandle, PacketHandler, StateNotifier};
pub use parser::{ParseResult, Parser, SyncState, TimerAction};
