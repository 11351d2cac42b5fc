//! # Drover Protocol: Wire Format
//!
//! This crate implements the wire types for the drover robotics framework:
//! the firmware link framing and the typed message envelope spoken between
//! robot controllers and operator-side brains.
//!
//! ## Protocol Design
//!
//! Two layers, with very different constraints:
//!
//! - **Link packets** ([`Packet`]): a 2–3 byte header plus up to 127 payload
//!   bytes, built for a lossy peer-to-peer serial channel. Sequence numbers
//!   double as the synchronization mechanism; there is no CRC (parity on the
//!   serial port covers bit errors when needed).
//!
//! - **Typed messages** ([`Typed`]): a protobuf envelope `{type_id, sequence,
//!   message}` carried over any packet transport. The type id partitions into
//!   kind/group/reply/id bit fields so routers can classify a message without
//!   decoding its payload.
//!
//! ## Implementation Notes
//!
//! - **Explicit Validation**: Constructors and parsers validate invariants
//!   and return `Result`. A link sequence of 0 or ≥ 0xF0 cannot be
//!   represented by [`PacketSeq`]; a payload over 127 bytes is rejected at
//!   encode time.
//!
//! - **Closed Builtin Set, Open Registry**: The builtin message set is
//!   table-driven in [`messages`], and the decode [`Registry`] accepts custom
//!   registrations in the reserved custom group.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod angle;
pub mod error;
pub mod messages;
pub mod packet;
pub mod typed;

pub use angle::Angle;
pub use error::{ProtocolError, Result};
pub use messages::{Registry, WireMessage};
pub use packet::{Packet, PacketSeq};
pub use typed::Typed;
