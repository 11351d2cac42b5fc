//! Typed message envelope.
//!
//! Every message between a robot controller and an operator-side brain is
//! wrapped in a [`Typed`] envelope: a protobuf message carrying the type id,
//! an optional command sequence, and the payload bytes. Routers classify
//! messages from the type id alone; payloads are only decoded at the edges.
//!
//! # Type Id Partitioning
//!
//! ```text
//!  bit 31       bits 16–30      bit 15      bits 0–14
//! ┌───────┬──────────────────┬──────────┬──────────────┐
//! │ kind  │      group       │  reply   │      id      │
//! │ 0=cmd │                  │          │              │
//! │ 1=evt │                  │          │              │
//! └───────┴──────────────────┴──────────┴──────────────┘
//! ```
//!
//! A command reply reuses the id of its request with the reply bit set, so
//! request/reply pairing is a single XOR away. Events never correlate by
//! sequence; their `sequence` field is left at zero.

use bytes::Bytes;
use prost::Message as _;

use crate::error::{ProtocolError, Result};

/// Kind bit: set for events, clear for commands (and their replies).
pub const KIND_MASK: u32 = 0x8000_0000;
/// Group field, bits 16–30.
pub const GROUP_MASK: u32 = 0x7fff_0000;
/// Reply flag, bit 15.
pub const REPLY_BIT: u32 = 0x0000_8000;
/// Message id within a group, bits 0–14.
pub const ID_MASK: u32 = 0x0000_7fff;

/// Kind value for commands.
pub const KIND_COMMAND: u32 = 0x0000_0000;
/// Kind value for events.
pub const KIND_EVENT: u32 = 0x8000_0000;

/// The wire envelope for typed messages.
///
/// Encoded as protobuf: `type_id` and `sequence` are varint fields, the
/// payload is a length-delimited bytes field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Typed {
    /// Message type id; see the partitioning diagram in the module docs.
    #[prost(uint32, tag = "1")]
    pub type_id: u32,
    /// Command sequence for commands and replies; zero for events.
    #[prost(uint32, tag = "2")]
    pub sequence: u32,
    /// Encoded message payload.
    #[prost(bytes = "bytes", tag = "3")]
    pub message: Bytes,
}

impl Typed {
    /// Wraps already-encoded payload bytes with a type id.
    pub fn new(type_id: u32, message: impl Into<Bytes>) -> Self {
        Self { type_id, sequence: 0, message: message.into() }
    }

    /// Kind field of the type id.
    pub fn kind(&self) -> u32 {
        self.type_id & KIND_MASK
    }

    /// Group field of the type id.
    pub fn group(&self) -> u32 {
        self.type_id & GROUP_MASK
    }

    /// True if this is a command or a command reply.
    pub fn is_command(&self) -> bool {
        self.kind() == KIND_COMMAND
    }

    /// True if this is an event.
    pub fn is_event(&self) -> bool {
        self.kind() == KIND_EVENT
    }

    /// True if the reply flag is set.
    pub fn is_reply(&self) -> bool {
        self.type_id & REPLY_BIT != 0
    }

    /// Encodes the envelope to wire bytes.
    pub fn encode_bytes(&self) -> Bytes {
        self.encode_to_vec().into()
    }

    /// Decodes an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Envelope`] if the bytes are not a valid
    /// envelope.
    pub fn decode_bytes(data: &[u8]) -> Result<Self> {
        Self::decode(data).map_err(|e| ProtocolError::Envelope(e.to_string()))
    }
}
