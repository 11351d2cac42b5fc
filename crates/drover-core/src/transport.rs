//! Packet transport abstraction for typed channels.
//!
//! A transport moves whole packets; framing is its problem, not the
//! caller's. The two halves are separate capabilities so a reader can be
//! owned by a receive task while writers are shared behind a lock.

use async_trait::async_trait;
use bytes::Bytes;

/// Reads whole packets.
#[async_trait]
pub trait PacketRead: Send {
    /// The next packet.
    ///
    /// # Errors
    ///
    /// An error means the transport is unusable; the caller tears down.
    /// A cleanly closed transport reports `io::ErrorKind::UnexpectedEof`.
    async fn read_packet(&mut self) -> std::io::Result<Bytes>;
}

/// Writes whole packets.
#[async_trait]
pub trait PacketWrite: Send {
    /// Writes one packet, completely or not at all.
    async fn write_packet(&mut self, packet: Bytes) -> std::io::Result<()>;
}
