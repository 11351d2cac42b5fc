//! Length-prefixed packet framing over byte streams.
//!
//! Each packet is preceded by a little-endian `u32` length. Suitable for
//! TCP sockets, pipes, and anything else that looks like an ordered byte
//! stream.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::{PacketRead, PacketWrite};

/// Upper bound on a framed packet; larger length prefixes are treated as
/// stream corruption rather than allocation requests.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// The read half of a length-prefixed stream transport.
pub struct StreamReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

/// The write half of a length-prefixed stream transport.
pub struct StreamWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Splits a byte stream into a packet transport pair.
pub fn stream_transport(
    stream: impl AsyncRead + AsyncWrite + Send + 'static,
) -> (StreamReader, StreamWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (StreamReader { inner: Box::new(reader) }, StreamWriter { inner: Box::new(writer) })
}

#[async_trait]
impl PacketRead for StreamReader {
    async fn read_packet(&mut self) -> io::Result<Bytes> {
        let mut prefix = [0u8; 4];
        self.inner.read_exact(&mut prefix).await?;
        let size = u32::from_le_bytes(prefix) as usize;
        if size > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet of {size} bytes exceeds maximum {MAX_PACKET_SIZE}"),
            ));
        }
        let mut packet = vec![0u8; size];
        self.inner.read_exact(&mut packet).await?;
        Ok(packet.into())
    }
}

#[async_trait]
impl PacketWrite for StreamWriter {
    async fn write_packet(&mut self, packet: Bytes) -> io::Result<()> {
        self.inner.write_all(&(packet.len() as u32).to_le_bytes()).await?;
        self.inner.write_all(&packet).await?;
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn packets_round_trip() {
        let (local, remote) = duplex(256);
        let (mut reader, _) = stream_transport(local);
        let (_, mut writer) = stream_transport(remote);

        writer.write_packet(Bytes::from_static(b"first")).await.expect("write");
        writer.write_packet(Bytes::new()).await.expect("write empty");
        writer.write_packet(Bytes::from_static(b"second")).await.expect("write");

        assert_eq!(reader.read_packet().await.expect("read").as_ref(), b"first");
        assert!(reader.read_packet().await.expect("read empty").is_empty());
        assert_eq!(reader.read_packet().await.expect("read").as_ref(), b"second");
    }

    #[tokio::test]
    async fn oversized_prefix_is_corruption() {
        let (local, remote) = duplex(64);
        let (mut reader, _) = stream_transport(local);
        let (_, mut raw_writer) = tokio::io::split(remote);
        raw_writer.write_all(&u32::MAX.to_le_bytes()).await.expect("write");
        let err = reader.read_packet().await.expect_err("must reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
