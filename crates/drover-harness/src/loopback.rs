//! In-process packet transports.
//!
//! [`packet_pair`] cross-wires two mpsc channels into a pair of packet
//! transports, so a conn and a registrar can talk inside one test
//! without any framing layer in between.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use drover_core::transport::{PacketRead, PacketWrite};

/// Reads packets from the paired writer.
pub struct ChanPacketReader {
    rx: mpsc::Receiver<Bytes>,
}

/// Writes packets to the paired reader.
pub struct ChanPacketWriter {
    tx: mpsc::Sender<Bytes>,
}

/// A cross-wired transport pair: what side A writes, side B reads, and
/// vice versa.
#[allow(clippy::type_complexity)]
pub fn packet_pair() -> (
    (ChanPacketReader, ChanPacketWriter),
    (ChanPacketReader, ChanPacketWriter),
) {
    let (a_tx, b_rx) = mpsc::channel(16);
    let (b_tx, a_rx) = mpsc::channel(16);
    (
        (ChanPacketReader { rx: a_rx }, ChanPacketWriter { tx: a_tx }),
        (ChanPacketReader { rx: b_rx }, ChanPacketWriter { tx: b_tx }),
    )
}

#[async_trait]
impl PacketRead for ChanPacketReader {
    async fn read_packet(&mut self) -> std::io::Result<Bytes> {
        self.rx.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed")
        })
    }
}

#[async_trait]
impl PacketWrite for ChanPacketWriter {
    async fn write_packet(&mut self, packet: Bytes) -> std::io::Result<()> {
        self.tx.send(packet).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed")
        })
    }
}
