//! Link packet framing for the firmware serial channel.
//!
//! A packet is `[seq][code+len]([len])[data…]`. The second byte packs the
//! packet code with a 3-bit length field: lengths 0–6 ride inline in bits
//! 4–6, and the escape value 7 pushes the true length (0–127) into a third
//! header byte. Code bits 4–6 are therefore not transmittable; [`Packet`]
//! masks them out at construction and encode time.
//!
//! Sequence numbers never take the value 0 and never reach 0xF0: the top
//! sixteen values are reserved so the synchronization bytes ([`SYNC_REQ`],
//! [`SYNC_ACK`]) can never be mistaken for a sequence.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::{ProtocolError, Result};

/// Synchronization request byte. Also the answer to any framing violation:
/// the receiver re-requests sync rather than guessing where packets resume.
pub const SYNC_REQ: u8 = 0xff;

/// Synchronization acknowledge byte, always followed by the sender's
/// current sequence.
pub const SYNC_ACK: u8 = 0xfe;

/// Code bit 7 marks a packet as an event (unsolicited, never correlated
/// with a request sequence).
pub const CODE_EVENT: u8 = 0x80;

/// Code bit 0 marks a reply as an error. Outside replies the bit is
/// carried but has no assigned meaning.
pub const CODE_ERROR: u8 = 0x01;

/// Bits of the code that survive the wire (bits 4–6 carry the length).
pub const CODE_MASK: u8 = 0x8f;

/// Largest payload a packet can carry.
pub const MAX_DATA_LEN: usize = 127;

/// Link packet sequence number, constrained to `1..0xF0`.
///
/// The constraint is structural: a `PacketSeq` cannot be constructed
/// holding 0 or a reserved value, so downstream code never has to
/// re-validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSeq(u8);

impl PacketSeq {
    /// Validates a raw byte as a sequence number.
    pub fn from_byte(b: u8) -> Option<Self> {
        (b > 0 && b < 0xf0).then_some(Self(b))
    }

    /// Picks a random valid starting sequence.
    ///
    /// Starting from a random point makes stale packets from a previous
    /// session fail the sequence check instead of being accepted.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1u8..0xf0))
    }

    /// The next sequence: increment, wrapping the reserved range back to 1.
    #[must_use]
    pub fn next(self) -> Self {
        let n = self.0.wrapping_add(1);
        if n == 0 || n >= 0xf0 { Self(1) } else { Self(n) }
    }

    /// Raw byte value.
    pub fn value(self) -> u8 {
        self.0
    }
}

/// A framed unit on the firmware link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number; assigned by the sender, verified by the receiver.
    pub seq: PacketSeq,
    /// Packet code, masked to the transmittable bits.
    pub code: u8,
    /// Payload, at most [`MAX_DATA_LEN`] bytes.
    pub data: Bytes,
}

impl Packet {
    /// Creates a packet, masking the code to its wire bits.
    pub fn new(seq: PacketSeq, code: u8, data: impl Into<Bytes>) -> Self {
        Self { seq, code: code & CODE_MASK, data: data.into() }
    }

    /// True if the event bit is set.
    pub fn is_event(&self) -> bool {
        self.code & CODE_EVENT != 0
    }

    /// Encodes the packet into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_DATA_LEN`]; the escaped length byte must stay below 0x80 so
    /// it can never alias the sync bytes' range semantics.
    pub fn encode(&self) -> Result<Bytes> {
        let len = self.data.len();
        if len > MAX_DATA_LEN {
            return Err(ProtocolError::PayloadTooLarge { size: len, max: MAX_DATA_LEN });
        }
        let mut buf = BytesMut::with_capacity(len + 3);
        buf.put_u8(self.seq.value());
        if len < 7 {
            buf.put_u8((self.code & CODE_MASK) | ((len as u8) << 4));
        } else {
            buf.put_u8((self.code & CODE_MASK) | 0x70);
            buf.put_u8(len as u8);
        }
        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_rejects_reserved_values() {
        assert!(PacketSeq::from_byte(0).is_none());
        assert!(PacketSeq::from_byte(0xf0).is_none());
        assert!(PacketSeq::from_byte(SYNC_REQ).is_none());
        assert!(PacketSeq::from_byte(SYNC_ACK).is_none());
        assert_eq!(PacketSeq::from_byte(1).map(PacketSeq::value), Some(1));
        assert_eq!(PacketSeq::from_byte(0xef).map(PacketSeq::value), Some(0xef));
    }

    #[test]
    fn seq_wraps_before_reserved_range() {
        let seq = PacketSeq::from_byte(0xef).expect("valid seq");
        assert_eq!(seq.next().value(), 1);
        assert_eq!(PacketSeq::from_byte(1).expect("valid seq").next().value(), 2);
    }

    #[test]
    fn random_seq_is_always_valid() {
        for _ in 0..1000 {
            let seq = PacketSeq::random();
            assert!(PacketSeq::from_byte(seq.value()).is_some());
        }
    }

    #[test]
    fn encode_inline_length() {
        let pkt = Packet::new(PacketSeq::from_byte(3).expect("seq"), 0x02, vec![9, 8]);
        assert_eq!(pkt.encode().expect("encode").as_ref(), &[3, 0x22, 9, 8]);
    }

    #[test]
    fn encode_empty_payload() {
        let pkt = Packet::new(PacketSeq::from_byte(1).expect("seq"), 0x02, Bytes::new());
        assert_eq!(pkt.encode().expect("encode").as_ref(), &[1, 0x02]);
    }

    #[test]
    fn encode_escaped_length() {
        let pkt = Packet::new(PacketSeq::from_byte(4).expect("seq"), 0x02, vec![0u8; 8]);
        let bytes = pkt.encode().expect("encode");
        assert_eq!(&bytes[..3], &[4, 0x72, 8]);
        assert_eq!(bytes.len(), 3 + 8);
    }

    #[test]
    fn encode_masks_length_bits_out_of_code() {
        let pkt = Packet::new(PacketSeq::from_byte(1).expect("seq"), 0xff, Bytes::new());
        assert_eq!(pkt.code, 0x8f);
        assert_eq!(pkt.encode().expect("encode").as_ref(), &[1, 0x8f]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let pkt = Packet::new(PacketSeq::from_byte(1).expect("seq"), 0, vec![0u8; 128]);
        assert!(matches!(
            pkt.encode(),
            Err(ProtocolError::PayloadTooLarge { size: 128, max: 127 })
        ));
    }
}
