//! Re-synchronizing packet parser for the firmware link.
//!
//! # Architecture: pure state machine
//!
//! The parser consumes exactly one byte (or one timer expiry) per call
//! and returns a [`ParseResult`] describing everything the driver must
//! do: a sync byte to transmit, the new observable state, and possibly a
//! completed packet. It performs no I/O and keeps no clock, which makes
//! every transition table-testable.
//!
//! # Synchronization
//!
//! Both peers converge on each other's sequence numbers through a two
//! byte handshake: `SYNC_REQ` answered by `SYNC_ACK` + sender's current
//! sequence, and symmetrically. Any violation (unexpected byte, invalid
//! sequence, invalid length, timer expiry mid-packet) takes the uniform
//! exit: drop the partial packet, emit a single `SYNC_REQ`, and restart
//! from the beginning. A partial packet is never emitted.
//!
//! # Observable states
//!
//! Externally the parser is in one of `{Syncing, Ready, Ready|Receiving,
//! Syncing|Receiving}`; `Receiving` alone never occurs. Drivers restart
//! their timer while receiving, stop it when ready, and leave it alone
//! otherwise ([`ParseResult::timer_action`]).

use bytes::BytesMut;

use drover_proto::packet::{CODE_MASK, Packet, PacketSeq, SYNC_ACK, SYNC_REQ};

/// Observable synchronization state, a bit set of ready/receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState(u8);

impl SyncState {
    /// Not synchronized, idle.
    pub const SYNCING: SyncState = SyncState(0);
    /// Synchronized; between packets.
    pub const READY: SyncState = SyncState(0x01);
    /// Mid-handshake or mid-packet.
    pub const RECEIVING: SyncState = SyncState(0x02);

    /// True when packets can be sent.
    pub fn is_ready(self) -> bool {
        self.0 & Self::READY.0 != 0
    }

    /// True while a handshake or packet is in flight.
    pub fn is_receiving(self) -> bool {
        self.0 & Self::RECEIVING.0 != 0
    }
}

impl std::ops::BitOr for SyncState {
    type Output = SyncState;

    fn bitor(self, rhs: SyncState) -> SyncState {
        SyncState(self.0 | rhs.0)
    }
}

/// What the driver should do with its sync timer after a parse step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Leave the timer as it is.
    NoChange,
    /// Restart the timer.
    Restart,
    /// Stop the timer.
    Stop,
}

/// The outcome of one parse step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    /// A sync byte to transmit, if any ([`SYNC_REQ`] or [`SYNC_ACK`]).
    pub sync: Option<u8>,
    /// Observable state after the step.
    pub state: SyncState,
    /// A completed packet, if the step finished one.
    pub packet: Option<Packet>,
}

impl ParseResult {
    /// Derives the timer handling: restart while receiving or right
    /// after requesting sync, stop once ready, otherwise leave alone.
    pub fn timer_action(&self) -> TimerAction {
        if self.state.is_receiving() || self.sync == Some(SYNC_REQ) {
            TimerAction::Restart
        } else if self.state.is_ready() {
            TimerAction::Stop
        } else {
            TimerAction::NoChange
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    /// Sync requested, waiting for the peer's SYNC byte.
    SyncAck,
    /// Got SYNC_REQ, waiting for the peer's sequence.
    SyncReqSeq,
    /// Got SYNC_ACK, waiting for the peer's sequence.
    SyncAckSeq,
    /// Synchronized, waiting for the next packet's sequence.
    MsgSeq,
    /// Got SYNC_ACK while ready, validating the repeated sequence.
    MsgAckSeq,
    /// Waiting for the code byte.
    MsgCode,
    /// Waiting for the escaped length byte.
    MsgLen,
    /// Accumulating payload bytes.
    MsgData,
}

struct Partial {
    seq: PacketSeq,
    code: u8,
    data: BytesMut,
    expect: usize,
}

/// The link parser. See the module docs for the protocol walk-through.
pub struct Parser {
    state: State,
    peer_seq: Option<PacketSeq>,
    partial: Option<Partial>,
}

impl Parser {
    /// Creates a parser in the syncing state. Call [`Parser::reset`]
    /// before feeding bytes so the initial `SYNC_REQ` goes out.
    pub fn new() -> Self {
        Self { state: State::SyncAck, peer_seq: None, partial: None }
    }

    /// The current observable state.
    pub fn state(&self) -> SyncState {
        match self.state {
            State::SyncAck => SyncState::SYNCING,
            State::SyncReqSeq | State::SyncAckSeq => SyncState::SYNCING | SyncState::RECEIVING,
            State::MsgSeq => SyncState::READY,
            _ => SyncState::READY | SyncState::RECEIVING,
        }
    }

    /// Resets to the syncing state, emitting a fresh `SYNC_REQ`.
    pub fn reset(&mut self) -> ParseResult {
        self.partial = None;
        let sync = self.resync();
        self.result(sync, None)
    }

    /// Consumes one received byte.
    pub fn parse(&mut self, b: u8) -> ParseResult {
        let (sync, packet) = self.parse_byte(b);
        self.result(sync, packet)
    }

    /// Notifies the parser that the driver's sync timer expired. A
    /// no-op between packets; anywhere else the pending transfer is
    /// considered lost and the link re-syncs.
    pub fn timeout(&mut self) -> ParseResult {
        let sync = if self.state == State::MsgSeq { None } else { self.resync() };
        self.result(sync, None)
    }

    fn result(&self, sync: Option<u8>, packet: Option<Packet>) -> ParseResult {
        ParseResult { sync, state: self.state(), packet }
    }

    fn parse_byte(&mut self, b: u8) -> (Option<u8>, Option<Packet>) {
        match self.state {
            State::SyncAck => {
                match b {
                    SYNC_REQ => self.state = State::SyncReqSeq,
                    SYNC_ACK => self.state = State::SyncAckSeq,
                    // Everything else is noise while waiting for sync.
                    _ => {},
                }
                (None, None)
            },
            State::SyncReqSeq => match PacketSeq::from_byte(b) {
                Some(seq) => {
                    self.peer_seq = Some(seq);
                    self.state = State::MsgSeq;
                    (Some(SYNC_ACK), None)
                },
                None => (self.resync(), None),
            },
            State::SyncAckSeq => match PacketSeq::from_byte(b) {
                Some(seq) => {
                    self.peer_seq = Some(seq);
                    self.state = State::MsgSeq;
                    (None, None)
                },
                None => (self.resync(), None),
            },
            State::MsgSeq => {
                if b == SYNC_REQ {
                    self.state = State::SyncReqSeq;
                    return (None, None);
                }
                if b == SYNC_ACK {
                    self.state = State::MsgAckSeq;
                    return (None, None);
                }
                let Some(seq) = self.peer_seq else {
                    return (self.resync(), None);
                };
                if b != seq.value() {
                    return (self.resync(), None);
                }
                self.partial =
                    Some(Partial { seq, code: 0, data: BytesMut::new(), expect: 0 });
                self.peer_seq = Some(seq.next());
                self.state = State::MsgCode;
                (None, None)
            },
            State::MsgAckSeq => {
                if self.peer_seq.map(PacketSeq::value) == Some(b) {
                    self.state = State::MsgSeq;
                    (None, None)
                } else {
                    (self.resync(), None)
                }
            },
            State::MsgCode => {
                let Some(partial) = self.partial.as_mut() else {
                    return (self.resync(), None);
                };
                partial.code = b & CODE_MASK;
                match (b >> 4) & 7 {
                    0 => (None, self.packet_ready()),
                    7 => {
                        self.state = State::MsgLen;
                        (None, None)
                    },
                    len => {
                        partial.expect = len as usize;
                        partial.data.reserve(len as usize);
                        self.state = State::MsgData;
                        (None, None)
                    },
                }
            },
            State::MsgLen => {
                if b >= 0x80 {
                    return (self.resync(), None);
                }
                if b == 0 {
                    return (None, self.packet_ready());
                }
                let Some(partial) = self.partial.as_mut() else {
                    return (self.resync(), None);
                };
                partial.expect = b as usize;
                partial.data.reserve(b as usize);
                self.state = State::MsgData;
                (None, None)
            },
            State::MsgData => {
                let Some(partial) = self.partial.as_mut() else {
                    return (self.resync(), None);
                };
                partial.data.extend_from_slice(&[b]);
                if partial.data.len() >= partial.expect {
                    (None, self.packet_ready())
                } else {
                    (None, None)
                }
            },
        }
    }

    fn resync(&mut self) -> Option<u8> {
        self.partial = None;
        self.state = State::SyncAck;
        Some(SYNC_REQ)
    }

    fn packet_ready(&mut self) -> Option<Packet> {
        self.state = State::MsgSeq;
        self.partial
            .take()
            .map(|p| Packet { seq: p.seq, code: p.code, data: p.data.freeze() })
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
