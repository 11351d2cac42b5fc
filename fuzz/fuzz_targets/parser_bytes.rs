//! Byte-soup fuzzer for the link parser.
//!
//! Feeds arbitrary bytes (with interleaved timer expiries) to the parser
//! and checks the safety invariants on every step: the observable state
//! stays in the legal set, the only sync bytes emitted are SYNC_REQ and
//! SYNC_ACK, and any emitted packet is complete (code masked to its wire
//! bits, payload within bounds, sequence valid).

#![no_main]

use drover_core::link::{Parser, SyncState};
use drover_proto::packet::{CODE_MASK, MAX_DATA_LEN, PacketSeq, SYNC_ACK, SYNC_REQ};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = Parser::new();
    let legal = [
        SyncState::SYNCING,
        SyncState::READY,
        SyncState::READY | SyncState::RECEIVING,
        SyncState::SYNCING | SyncState::RECEIVING,
    ];

    for chunk in data.chunks(2) {
        let pr = match chunk {
            // A zero guide byte turns the next byte into a timer expiry.
            [0, _] | [0] => parser.timeout(),
            [_, b] | [b] => parser.parse(*b),
            _ => unreachable!("chunks(2) yields one or two bytes"),
        };

        assert!(legal.contains(&pr.state), "illegal state {:?}", pr.state);
        assert!(
            matches!(pr.sync, None | Some(SYNC_REQ) | Some(SYNC_ACK)),
            "illegal sync byte {:?}",
            pr.sync
        );
        assert_eq!(pr.state, parser.state());

        if let Some(packet) = pr.packet {
            assert_eq!(packet.code & !CODE_MASK, 0, "length bits leaked into code");
            assert!(packet.data.len() <= MAX_DATA_LEN, "oversized payload emitted");
            assert!(
                PacketSeq::from_byte(packet.seq.value()).is_some(),
                "invalid sequence emitted"
            );
            // No packet may be emitted from a resync step.
            assert_ne!(pr.sync, Some(SYNC_REQ), "packet emitted while resyncing");
        }
    }
});
