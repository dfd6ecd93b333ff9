//! Property-based tests using proptest
//!
//! Frame extraction, cursor arithmetic, and version sniffing must hold up
//! for arbitrary inputs and arbitrary byte-stream fragmentation, not just
//! the hand-picked cases in the scenario tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Instant;

use proptest::prelude::*;

use realm_protocol::codec::cursor::{ByteReader, ByteWriter};
use realm_protocol::codec::framing::ConnBuffer;
use realm_protocol::codec::registry::{opcodes, Registry};

use common::{engine_with_backend, TestWorld};

fn tick_frame(counter: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_len(6);
    w.put_u16(0, opcodes::CLIENT_TICK);
    w.put_u32(2, counter);
    w.finish()
}

fn chat_frame(text: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(0, opcodes::CHAT);
    w.put_bytes(4, text);
    w.finish_variable()
}

// Property: chopping a frame stream into arbitrary chunks never changes
// the frames that come out, in content or in order.
proptest! {
    #[test]
    fn prop_reassembly_is_fragmentation_invariant(
        texts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..8),
        cuts in prop::collection::vec(any::<usize>(), 0..16),
    ) {
        let reg = Registry::builtin_client();
        let table = reg.table(20).unwrap();

        let mut frames = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            frames.push(tick_frame(i as u32));
            frames.push(chat_frame(text));
        }
        let stream: Vec<u8> = frames.iter().flatten().copied().collect();

        // split points from the random cuts, deduplicated and ordered
        let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
        points.sort_unstable();
        points.dedup();
        points.push(stream.len());

        let mut buf = ConnBuffer::new();
        let mut collected = Vec::new();
        let mut start = 0;
        for &end in &points {
            buf.feed(&stream[start..end]);
            start = end;
            while let Some(frame) = buf.peek_frame(table).expect("well-formed stream") {
                collected.push(frame.bytes().to_vec());
                buf.consume(frame.len());
            }
        }

        prop_assert_eq!(collected, frames);
        prop_assert_eq!(buf.pending_in(), 0);
    }
}

// Property: peeking never consumes, no matter how often it is repeated.
proptest! {
    #[test]
    fn prop_peek_is_idempotent(counter in any::<u32>(), peeks in 1usize..10) {
        let reg = Registry::builtin_client();
        let table = reg.table(20).unwrap();
        let mut buf = ConnBuffer::new();
        buf.feed(&tick_frame(counter));

        for _ in 0..peeks {
            let frame = buf.peek_frame(table).unwrap().expect("complete frame");
            prop_assert_eq!(frame.len(), 6);
        }
        prop_assert_eq!(buf.pending_in(), 6);
    }
}

// Property: descriptor lookup is pure; two lookups of the same pair agree,
// and an unregistered pair is None rather than a fallback.
proptest! {
    #[test]
    fn prop_registry_lookup_is_pure(version in any::<u16>(), opcode in any::<u16>()) {
        let reg = Registry::builtin_client();
        let a = reg.lookup(version, opcode).cloned();
        let b = reg.lookup(version, opcode).cloned();
        prop_assert_eq!(&a, &b);
        if reg.table(version).is_none() {
            prop_assert!(a.is_none());
        }
    }
}

// Property: cursor writes read back exactly, including the network-order
// accessors used for embedded addresses.
proptest! {
    #[test]
    fn prop_cursor_roundtrip(a in any::<u32>(), b in any::<u16>(), c in any::<i16>()) {
        let mut w = ByteWriter::with_len(16);
        w.put_u32(2, a);
        w.put_net_u32(6, a);
        w.put_net_u16(10, b);
        w.put_i16(12, c);
        let bytes = w.finish();

        let r = ByteReader::new(&bytes);
        prop_assert_eq!(r.u32_at(2).unwrap(), a);
        prop_assert_eq!(r.net_u32_at(6).unwrap(), a);
        prop_assert_eq!(r.net_u16_at(10).unwrap(), b);
        prop_assert_eq!(r.i16_at(12).unwrap(), c);
    }
}

// Property: out-of-bounds reads are errors, never truncated values.
proptest! {
    #[test]
    fn prop_cursor_rejects_out_of_bounds(len in 0usize..8, offset in 0usize..16) {
        let bytes = vec![0u8; len];
        let r = ByteReader::new(&bytes);
        let ok = offset + 4 <= len;
        prop_assert_eq!(r.u32_at(offset).is_ok(), ok);
    }
}

// Property: the handshake sniff accepts exactly the plausible account-id
// window. In range, some protocol version is negotiated; out of range, the
// connection is closed on the spot.
proptest! {
    #[test]
    fn prop_sniff_honors_the_account_window(account_id in any::<u32>(), char_id in 1u32..1_000_000) {
        let mut e = engine_with_backend(Arc::new(TestWorld::default()));
        let sid = e.session_opened(0);

        let mut w = ByteWriter::with_len(19);
        w.put_u16(0, opcodes::ENTER);
        w.put_u32(2, account_id);
        w.put_u32(6, char_id);
        w.put_u32(10, 0x1111_2222);
        w.put_u32(14, 0);
        w.put_u8(18, 1);
        let mut bytes = w.finish();
        // two trailing version queries push the buffer past the widest
        // handshake layout so the sniff cannot stall waiting for bytes
        bytes.extend_from_slice(&opcodes::ADMIN_VERSION.to_le_bytes());
        bytes.extend_from_slice(&opcodes::ADMIN_VERSION.to_le_bytes());
        e.feed(sid, &bytes);
        let closed = e.tick(Instant::now());

        let in_window = (2_000_000..=100_000_000).contains(&account_id);
        if in_window {
            prop_assert!(e.session(sid).unwrap().version.is_some());
            prop_assert!(closed.is_empty());
        } else {
            prop_assert_eq!(closed, vec![sid]);
        }
    }
}
