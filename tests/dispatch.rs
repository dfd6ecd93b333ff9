#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Dispatch-loop scenarios driven through the engine's public surface:
//! version sniffing, the authentication gate, fairness, and in-tick
//! teardown ordering.

mod common;

use std::sync::Arc;
use std::time::Instant;

use realm_protocol::backend::wire;
use realm_protocol::codec::cursor::ByteWriter;
use realm_protocol::codec::registry::opcodes;
use realm_protocol::config::NetworkConfig;
use realm_protocol::dispatch::engine::Engine;
use realm_protocol::dispatch::session::SessionPhase;
use realm_protocol::error::RejectReason;

use common::{
    chat_frame, client_tick_frame, connect_backend, engine_with_backend, handshake_v20,
    handshake_v25, login, TestWorld,
};

fn lone_world() -> Arc<TestWorld> {
    Arc::new(TestWorld::default().place(150_001, 1, 50, 50))
}

#[test]
fn login_round_trip_activates_the_session() {
    let mut e = engine_with_backend(lone_world());
    let sid = e.session_opened(0x7f00_0001);
    e.feed(sid, &handshake_v20(2_000_001, 150_001, 1));
    e.tick(Instant::now());

    // handshake accepted, backend round-trip in flight
    assert_eq!(e.session(sid).unwrap().phase, SessionPhase::AuthPending);
    let out = e.backend_outgoing();
    assert_eq!(common::backend_opcodes(&out), vec![wire::op::AUTH_REQ]);

    let ack = common::auth_ack_for(&e, 2_000_001);
    e.on_backend_bytes(&ack).unwrap();
    let s = e.session(sid).unwrap();
    assert_eq!(s.phase, SessionPhase::Active);
    assert_eq!(s.entity, Some(150_001));

    // the client got its account echo and the spawn acknowledgement
    let bytes = e.session_mut(sid).unwrap().take_outgoing();
    assert_eq!(&bytes[..4], &2_000_001u32.to_le_bytes());
    assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), opcodes::AUTH_OK);
}

#[test]
fn dedicated_handshake_opcode_selects_its_version() {
    let mut e = engine_with_backend(lone_world());
    let sid = e.session_opened(0);
    e.feed(sid, &handshake_v25(2_000_001, 150_001, 0));
    e.tick(Instant::now());
    assert_eq!(e.session(sid).unwrap().version, Some(25));
}

#[test]
fn ambiguous_handshake_resolves_to_the_newest_version() {
    // 22 bytes whose layout validates under both the 19-byte legacy
    // handshake and the widened one. The newer version must win.
    let mut e = engine_with_backend(lone_world());
    let sid = e.session_opened(0);
    let mut bytes = handshake_v20(2_000_001, 150_001, 1);
    bytes.resize(22, 0);
    e.feed(sid, &bytes);
    e.tick(Instant::now());
    assert_eq!(e.session(sid).unwrap().version, Some(22));
}

#[test]
fn account_id_zero_rejected_for_every_version() {
    for handshake in [
        handshake_v20(0, 150_001, 0),
        handshake_v25(0, 150_001, 0),
    ] {
        let mut e = engine_with_backend(lone_world());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sid = e.session_opened(0);
        e.attach_writer(sid, tx);
        // pad past the longest handshake layout so the sniff is not
        // waiting for more input
        let mut bytes = handshake;
        bytes.resize(22, 0);
        e.feed(sid, &bytes);
        let closed = e.tick(Instant::now());

        assert_eq!(closed, vec![sid]);
        let out = rx.try_recv().unwrap();
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), opcodes::REJECT);
        assert_eq!(out[2], RejectReason::VersionRejected.code());
    }
}

#[test]
fn fairness_bound_holds_under_flood() {
    let mut e = engine_with_backend(lone_world());
    let sid = login(&mut e, &handshake_v20(2_000_001, 150_001, 1), 2_000_001);
    let before = e.metrics().snapshot().frames_dispatched;

    let frame = client_tick_frame();
    for _ in 0..20 {
        e.feed(sid, &frame);
    }
    e.tick(Instant::now());

    let per_tick = e.config().server.frames_per_tick as u64;
    assert_eq!(e.metrics().snapshot().frames_dispatched, before + per_tick);
    assert_eq!(
        e.session(sid).unwrap().buf.pending_in(),
        (20 - per_tick as usize) * frame.len()
    );
}

#[test]
fn flood_does_not_starve_the_quiet_connection() {
    let world = Arc::new(
        TestWorld::default()
            .place(150_001, 1, 50, 50)
            .place(150_002, 1, 52, 50),
    );
    let mut e = engine_with_backend(world);
    let spammer = login(&mut e, &handshake_v20(2_000_001, 150_001, 1), 2_000_001);
    let quiet = login(&mut e, &handshake_v20(2_000_002, 150_002, 1), 2_000_002);

    let frame = client_tick_frame();
    for _ in 0..50 {
        e.feed(spammer, &frame);
    }
    e.feed(quiet, &frame);
    e.tick(Instant::now());

    // the quiet session's single frame was answered this very tick
    let out = e.session_mut(quiet).unwrap().take_outgoing();
    assert_eq!(u16::from_le_bytes([out[0], out[1]]), opcodes::SERVER_TICK);
}

#[test]
fn gameplay_frame_before_auth_is_fatal() {
    let mut e = engine_with_backend(lone_world());
    let sid = e.session_opened(0);
    // valid handshake first so the version is known, then a gameplay
    // frame while authentication is still pending
    e.feed(sid, &handshake_v20(2_000_001, 150_001, 1));
    e.feed(sid, &chat_frame(b"too early"));
    let closed = e.tick(Instant::now());
    assert_eq!(closed, vec![sid]);
}

#[test]
fn unknown_opcode_for_version_disconnects() {
    let mut e = engine_with_backend(lone_world());
    let sid = login(&mut e, &handshake_v25(2_000_001, 150_001, 1), 2_000_001);
    // the legacy handshake opcode does not exist in version 25
    let mut w = ByteWriter::with_len(19);
    w.put_u16(0, opcodes::ENTER);
    let f = w.finish();
    e.feed(sid, &f);
    let closed = e.tick(Instant::now());
    assert_eq!(closed, vec![sid]);
    assert_eq!(e.metrics().snapshot().protocol_violations, 1);
}

#[test]
fn quit_stops_dispatch_for_trailing_frames() {
    let mut e = engine_with_backend(lone_world());
    let sid = login(&mut e, &handshake_v20(2_000_001, 150_001, 1), 2_000_001);
    let before = e.metrics().snapshot().frames_dispatched;

    let mut w = ByteWriter::with_len(4);
    w.put_u16(0, opcodes::QUIT);
    w.put_u16(2, 0);
    let quit = w.finish();
    e.feed(sid, &quit);
    e.feed(sid, &client_tick_frame());
    e.feed(sid, &client_tick_frame());
    let closed = e.tick(Instant::now());

    assert_eq!(closed, vec![sid]);
    // only the quit frame itself was dispatched
    assert_eq!(e.metrics().snapshot().frames_dispatched, before + 1);
}

#[test]
fn oversized_variable_frame_is_fatal() {
    let mut e = engine_with_backend(lone_world());
    let sid = login(&mut e, &handshake_v20(2_000_001, 150_001, 1), 2_000_001);
    let mut bad = Vec::new();
    bad.extend_from_slice(&opcodes::CHAT.to_le_bytes());
    bad.extend_from_slice(&50_000u16.to_le_bytes());
    e.feed(sid, &bad);
    let closed = e.tick(Instant::now());
    assert_eq!(closed, vec![sid]);
}

#[test]
fn connection_limit_rejects_with_server_closed() {
    let cfg = NetworkConfig::default_with_overrides(|c| c.server.max_connections = 1);
    let mut e = Engine::new(cfg, lone_world());
    connect_backend(&mut e);

    let _first = e.session_opened(0);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let second = e.session_opened(0);
    e.attach_writer(second, tx);
    let closed = e.tick(Instant::now());

    assert_eq!(closed, vec![second]);
    let out = rx.try_recv().unwrap();
    assert_eq!(out[2], RejectReason::ServerClosed.code());
}

#[test]
fn byte_stream_split_points_do_not_matter() {
    // One canonical conversation: handshake then three version queries,
    // all legal while the backend round-trip is still in flight.
    let mut stream = handshake_v20(2_000_001, 150_001, 1);
    for _ in 0..3 {
        stream.extend_from_slice(&opcodes::ADMIN_VERSION.to_le_bytes());
    }

    for split in 1..stream.len() {
        let mut e = engine_with_backend(lone_world());
        let sid = e.session_opened(0);
        e.feed(sid, &stream[..split]);
        e.tick(Instant::now());
        e.feed(sid, &stream[split..]);
        e.tick(Instant::now());
        let s = e.session(sid).unwrap();
        assert_eq!(s.version, Some(20), "split {split}");
        assert_eq!(s.phase, SessionPhase::AuthPending, "split {split}");
        assert!(e.auth_store().find(2_000_001).is_some(), "split {split}");
    }
}
