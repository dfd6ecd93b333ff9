//! Shared fixtures: a deterministic world index and helpers that drive a
//! full login through the engine's public surface.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use realm_protocol::backend::wire;
use realm_protocol::broadcast::{EntityId, MapId, Position, WorldIndex};
use realm_protocol::codec::cursor::ByteWriter;
use realm_protocol::codec::registry::opcodes;
use realm_protocol::config::NetworkConfig;
use realm_protocol::dispatch::engine::Engine;
use realm_protocol::dispatch::session::SessionId;

/// Static world built up front and frozen behind an `Arc`.
#[derive(Default)]
pub struct TestWorld {
    pub positions: HashMap<EntityId, Position>,
    pub parties: HashMap<EntityId, u32>,
    pub guilds: HashMap<EntityId, u32>,
    pub teams: HashMap<EntityId, u32>,
    pub chats: HashMap<EntityId, u32>,
    pub party_spies: HashMap<u32, Vec<EntityId>>,
}

impl TestWorld {
    pub fn place(mut self, entity: EntityId, map: MapId, x: i16, y: i16) -> Self {
        self.positions.insert(entity, Position { map, x, y });
        self
    }
}

fn members_of(assign: &HashMap<EntityId, u32>, group: u32) -> Vec<EntityId> {
    let mut v: Vec<EntityId> = assign
        .iter()
        .filter(|(_, &g)| g == group)
        .map(|(&e, _)| e)
        .collect();
    v.sort_unstable();
    v
}

impl WorldIndex for TestWorld {
    fn position(&self, entity: EntityId) -> Option<Position> {
        self.positions.get(&entity).copied()
    }

    fn entities_in_rect(&self, map: MapId, x0: i16, y0: i16, x1: i16, y1: i16) -> Vec<EntityId> {
        let mut v: Vec<EntityId> = self
            .positions
            .iter()
            .filter(|(_, p)| p.map == map && p.x >= x0 && p.x <= x1 && p.y >= y0 && p.y <= y1)
            .map(|(&e, _)| e)
            .collect();
        v.sort_unstable();
        v
    }

    fn party_of(&self, entity: EntityId) -> Option<u32> {
        self.parties.get(&entity).copied()
    }
    fn guild_of(&self, entity: EntityId) -> Option<u32> {
        self.guilds.get(&entity).copied()
    }
    fn team_of(&self, entity: EntityId) -> Option<u32> {
        self.teams.get(&entity).copied()
    }
    fn chat_of(&self, entity: EntityId) -> Option<u32> {
        self.chats.get(&entity).copied()
    }

    fn party_members(&self, party: u32) -> Vec<EntityId> {
        members_of(&self.parties, party)
    }
    fn guild_members(&self, guild: u32) -> Vec<EntityId> {
        members_of(&self.guilds, guild)
    }
    fn team_members(&self, team: u32) -> Vec<EntityId> {
        members_of(&self.teams, team)
    }
    fn chat_members(&self, chat: u32) -> Vec<EntityId> {
        members_of(&self.chats, chat)
    }

    fn party_spies(&self, party: u32) -> Vec<EntityId> {
        self.party_spies.get(&party).cloned().unwrap_or_default()
    }
}

/// Engine with the built-in tables and a ready backend link.
pub fn engine_with_backend(world: Arc<dyn WorldIndex>) -> Engine {
    let mut e = Engine::new(NetworkConfig::default(), world);
    connect_backend(&mut e);
    e
}

/// Drive the backend connect handshake to `ready` and drain the output.
pub fn connect_backend(e: &mut Engine) {
    e.backend_socket_opened();
    let _ = e.backend_outgoing();
    let mut w = ByteWriter::with_len(3);
    w.put_u16(0, wire::op::CONNECT_ACK);
    w.put_u8(2, 0);
    e.on_backend_bytes(&w.finish()).expect("connect ack");
    let _ = e.backend_outgoing();
}

pub fn handshake_v20(account_id: u32, char_id: u32, sex: u8) -> Vec<u8> {
    let mut w = ByteWriter::with_len(19);
    w.put_u16(0, opcodes::ENTER);
    w.put_u32(2, account_id);
    w.put_u32(6, char_id);
    w.put_u32(10, 0x1111_2222);
    w.put_u32(14, 0);
    w.put_u8(18, sex);
    w.finish()
}

pub fn handshake_v25(account_id: u32, char_id: u32, sex: u8) -> Vec<u8> {
    let mut w = ByteWriter::with_len(19);
    w.put_u16(0, opcodes::ENTER_V25);
    w.put_u32(2, account_id);
    w.put_u32(6, char_id);
    w.put_u32(10, 0x1111_2222);
    w.put_u32(14, 0);
    w.put_u8(18, sex);
    w.finish()
}

/// Backend auth acknowledgement echoing the node's real tokens.
pub fn auth_ack_for(e: &Engine, account_id: u32) -> Vec<u8> {
    let node = e.auth_store().find(account_id).expect("pending login node");
    let mut w = ByteWriter::with_len(18);
    w.put_u16(0, wire::op::AUTH_ACK);
    w.put_u32(2, node.account_id);
    w.put_u32(6, node.char_id);
    w.put_u32(10, node.token1);
    w.put_u32(14, node.token2);
    w.finish()
}

/// Full login round-trip: handshake, backend ack, drained output. The
/// session ends up `Active` with entity id `char_id`.
pub fn login(e: &mut Engine, handshake: &[u8], account_id: u32) -> SessionId {
    let sid = e.session_opened(0x7f00_0001);
    e.feed(sid, handshake);
    e.tick(Instant::now());
    let ack = auth_ack_for(e, account_id);
    e.on_backend_bytes(&ack).expect("auth ack");
    let _ = e.backend_outgoing();
    let _ = e
        .session_mut(sid)
        .expect("session survives login")
        .take_outgoing();
    sid
}

pub fn client_tick_frame() -> Vec<u8> {
    let mut w = ByteWriter::with_len(6);
    w.put_u16(0, opcodes::CLIENT_TICK);
    w.put_u32(2, 42);
    w.finish()
}

pub fn chat_frame(text: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(0, opcodes::CHAT);
    w.put_bytes(4, text);
    w.finish_variable()
}

/// Split a concatenated backend byte stream into its frame opcodes using
/// the published length table.
pub fn backend_opcodes(mut bytes: &[u8]) -> Vec<u16> {
    let mut ops = Vec::new();
    while bytes.len() >= 2 {
        let op = u16::from_le_bytes([bytes[0], bytes[1]]);
        let len = wire::PACKET_LENGTHS
            .iter()
            .find(|(o, _)| *o == op)
            .map(|&(_, l)| l)
            .expect("opcode in backend length table");
        let len = if len == -1 {
            u16::from_le_bytes([bytes[2], bytes[3]]) as usize
        } else {
            len as usize
        };
        ops.push(op);
        bytes = &bytes[len..];
    }
    ops
}
