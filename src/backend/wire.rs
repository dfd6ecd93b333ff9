//! # Backend-Link Wire Protocol
//!
//! The private opcode space spoken only between this server and the
//! authoritative backend process. It uses the same framing rule as the
//! client protocol (2-byte LE opcode, optional 2-byte total length at
//! offset 2) but lives in a historically non-overlapping opcode range,
//! and has exactly one version.
//!
//! Inbound frames decode into [`BackendMsg`]; outbound messages are built
//! by the `encode_*` functions. Embedded IPv4 addresses and ports travel
//! in network order.

use crate::codec::cursor::{ByteReader, ByteWriter};
use crate::codec::framing::Frame;
use crate::error::{ProtocolError, Result};

/// The backend protocol never revs independently of the handshake; the
/// registry still wants a version key.
pub const BACKEND_VERSION: u16 = 0;

/// Fixed-width account/server name fields.
pub const NAME_LEN: usize = 24;
/// Fixed-width map name field in route messages.
pub const MAP_NAME_LEN: usize = 16;

/// Backend opcodes.
pub mod op {
    /// Out: connect handshake (credentials + our public address).
    pub const CONNECT_REQ: u16 = 0x2af8;
    /// In: connect acknowledgement (ok / refused).
    pub const CONNECT_ACK: u16 = 0x2af9;
    /// Out: our full area-of-responsibility list.
    pub const AREA_LIST: u16 = 0x2afa;
    /// In: area list accepted; carries the backend's server name.
    pub const AREA_LIST_ACK: u16 = 0x2afb;
    /// Out: per-session authentication request.
    pub const AUTH_REQ: u16 = 0x2b26;
    /// In: authentication accepted.
    pub const AUTH_ACK: u16 = 0x2afd;
    /// In: authentication refused.
    pub const AUTH_FAIL: u16 = 0x2b27;
    /// Out: final-save request for a departing session.
    pub const SAVE_REQ: u16 = 0x2b01;
    /// In: final save completed.
    pub const SAVE_ACK: u16 = 0x2b21;
    /// Out: map-change route request.
    pub const ROUTE_REQ: u16 = 0x2b05;
    /// In: map-change route answer (positive or negative).
    pub const ROUTE_ACK: u16 = 0x2b06;
    /// Out: keepalive ping.
    pub const PING: u16 = 0x2b23;
    /// In: keepalive acknowledgement.
    pub const PING_ACK: u16 = 0x2b24;
    /// Out: replay of all currently-connected session identities.
    pub const USERS: u16 = 0x2aff;
    /// In: another world server's areas came online.
    pub const MAP_ANNOUNCE: u16 = 0x2b04;
    /// In: another world server's areas went away.
    pub const MAP_RETRACT: u16 = 0x2b20;
    /// Out: a character is now offline.
    pub const CHAR_OFFLINE: u16 = 0x2b17;
    /// Out: a character is now online.
    pub const CHAR_ONLINE: u16 = 0x2b19;
}

/// (opcode, length) table for the backend registry; -1 means variable.
pub const PACKET_LENGTHS: &[(u16, i32)] = &[
    (op::CONNECT_REQ, 60),
    (op::CONNECT_ACK, 3),
    (op::AREA_LIST, -1),
    (op::AREA_LIST_ACK, 27),
    (op::AUTH_REQ, 23),
    (op::AUTH_ACK, 18),
    (op::AUTH_FAIL, 11),
    (op::SAVE_REQ, -1),
    (op::SAVE_ACK, 10),
    (op::ROUTE_REQ, 44),
    (op::ROUTE_ACK, 44),
    (op::PING, 2),
    (op::PING_ACK, 2),
    (op::USERS, -1),
    (op::MAP_ANNOUNCE, -1),
    (op::MAP_RETRACT, -1),
    (op::CHAR_OFFLINE, 10),
    (op::CHAR_ONLINE, 10),
];

/// A decoded frame from the backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMsg {
    ConnectAck {
        ok: bool,
    },
    AreaListAck {
        server_name: String,
    },
    AuthAck {
        account_id: u32,
        char_id: u32,
        token1: u32,
        token2: u32,
    },
    AuthFail {
        account_id: u32,
        char_id: u32,
        reason: u8,
    },
    SaveAck {
        account_id: u32,
        char_id: u32,
    },
    RouteAck {
        account_id: u32,
        char_id: u32,
        /// Zero means the backend refused the route.
        token1: u32,
        token2: u32,
        map: String,
        x: i16,
        y: i16,
        ip: u32,
        port: u16,
    },
    PingAck,
    MapAnnounce {
        ip: u32,
        port: u16,
        maps: Vec<u16>,
    },
    MapRetract {
        ip: u32,
        port: u16,
        maps: Vec<u16>,
    },
}

impl BackendMsg {
    /// Decode an inbound backend frame. Outbound-only opcodes decode to an
    /// error; the link treats any decode failure as a protocol violation
    /// and drops the connection.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let r = frame.reader();
        match frame.opcode() {
            op::CONNECT_ACK => Ok(Self::ConnectAck {
                ok: r.u8_at(2)? == 0,
            }),
            op::AREA_LIST_ACK => Ok(Self::AreaListAck {
                server_name: r.str_at(3, NAME_LEN)?,
            }),
            op::AUTH_ACK => Ok(Self::AuthAck {
                account_id: r.u32_at(2)?,
                char_id: r.u32_at(6)?,
                token1: r.u32_at(10)?,
                token2: r.u32_at(14)?,
            }),
            op::AUTH_FAIL => Ok(Self::AuthFail {
                account_id: r.u32_at(2)?,
                char_id: r.u32_at(6)?,
                reason: r.u8_at(10)?,
            }),
            op::SAVE_ACK => Ok(Self::SaveAck {
                account_id: r.u32_at(2)?,
                char_id: r.u32_at(6)?,
            }),
            op::ROUTE_ACK => Ok(Self::RouteAck {
                account_id: r.u32_at(2)?,
                char_id: r.u32_at(6)?,
                token1: r.u32_at(10)?,
                token2: r.u32_at(14)?,
                map: r.str_at(18, MAP_NAME_LEN)?,
                x: r.i16_at(34)?,
                y: r.i16_at(36)?,
                ip: r.net_u32_at(38)?,
                port: r.net_u16_at(42)?,
            }),
            op::PING_ACK => Ok(Self::PingAck),
            op::MAP_ANNOUNCE => {
                let (ip, port, maps) = decode_map_set(&r, frame.len())?;
                Ok(Self::MapAnnounce { ip, port, maps })
            }
            op::MAP_RETRACT => {
                let (ip, port, maps) = decode_map_set(&r, frame.len())?;
                Ok(Self::MapRetract { ip, port, maps })
            }
            other => Err(ProtocolError::UnknownOpcode {
                version: BACKEND_VERSION,
                opcode: other,
            }),
        }
    }
}

fn decode_map_set(r: &ByteReader<'_>, total: usize) -> Result<(u32, u16, Vec<u16>)> {
    let ip = r.net_u32_at(4)?;
    let port = r.net_u16_at(8)?;
    if total < 10 || (total - 10) % 2 != 0 {
        return Err(ProtocolError::MalformedFrame("odd map list payload"));
    }
    let mut maps = Vec::with_capacity((total - 10) / 2);
    let mut off = 10;
    while off < total {
        maps.push(r.u16_at(off)?);
        off += 2;
    }
    Ok((ip, port, maps))
}

/// Connect handshake: credentials plus this server's own public address.
#[must_use]
pub fn encode_connect_req(user: &str, password: &str, ip: u32, port: u16) -> Vec<u8> {
    let mut w = ByteWriter::with_len(60);
    w.put_u16(0, op::CONNECT_REQ);
    w.put_str(2, NAME_LEN, user);
    w.put_str(2 + NAME_LEN, NAME_LEN, password);
    w.put_net_u32(54, ip);
    w.put_net_u16(58, port);
    w.finish()
}

/// Our full area-of-responsibility list.
#[must_use]
pub fn encode_area_list(maps: &[u16]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(0, op::AREA_LIST);
    for (i, &m) in maps.iter().enumerate() {
        w.put_u16(4 + i * 2, m);
    }
    w.finish_variable()
}

/// Per-session authentication request.
#[must_use]
pub fn encode_auth_req(
    account_id: u32,
    char_id: u32,
    token1: u32,
    token2: u32,
    sex: u8,
    client_ip: u32,
) -> Vec<u8> {
    let mut w = ByteWriter::with_len(23);
    w.put_u16(0, op::AUTH_REQ);
    w.put_u32(2, account_id);
    w.put_u32(6, char_id);
    w.put_u32(10, token1);
    w.put_u32(14, token2);
    w.put_u8(18, sex);
    w.put_net_u32(19, client_ip);
    w.finish()
}

/// Final-save request. `last` marks the save that completes a logout
/// handoff; the backend acknowledges it with [`op::SAVE_ACK`].
#[must_use]
pub fn encode_save_req(account_id: u32, char_id: u32, last: bool, state: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(0, op::SAVE_REQ);
    w.put_u32(4, account_id);
    w.put_u32(8, char_id);
    w.put_u8(12, u8::from(last));
    w.put_bytes(13, state);
    w.finish_variable()
}

/// Map-change route request.
#[must_use]
pub fn encode_route_req(
    account_id: u32,
    char_id: u32,
    token1: u32,
    token2: u32,
    map: &str,
    x: i16,
    y: i16,
    ip: u32,
    port: u16,
) -> Vec<u8> {
    let mut w = ByteWriter::with_len(44);
    w.put_u16(0, op::ROUTE_REQ);
    w.put_u32(2, account_id);
    w.put_u32(6, char_id);
    w.put_u32(10, token1);
    w.put_u32(14, token2);
    w.put_str(18, MAP_NAME_LEN, map);
    w.put_i16(34, x);
    w.put_i16(36, y);
    w.put_net_u32(38, ip);
    w.put_net_u16(42, port);
    w.finish()
}

#[must_use]
pub fn encode_ping() -> Vec<u8> {
    let mut w = ByteWriter::with_len(2);
    w.put_u16(0, op::PING);
    w.finish()
}

/// Replay of every currently-connected session's identity.
#[must_use]
pub fn encode_users(sessions: &[(u32, u32)]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u16(0, op::USERS);
    w.put_u16(4, sessions.len() as u16);
    for (i, &(account_id, char_id)) in sessions.iter().enumerate() {
        w.put_u32(6 + i * 8, account_id);
        w.put_u32(10 + i * 8, char_id);
    }
    w.finish_variable()
}

#[must_use]
pub fn encode_char_offline(account_id: u32, char_id: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_len(10);
    w.put_u16(0, op::CHAR_OFFLINE);
    w.put_u32(2, char_id);
    w.put_u32(6, account_id);
    w.finish()
}

#[must_use]
pub fn encode_char_online(account_id: u32, char_id: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_len(10);
    w.put_u16(0, op::CHAR_ONLINE);
    w.put_u32(2, char_id);
    w.put_u32(6, account_id);
    w.finish()
}
