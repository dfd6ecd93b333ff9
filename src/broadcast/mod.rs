//! # Broadcast Targeting
//!
//! Resolves a delivery scope to the exact set of recipient entities and
//! serializes a payload once per distinct protocol version among them.
//!
//! The world-position/group index is an external collaborator consumed
//! through [`WorldIndex`]; this module never inspects raw entity ids for
//! identity questions; disguise resolution always goes through the
//! collaborator, so a `SelfOnly` send reaches the source's own session even
//! when its visible id is negated for visual-effect reasons elsewhere.
//!
//! Recipients whose negotiated version has no descriptor for the payload's
//! opcode are silently skipped for that one message; an old client is never
//! disconnected because a newer opcode exists.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::warn;

use crate::codec::registry::{Descriptor, Registry};
use crate::error::Result;

/// Opaque id of a world entity that owns a session.
pub type EntityId = u32;
/// Id of one map (area of responsibility).
pub type MapId = u16;

/// World position of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub map: MapId,
    pub x: i16,
    pub y: i16,
}

/// Position/group index exposed by the world state, consumed read-only.
///
/// Group queries return entity ids of session-owning members; spy queries
/// return the sessions that opted into observing a group they are not in.
pub trait WorldIndex: Send + Sync {
    fn position(&self, entity: EntityId) -> Option<Position>;

    /// All session-owning entities inside the rectangle, bounds inclusive.
    fn entities_in_rect(&self, map: MapId, x0: i16, y0: i16, x1: i16, y1: i16) -> Vec<EntityId>;

    fn party_of(&self, entity: EntityId) -> Option<u32>;
    fn guild_of(&self, entity: EntityId) -> Option<u32>;
    fn team_of(&self, entity: EntityId) -> Option<u32>;
    fn chat_of(&self, entity: EntityId) -> Option<u32>;

    fn party_members(&self, party: u32) -> Vec<EntityId>;
    fn guild_members(&self, guild: u32) -> Vec<EntityId>;
    fn team_members(&self, team: u32) -> Vec<EntityId>;
    fn chat_members(&self, chat: u32) -> Vec<EntityId>;

    fn party_spies(&self, _party: u32) -> Vec<EntityId> {
        Vec::new()
    }
    fn guild_spies(&self, _guild: u32) -> Vec<EntityId> {
        Vec::new()
    }
    fn team_spies(&self, _team: u32) -> Vec<EntityId> {
        Vec::new()
    }

    /// Disguise-aware identity: the entity whose session should receive
    /// frames addressed to `entity`'s player.
    fn resolve_identity(&self, entity: EntityId) -> EntityId {
        entity
    }
}

/// Addressing mode for one outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryScope {
    /// The source entity's own session only.
    SelfOnly,
    /// Everyone in broadcast range of the source.
    Area,
    /// Area, minus the source itself.
    AreaWithoutSource,
    /// Shrunken area, minus everyone in the source's chat room.
    AreaWithoutGroup,
    Party,
    PartyWithoutSource,
    Guild,
    GuildWithoutSource,
    /// Everyone in the source's chat room, source included.
    ChatRoom,
    Team,
    TeamWithoutSource,
    /// Every authenticated session on the server.
    AllSessions,
}

/// Per-send switches. Spy fan-out is on unless the caller suppresses it.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastOptions {
    pub include_spies: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            include_spies: true,
        }
    }
}

/// Geometry knobs for area scopes.
#[derive(Debug, Clone, Copy)]
pub struct AreaParams {
    /// Half-width of the broadcast rectangle, in cells.
    pub radius: i16,
    /// How much the rectangle shrinks for chat-adjacent area sends.
    pub chat_shrink: i16,
}

/// A resolved recipient set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every authenticated session; only the session table can enumerate
    /// them, so the caller expands this one.
    AllSessions,
    Entities(Vec<EntityId>),
}

/// Compute the exact recipient set for `scope` originating at `source`.
///
/// "Excluding source/group" variants subtract after the index query, so the
/// query itself stays a plain rectangle or membership lookup.
pub fn resolve(
    scope: DeliveryScope,
    source: EntityId,
    index: &dyn WorldIndex,
    params: AreaParams,
    opts: BroadcastOptions,
) -> Recipients {
    use DeliveryScope::*;

    let around = |radius: i16| -> Vec<EntityId> {
        match index.position(source) {
            Some(p) => index.entities_in_rect(
                p.map,
                p.x - radius,
                p.y - radius,
                p.x + radius,
                p.y + radius,
            ),
            None => Vec::new(),
        }
    };

    let entities = match scope {
        SelfOnly => vec![index.resolve_identity(source)],
        Area => around(params.radius),
        AreaWithoutSource => {
            let mut set = around(params.radius);
            set.retain(|&e| e != source);
            set
        }
        AreaWithoutGroup => {
            let mut set = around(params.radius - params.chat_shrink);
            match index.chat_of(source) {
                Some(chat) => {
                    let members = index.chat_members(chat);
                    set.retain(|e| !members.contains(e) && *e != source);
                }
                None => set.retain(|&e| e != source),
            }
            set
        }
        Party | PartyWithoutSource => group_set(
            index.party_of(source),
            |g| index.party_members(g),
            |g| index.party_spies(g),
            scope == PartyWithoutSource,
            source,
            opts,
        ),
        Guild | GuildWithoutSource => group_set(
            index.guild_of(source),
            |g| index.guild_members(g),
            |g| index.guild_spies(g),
            scope == GuildWithoutSource,
            source,
            opts,
        ),
        Team | TeamWithoutSource => group_set(
            index.team_of(source),
            |g| index.team_members(g),
            |g| index.team_spies(g),
            scope == TeamWithoutSource,
            source,
            opts,
        ),
        ChatRoom => match index.chat_of(source) {
            Some(chat) => index.chat_members(chat),
            None => Vec::new(),
        },
        AllSessions => return Recipients::AllSessions,
    };
    Recipients::Entities(entities)
}

fn group_set(
    group: Option<u32>,
    members: impl Fn(u32) -> Vec<EntityId>,
    spies: impl Fn(u32) -> Vec<EntityId>,
    without_source: bool,
    source: EntityId,
    opts: BroadcastOptions,
) -> Vec<EntityId> {
    let Some(group) = group else {
        return Vec::new();
    };
    let mut set = members(group);
    if without_source {
        set.retain(|&e| e != source);
    }
    if opts.include_spies {
        for spy in spies(group) {
            if !set.contains(&spy) {
                set.push(spy);
            }
        }
    }
    set
}

/// A message that can lay itself out for any protocol version's descriptor.
pub trait Payload {
    fn opcode(&self) -> u16;

    /// Serialize against one version's descriptor. The frame must match the
    /// descriptor's length rule.
    fn encode_for(&self, descriptor: &Descriptor) -> Result<Vec<u8>>;
}

/// Pre-serialized bytes, identical across versions.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub opcode: u16,
    pub bytes: Vec<u8>,
}

impl RawPayload {
    #[must_use]
    pub fn new(opcode: u16, bytes: Vec<u8>) -> Self {
        Self { opcode, bytes }
    }
}

impl Payload for RawPayload {
    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn encode_for(&self, _descriptor: &Descriptor) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

/// Serialize-once-per-version cache for one broadcast.
///
/// `None` for a version means it has no descriptor for the opcode and its
/// sessions are skipped for this message.
pub struct VersionedEncoder<'a> {
    payload: &'a dyn Payload,
    cache: HashMap<u16, Option<Bytes>>,
}

impl<'a> VersionedEncoder<'a> {
    #[must_use]
    pub fn new(payload: &'a dyn Payload) -> Self {
        Self {
            payload,
            cache: HashMap::new(),
        }
    }

    pub fn encoded_for(&mut self, registry: &Registry, version: u16) -> Option<Bytes> {
        if let Some(cached) = self.cache.get(&version) {
            return cached.clone();
        }
        let encoded = match registry.lookup(version, self.payload.opcode()) {
            None => None,
            Some(descriptor) => match self.payload.encode_for(descriptor) {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    warn!(
                        opcode = format_args!("0x{:04x}", self.payload.opcode()),
                        version,
                        error = %e,
                        "payload failed to encode, recipient skipped"
                    );
                    None
                }
            },
        };
        self.cache.insert(version, encoded.clone());
        encoded
    }

    /// How many distinct versions were actually serialized.
    #[must_use]
    pub fn distinct_encodings(&self) -> usize {
        self.cache.values().filter(|v| v.is_some()).count()
    }
}
