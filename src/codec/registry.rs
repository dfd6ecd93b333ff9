//! # Packet Registry
//!
//! Per protocol-version descriptor tables mapping opcode to length rule,
//! field offsets, and handler name.
//!
//! The registry is built once at startup, either programmatically through
//! [`RegistryBuilder`] or from a descriptor table in text form, and is
//! immutable afterwards. It is shared read-only (behind an `Arc`) across
//! every connection, so lookups need no synchronization.
//!
//! Incremental client revisions rarely change more than a handful of
//! opcodes, so a version may be declared as "inherit from version N then
//! override": the parent's full table is copied and the listed descriptors
//! replace or extend it.
//!
//! The backend link speaks its own private opcode space; it gets its own
//! single-version registry from [`Registry::backend`] and flows through the
//! same framing code as the client protocol.

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::backend::wire;
use crate::error::{ProtocolError, Result};

/// Length rule for one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// The frame is exactly this many bytes, opcode included.
    Fixed(u16),
    /// The frame carries its total length as a u16 at byte offset 2.
    Variable,
}

/// Registry entry describing one opcode's layout for one protocol version.
///
/// Never mutated after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub opcode: u16,
    pub len: FrameLen,
    /// Handler name resolved through the dispatch handler map; `None` for
    /// server-to-client opcodes that are only ever encoded.
    pub handler: Option<String>,
    /// Byte offsets of the declared fields, in field order.
    pub fields: Vec<u16>,
}

/// One protocol version's complete opcode table.
#[derive(Debug, Clone, Default)]
pub struct VersionTable {
    version: u16,
    handshake: Option<u16>,
    by_opcode: HashMap<u16, Descriptor>,
}

impl VersionTable {
    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The initial handshake opcode for this version, used by version
    /// sniffing on unauthenticated connections.
    #[must_use]
    pub fn handshake_opcode(&self) -> Option<u16> {
        self.handshake
    }

    #[must_use]
    pub fn descriptor(&self, opcode: u16) -> Option<&Descriptor> {
        self.by_opcode.get(&opcode)
    }

    #[must_use]
    pub fn opcode_count(&self) -> usize {
        self.by_opcode.len()
    }
}

/// Immutable (version, opcode) → descriptor table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    versions: BTreeMap<u16, VersionTable>,
}

impl Registry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a descriptor. `None` means the pair is not registered; the
    /// caller must treat that as a protocol violation and disconnect, never
    /// skip it silently.
    #[must_use]
    pub fn lookup(&self, version: u16, opcode: u16) -> Option<&Descriptor> {
        self.versions.get(&version)?.descriptor(opcode)
    }

    #[must_use]
    pub fn table(&self, version: u16) -> Option<&VersionTable> {
        self.versions.get(&version)
    }

    /// All version tables, newest first. Version sniffing walks this order
    /// so ties resolve to the newest matching version.
    pub fn versions_newest_first(&self) -> impl Iterator<Item = &VersionTable> {
        self.versions.values().rev()
    }

    #[must_use]
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Parse a descriptor table from its text form:
    ///
    /// ```text
    /// version 20
    /// handshake 0x0072
    /// 0x0072,19,enter,2:6:10:14:18
    /// 0x007d,2,load_end
    /// 0x008c,-1,chat,4
    /// version 22 inherit 20
    /// 0x0072,22,enter,2:6:10:18:21
    /// ```
    ///
    /// Malformed lines are load-time errors, never skipped.
    pub fn parse(src: &str) -> Result<Self> {
        let mut b = Self::builder();
        let mut in_version = false;

        for (lineno, raw) in src.lines().enumerate() {
            let line = raw.split("//").next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let bad = |what: &str| {
                ProtocolError::ConfigError(format!(
                    "descriptor table line {}: {what}: {raw:?}",
                    lineno + 1
                ))
            };

            if let Some(rest) = line.strip_prefix("version ") {
                let mut parts = rest.split_whitespace();
                let ver = parse_u16(parts.next().unwrap_or(""))
                    .ok_or_else(|| bad("bad version number"))?;
                let parent = match (parts.next(), parts.next()) {
                    (None, _) => None,
                    (Some("inherit"), Some(p)) => {
                        Some(parse_u16(p).ok_or_else(|| bad("bad parent version"))?)
                    }
                    _ => return Err(bad("expected `version N [inherit M]`")),
                };
                b.begin_version(ver, parent)?;
                in_version = true;
            } else if let Some(rest) = line.strip_prefix("handshake ") {
                if !in_version {
                    return Err(bad("handshake before any version block"));
                }
                let op = parse_u16(rest.trim()).ok_or_else(|| bad("bad handshake opcode"))?;
                b.handshake(op);
            } else {
                if !in_version {
                    return Err(bad("descriptor before any version block"));
                }
                let mut parts = line.split(',');
                let op = parse_u16(parts.next().unwrap_or(""))
                    .ok_or_else(|| bad("bad opcode"))?;
                let len: i32 = parts
                    .next()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| bad("bad length"))?;
                let handler = parts.next().map(|s| s.trim().to_owned());
                let fields = match parts.next() {
                    None => Vec::new(),
                    Some(list) => list
                        .split(':')
                        .map(|s| {
                            s.trim()
                                .parse::<u16>()
                                .map_err(|_| bad("bad field offset"))
                        })
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                };
                let len = match len {
                    -1 => FrameLen::Variable,
                    n if (2..=i32::from(u16::MAX)).contains(&n) => FrameLen::Fixed(n as u16),
                    _ => return Err(bad("length must be -1 or 2..=65535")),
                };
                b.descriptor(Descriptor {
                    opcode: op,
                    len,
                    handler: handler.filter(|h| !h.is_empty()),
                    fields,
                });
            }
        }
        b.build()
    }

    /// Built-in client table: three protocol versions exercising the
    /// inherit-then-override path. Real deployments load their own table;
    /// this one matches the layouts the built-in handlers expect.
    #[must_use]
    pub fn builtin_client() -> Self {
        let mut b = Self::builder();

        b.begin_version_root(20);
        b.handshake(opcodes::ENTER);
        b.descriptor(Descriptor {
            opcode: opcodes::ENTER,
            len: FrameLen::Fixed(19),
            handler: Some("enter".into()),
            // account id, char id, login token 1, client tick, sex
            fields: vec![2, 6, 10, 14, 18],
        });
        b.fixed(opcodes::LOAD_END_ACK, 2, Some("load_end"), &[]);
        b.fixed(opcodes::CLIENT_TICK, 6, Some("client_tick"), &[2]);
        b.fixed(opcodes::SERVER_TICK, 6, None, &[2]);
        b.fixed(opcodes::AUTH_OK, 11, None, &[2, 6, 9, 10]);
        b.fixed(opcodes::REJECT, 6, None, &[2]);
        b.fixed(opcodes::ACTION, 7, None, &[2, 6]);
        b.variable(opcodes::CHAT, Some("chat"), &[4]);
        b.fixed(opcodes::QUIT, 4, Some("quit"), &[2]);
        b.fixed(opcodes::QUIT_ACK, 4, None, &[2]);
        b.fixed(opcodes::ROUTE_TO_SERVER, 28, None, &[2, 18, 20, 22, 26]);
        b.fixed(opcodes::ADMIN_VERSION, 2, Some("server_version"), &[]);
        b.fixed(opcodes::ADMIN_VERSION_ACK, 10, None, &[2, 3]);
        b.fixed(opcodes::ADMIN_CLOSE, 2, Some("force_close"), &[]);

        // Revision 22 widened the handshake with a client-build stamp and
        // moved the trailing fields.
        b.begin_version_inherit(22, 20);
        b.descriptor(Descriptor {
            opcode: opcodes::ENTER,
            len: FrameLen::Fixed(22),
            handler: Some("enter".into()),
            fields: vec![2, 6, 10, 17, 21],
        });

        // Revision 25 moved the handshake to a fresh opcode and dropped the
        // legacy one entirely.
        b.begin_version_inherit(25, 22);
        b.handshake(opcodes::ENTER_V25);
        b.remove(opcodes::ENTER);
        b.descriptor(Descriptor {
            opcode: opcodes::ENTER_V25,
            len: FrameLen::Fixed(19),
            handler: Some("enter".into()),
            fields: vec![2, 6, 10, 14, 18],
        });

        match b.build() {
            Ok(r) => r,
            // The table above is a constant; a build failure is a bug in it.
            Err(e) => unreachable!("builtin client table invalid: {e}"),
        }
    }

    /// The backend link's private protocol: one version, fixed layouts.
    #[must_use]
    pub fn backend() -> Self {
        let mut b = Self::builder();
        b.begin_version_root(wire::BACKEND_VERSION);
        for &(op, len) in wire::PACKET_LENGTHS {
            match len {
                -1 => b.variable(op, None, &[]),
                n => b.fixed(op, n as u16, None, &[]),
            };
        }
        match b.build() {
            Ok(r) => r,
            Err(e) => unreachable!("backend table invalid: {e}"),
        }
    }
}

fn parse_u16(s: &str) -> Option<u16> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Client opcodes understood by the built-in table.
pub mod opcodes {
    /// Handshake, versions 20 and 22.
    pub const ENTER: u16 = 0x0072;
    /// Handshake, version 25 onward.
    pub const ENTER_V25: u16 = 0x0436;
    /// Client finished loading the map.
    pub const LOAD_END_ACK: u16 = 0x007d;
    /// Client keepalive tick.
    pub const CLIENT_TICK: u16 = 0x007e;
    /// Server tick reply.
    pub const SERVER_TICK: u16 = 0x007f;
    /// Authentication accepted; carries spawn position.
    pub const AUTH_OK: u16 = 0x0073;
    /// Single rejection frame sent before a forced close.
    pub const REJECT: u16 = 0x0081;
    /// Entity action notice (broadcast payload).
    pub const ACTION: u16 = 0x0089;
    /// Chat message (variable length).
    pub const CHAT: u16 = 0x008c;
    /// Graceful quit request.
    pub const QUIT: u16 = 0x018a;
    /// Quit acknowledged.
    pub const QUIT_ACK: u16 = 0x018b;
    /// Redirect the client to another world server (map change).
    pub const ROUTE_TO_SERVER: u16 = 0x0092;
    /// Admin: report server version.
    pub const ADMIN_VERSION: u16 = 0x7530;
    /// Admin: server version report.
    pub const ADMIN_VERSION_ACK: u16 = 0x7531;
    /// Admin: force-close this connection.
    pub const ADMIN_CLOSE: u16 = 0x7532;
}

/// Builds a [`Registry`], resolving version inheritance as blocks open.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    versions: BTreeMap<u16, VersionTable>,
    current: Option<u16>,
}

impl RegistryBuilder {
    /// Open a version block with no parent.
    pub fn begin_version_root(&mut self, version: u16) -> &mut Self {
        self.versions.insert(
            version,
            VersionTable {
                version,
                ..VersionTable::default()
            },
        );
        self.current = Some(version);
        self
    }

    /// Open a version block inheriting `parent`'s full table.
    ///
    /// The parent must already be declared; descriptors added afterwards
    /// override the inherited ones.
    pub fn begin_version_inherit(&mut self, version: u16, parent: u16) -> &mut Self {
        if let Some(p) = self.versions.get(&parent) {
            let mut table = p.clone();
            table.version = version;
            self.versions.insert(version, table);
            self.current = Some(version);
        } else {
            // Recorded and reported at build().
            self.versions.insert(
                version,
                VersionTable {
                    version,
                    handshake: None,
                    by_opcode: HashMap::new(),
                },
            );
            self.current = None;
        }
        self
    }

    fn begin_version(&mut self, version: u16, parent: Option<u16>) -> Result<()> {
        match parent {
            None => {
                self.begin_version_root(version);
                Ok(())
            }
            Some(p) => {
                if !self.versions.contains_key(&p) {
                    return Err(ProtocolError::ConfigError(format!(
                        "version {version} inherits unknown version {p}"
                    )));
                }
                self.begin_version_inherit(version, p);
                Ok(())
            }
        }
    }

    /// Declare the current version's handshake opcode.
    pub fn handshake(&mut self, opcode: u16) -> &mut Self {
        if let Some(t) = self.current_table() {
            t.handshake = Some(opcode);
        }
        self
    }

    /// Add or override a descriptor in the current version.
    pub fn descriptor(&mut self, d: Descriptor) -> &mut Self {
        if let Some(t) = self.current_table() {
            t.by_opcode.insert(d.opcode, d);
        }
        self
    }

    /// Remove an inherited opcode from the current version.
    pub fn remove(&mut self, opcode: u16) -> &mut Self {
        if let Some(t) = self.current_table() {
            t.by_opcode.remove(&opcode);
        }
        self
    }

    /// Shorthand for a fixed-length descriptor.
    pub fn fixed(
        &mut self,
        opcode: u16,
        len: u16,
        handler: Option<&str>,
        fields: &[u16],
    ) -> &mut Self {
        self.descriptor(Descriptor {
            opcode,
            len: FrameLen::Fixed(len),
            handler: handler.map(str::to_owned),
            fields: fields.to_vec(),
        })
    }

    /// Shorthand for a variable-length descriptor.
    pub fn variable(&mut self, opcode: u16, handler: Option<&str>, fields: &[u16]) -> &mut Self {
        self.descriptor(Descriptor {
            opcode,
            len: FrameLen::Variable,
            handler: handler.map(str::to_owned),
            fields: fields.to_vec(),
        })
    }

    fn current_table(&mut self) -> Option<&mut VersionTable> {
        let v = self.current?;
        self.versions.get_mut(&v)
    }

    pub fn build(self) -> Result<Registry> {
        for table in self.versions.values() {
            if let Some(hs) = table.handshake {
                if !table.by_opcode.contains_key(&hs) {
                    return Err(ProtocolError::ConfigError(format!(
                        "version {}: handshake opcode 0x{hs:04x} has no descriptor",
                        table.version
                    )));
                }
            }
        }
        Ok(Registry {
            versions: self.versions,
        })
    }
}
