//! # Packet Handlers
//!
//! Opcode handlers keyed by the name carried in each descriptor, with
//! zero-copy routing for the built-in set.
//!
//! Descriptors name their handler; the dispatch loop resolves the name
//! through this map and invokes the boxed trait object. Handlers registered
//! as *pre-auth* may run before backend authentication completes (the
//! handshake itself and the two admin short-frames); everything else is
//! gated on an authenticated session.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::codec::framing::Frame;
use crate::codec::registry::Descriptor;
use crate::dispatch::engine::Engine;
use crate::dispatch::session::Session;
use crate::error::Result;

/// One opcode handler. The session is detached from the engine's table for
/// the duration of the call, so handlers may freely use the engine's
/// delivery and handoff surface against every *other* session.
pub trait PacketHandler: Send + Sync {
    fn handle(
        &self,
        engine: &mut Engine,
        session: &mut Session,
        frame: &Frame,
        descriptor: &Descriptor,
    ) -> Result<()>;
}

impl<F> PacketHandler for F
where
    F: Fn(&mut Engine, &mut Session, &Frame, &Descriptor) -> Result<()> + Send + Sync,
{
    fn handle(
        &self,
        engine: &mut Engine,
        session: &mut Session,
        frame: &Frame,
        descriptor: &Descriptor,
    ) -> Result<()> {
        self(engine, session, frame, descriptor)
    }
}

struct Entry {
    handler: Box<dyn PacketHandler>,
    pre_auth: bool,
}

/// Handler map with zero-copy opcode-name routing for statics.
/// Uses Cow<'static, str> to avoid heap allocations for known names.
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<Cow<'static, str>, Entry>,
}

impl HandlerMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, name: impl Into<Cow<'static, str>>, handler: H) -> &mut Self
    where
        H: PacketHandler + 'static,
    {
        self.handlers.insert(
            name.into(),
            Entry {
                handler: Box::new(handler),
                pre_auth: false,
            },
        );
        self
    }

    /// Register a handler exempt from the authentication gate.
    pub fn register_pre_auth<H>(&mut self, name: impl Into<Cow<'static, str>>, handler: H) -> &mut Self
    where
        H: PacketHandler + 'static,
    {
        self.handlers.insert(
            name.into(),
            Entry {
                handler: Box::new(handler),
                pre_auth: true,
            },
        );
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    #[must_use]
    pub fn is_pre_auth(&self, name: &str) -> bool {
        self.handlers.get(name).is_some_and(|e| e.pre_auth)
    }

    pub fn dispatch(
        &self,
        name: &str,
        engine: &mut Engine,
        session: &mut Session,
        frame: &Frame,
        descriptor: &Descriptor,
    ) -> Option<Result<()>> {
        self.handlers
            .get(name)
            .map(|e| e.handler.handle(engine, session, frame, descriptor))
    }
}
