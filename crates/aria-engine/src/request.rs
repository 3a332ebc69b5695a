//! Reference-counted request envelopes and argument decoding
//!
//! Packets are decoded with `rosc` at the submission boundary, on the
//! producer thread, where allocation is allowed. The audio thread only
//! borrows the decoded tree through a shared reference; it must never drop
//! the last reference itself — releases are routed to the worker (see
//! `Environment::release_request`).

use std::sync::Arc;

use aria_core::{EngineError, EngineResult};
use rosc::{OscPacket, OscType};

/// An immutable, shared OSC request
///
/// Cloning retains; the clone is as cheap as an `Arc` bump and never
/// allocates, so it is safe on the audio thread.
#[derive(Clone)]
pub struct Request {
    packet: Arc<OscPacket>,
}

impl Request {
    /// Decode a wire packet; fails with `MalformedPacket` on bad bytes
    pub fn parse(bytes: &[u8]) -> EngineResult<Self> {
        let (_, packet) =
            rosc::decoder::decode_udp(bytes).map_err(|_| EngineError::MalformedPacket)?;
        Ok(Self::from_packet(packet))
    }

    /// Wrap an already-decoded packet
    pub fn from_packet(packet: OscPacket) -> Self {
        Self {
            packet: Arc::new(packet),
        }
    }

    pub fn packet(&self) -> &OscPacket {
        &self.packet
    }
}

/// Cursor over a message's argument list
pub(crate) struct Args<'a> {
    items: &'a [OscType],
    pos: usize,
}

static EMPTY_ARGS: &[OscType] = &[];

impl<'a> Args<'a> {
    pub fn new(items: &'a [OscType]) -> Self {
        Self { items, pos: 0 }
    }

    fn next(&mut self) -> EngineResult<&'a OscType> {
        let item = self.items.get(self.pos).ok_or(EngineError::MalformedPacket)?;
        self.pos += 1;
        Ok(item)
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.items.len()
    }

    pub fn int32(&mut self) -> EngineResult<i32> {
        match self.next()? {
            OscType::Int(v) => Ok(*v),
            _ => Err(EngineError::MalformedPacket),
        }
    }

    pub fn float32(&mut self) -> EngineResult<f32> {
        match self.next()? {
            OscType::Float(v) => Ok(*v),
            _ => Err(EngineError::MalformedPacket),
        }
    }

    pub fn string(&mut self) -> EngineResult<&'a str> {
        match self.next()? {
            OscType::String(s) => Ok(s),
            _ => Err(EngineError::MalformedPacket),
        }
    }

    /// An array argument; missing trailing arrays decode as empty
    pub fn array(&mut self) -> EngineResult<&'a [OscType]> {
        if self.at_end() {
            return Ok(EMPTY_ARGS);
        }
        match self.next()? {
            OscType::Array(a) => Ok(&a.content),
            _ => Err(EngineError::MalformedPacket),
        }
    }
}
