//! Wire envelopes for remote operations
//!
//! Every remote operation travels as a fixed little-endian header followed
//! by a payload body. Payload kinds are identified by a stable 16-bit tag;
//! receivers decode through a [`PayloadRegistry`] so that new kinds can be
//! added without touching the framing. An unknown tag rejects the message.
//!
//! # Frame layout
//!
//! ```text
//! [origin_node: u16][tag: u16][unique_id: u64][generation: u32][payload_len: u32]
//! [payload: payload_len bytes]
//! ```

use crate::error::{Result, RuntimeError};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;

/// Size of the fixed envelope header in bytes
pub const HEADER_BYTES: usize = 2 + 2 + 8 + 4 + 4;

/// Decoded envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub origin_node: u16,
    pub tag: u16,
    pub unique_id: u64,
    pub generation: u32,
    pub payload_len: u32,
}

impl WireHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.origin_node.to_le_bytes());
        out.extend_from_slice(&self.tag.to_le_bytes());
        out.extend_from_slice(&self.unique_id.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_BYTES {
            return Err(RuntimeError::WireFormat(format!(
                "truncated header: {} bytes",
                buf.len()
            )));
        }
        let u16_at = |o: usize| u16::from_le_bytes(buf[o..o + 2].try_into().unwrap());
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        Ok(WireHeader {
            origin_node: u16_at(0),
            tag: u16_at(2),
            unique_id: u64_at(4),
            generation: u32_at(12),
            payload_len: u32_at(16),
        })
    }
}

/// A payload that can travel inside a wire envelope
pub trait RemotePayload: std::fmt::Debug + Send {
    /// Stable 16-bit kind tag
    fn tag(&self) -> u16;

    /// Serialize the payload body
    fn encode_body(&self) -> Result<Vec<u8>>;

    /// Downcast support for receivers
    fn as_any(&self) -> &dyn Any;
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn RemotePayload>> + Send + Sync>;

/// Registry mapping payload tags to decoders
///
/// Receivers hold one registry per process; unknown tags reject the message
/// with [`RuntimeError::UnknownPayloadTag`] and a warning.
#[derive(Default)]
pub struct PayloadRegistry {
    decoders: HashMap<u16, DecodeFn>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in payload kinds
    pub fn with_builtin_payloads() -> Self {
        let mut reg = Self::new();
        reg.register::<RemoteCopyArgs>(RemoteCopyArgs::TAG);
        reg.register::<RemoteFillArgs>(RemoteFillArgs::TAG);
        reg
    }

    /// Register a serde-decodable payload kind under `tag`
    ///
    /// Re-registering a tag replaces the previous decoder.
    pub fn register<P>(&mut self, tag: u16)
    where
        P: RemotePayload + serde::de::DeserializeOwned + 'static,
    {
        self.decoders.insert(
            tag,
            Box::new(move |body| {
                serde_json::from_slice::<P>(body)
                    .map(|p| Box::new(p) as Box<dyn RemotePayload>)
                    .map_err(|e| RuntimeError::WireFormat(e.to_string()))
            }),
        );
    }

    /// Frame a payload into a complete message
    pub fn encode(
        &self,
        origin_node: u16,
        unique_id: u64,
        generation: u32,
        payload: &dyn RemotePayload,
    ) -> Result<Vec<u8>> {
        let body = payload.encode_body()?;
        let header = WireHeader {
            origin_node,
            tag: payload.tag(),
            unique_id,
            generation,
            payload_len: body.len() as u32,
        };
        let mut out = Vec::with_capacity(HEADER_BYTES + body.len());
        header.encode_into(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse a complete message
    pub fn decode(&self, buf: &[u8]) -> Result<(WireHeader, Box<dyn RemotePayload>)> {
        let header = WireHeader::decode(buf)?;
        let body = &buf[HEADER_BYTES..];
        if body.len() != header.payload_len as usize {
            return Err(RuntimeError::WireFormat(format!(
                "payload length mismatch: header says {}, got {}",
                header.payload_len,
                body.len()
            )));
        }
        let decoder = self.decoders.get(&header.tag).ok_or_else(|| {
            tracing::warn!(
                tag = header.tag,
                origin = header.origin_node,
                unique_id = header.unique_id,
                "rejecting message with unknown payload tag"
            );
            RuntimeError::UnknownPayloadTag(header.tag)
        })?;
        let payload = decoder(body)?;
        Ok((header, payload))
    }
}

/// Arguments for a copy forwarded to another node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCopyArgs {
    pub before: Event,
    pub after: Event,
    pub priority: i32,
    pub redop: u32,
    pub fold: bool,
}

impl RemoteCopyArgs {
    pub const TAG: u16 = 0x0101;
}

impl RemotePayload for RemoteCopyArgs {
    fn tag(&self) -> u16 {
        Self::TAG
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RuntimeError::WireFormat(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Arguments for a fill forwarded to the node owning the target instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFillArgs {
    pub offset: u64,
    pub size: u64,
    pub before: Event,
    pub after: Event,
}

impl RemoteFillArgs {
    pub const TAG: u16 = 0x0102;
}

impl RemotePayload for RemoteFillArgs {
    fn tag(&self) -> u16 {
        Self::TAG
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RuntimeError::WireFormat(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ================================================================================================
// Tests
// ================================================================================================
