//! RPC envelope (JSON).
//!
//! The envelope is decoded once and validated independently of any specific
//! function. `payload` stays a `RawValue` so only the dispatch table entry
//! selected by `func` parses it into a typed shape.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{AgentError, Result};

/// The single schema version spoken by this agent. There is no negotiation.
pub const RPC_SCHEMA_VERSION: u32 = 1;

/// Envelope as it appears on the wire, before validation.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    schema_version: u32,
    #[serde(default)]
    func: Option<String>,
    /// JSON `null` deserializes to `None`, so a nil payload counts as absent.
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

/// A validated envelope: correct version, non-empty func, payload present.
#[derive(Debug)]
pub struct RpcEnvelope {
    pub schema_version: u32,
    pub func: String,
    pub payload: Box<RawValue>,
}

/// Decode and validate an envelope.
///
/// Rejects, in this order: unparsable JSON, a schema version other than
/// [`RPC_SCHEMA_VERSION`], a missing or empty `func`, a missing or null `payload`.
pub fn decode_envelope(bytes: &[u8]) -> Result<RpcEnvelope> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| AgentError::Malformed(format!("invalid envelope json: {e}")))?;

    if wire.schema_version != RPC_SCHEMA_VERSION {
        return Err(AgentError::UnsupportedVersion {
            found: wire.schema_version,
            expected: RPC_SCHEMA_VERSION,
        });
    }

    let func = match wire.func {
        Some(f) if !f.is_empty() => f,
        _ => return Err(AgentError::Malformed("envelope missing func".into())),
    };
    let payload = wire
        .payload
        .ok_or_else(|| AgentError::Malformed(format!("envelope for {func} missing payload")))?;

    Ok(RpcEnvelope {
        schema_version: wire.schema_version,
        func,
        payload,
    })
}

/// Outbound envelope, generic over the payload type.
#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a, T: Serialize> {
    pub schema_version: u32,
    pub func: &'a str,
    pub payload: T,
}

impl<'a, T: Serialize> OutboundEnvelope<'a, T> {
    pub fn new(func: &'a str, payload: T) -> Self {
        Self {
            schema_version: RPC_SCHEMA_VERSION,
            func,
            payload,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| AgentError::Internal(format!("encode {} failed: {e}", self.func)))
    }
}
