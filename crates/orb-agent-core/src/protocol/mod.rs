//! Control-plane protocol modules.
//!
//! - `envelope`: the versioned RPC envelope, decoded once with a lazy payload.
//! - `rpc`: typed payloads, the closed `Rpc` union and the per-scope dispatch tables.
//! - `topics`: canonical topic names for a channel.
//! - `outbound`: messages the agent publishes to core.
//!
//! All parsers are panic-free: malformed input is reported as `AgentError`.

pub mod envelope;
pub mod outbound;
pub mod rpc;
pub mod topics;

pub use envelope::{decode_envelope, RpcEnvelope, RPC_SCHEMA_VERSION};
pub use rpc::{DispatchTable, Routed, Rpc, RpcScope};
pub use topics::{topics, Topics};
