//! Inbound RPC dispatch.
//!
//! Re-exports the dispatcher and the handler trait so the session can
//! depend on this module directly.

pub mod dispatcher;

pub use dispatcher::{DispatchOutcome, Dispatcher, RpcHandler};
