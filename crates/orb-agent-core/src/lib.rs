//! orb agent core: transport-agnostic control-plane protocol primitives.
//!
//! This crate defines the wire-level contracts between an agent and core:
//! the versioned RPC envelope, the scoped dispatch tables that turn a func tag
//! into a typed [`protocol::rpc::Rpc`], the topic namer and the outbound
//! messages (capabilities, requests, heartbeats). It carries no runtime
//! dependencies so it can be reused by the agent, by tooling and by tests.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here.
//! Every decode path reports an [`AgentError`] instead, so a hostile or buggy
//! control plane can never take the agent down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{AgentError, ErrorCode, Result};
