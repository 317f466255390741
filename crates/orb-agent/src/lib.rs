//! orb-agent library entry.
//!
//! Wires the transport, RPC dispatcher, group reconciler, policy bridge,
//! heartbeat emitter and session lifecycle into one agent. Consumed by the
//! binary (`main.rs`) and by integration tests.

pub mod app_state;
pub mod config;
pub mod dispatch;
pub mod groups;
pub mod heartbeat;
pub mod lifecycle;
pub mod link;
pub mod obs;
pub mod ops;
pub mod policy;
pub mod router;
pub mod session;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
