//! Policy application.
//!
//! - `manager`: the [`PolicyManager`] and [`Backend`] seams.
//! - `local`: in-process implementations used by the binary and tests.
//! - `bridge`: turns policy RPCs into manager calls and reports state to core.

pub mod bridge;
pub mod local;
pub mod manager;

pub use bridge::{BatchReport, PolicyBridge, PolicyFailure};
pub use local::{LocalBackend, LocalPolicyManager};
pub use manager::{Backend, PolicyManager};
