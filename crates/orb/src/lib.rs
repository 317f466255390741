//! Top-level facade crate for the orb agent.
//!
//! Re-exports the protocol core and the agent runtime so users can depend on a single crate.

pub mod core {
    pub use orb_agent_core::*;
}

pub mod agent {
    pub use orb_agent::*;
}
