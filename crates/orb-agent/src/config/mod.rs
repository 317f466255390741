//! Agent config loader (strict parsing).

pub mod schema;

use std::fs;

use orb_agent_core::error::{AgentError, Result};

pub use schema::{
    AgentConfig, AgentSection, BackendConfig, HeartbeatSection, OpsSection, PolicyClearScope,
    ReconcileSection, SubscriptionSection, TransportSection,
};

pub fn load_from_file(path: &str) -> Result<AgentConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("read config {path} failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<AgentConfig> {
    let cfg: AgentConfig =
        serde_yaml::from_str(s).map_err(|e| AgentError::Config(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
