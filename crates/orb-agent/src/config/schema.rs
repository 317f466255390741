use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use orb_agent_core::error::{AgentError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub version: u32,

    pub agent: AgentSection,

    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub subscriptions: SubscriptionSection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    #[serde(default)]
    pub reconcile: ReconcileSection,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub ops: OpsSection,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(AgentError::Config(format!(
                "unsupported config version {}",
                self.version
            )));
        }

        self.agent.validate()?;
        self.transport.validate()?;
        self.subscriptions.validate()?;
        self.heartbeat.validate()?;

        let mut seen = std::collections::HashSet::new();
        for b in &self.backends {
            if b.name.is_empty() {
                return Err(AgentError::Config("backends[].name must not be empty".into()));
            }
            if !seen.insert(b.name.as_str()) {
                return Err(AgentError::Config(format!("duplicate backend: {}", b.name)));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    pub id: String,

    pub channel_id: String,

    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl AgentSection {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AgentError::Config("agent.id must not be empty".into()));
        }
        if self.channel_id.is_empty() || self.channel_id.contains('/') {
            return Err(AgentError::Config(
                "agent.channel_id must be non-empty and contain no '/'".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSection {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            keepalive_ms: default_keepalive_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl TransportSection {
    pub fn validate(&self) -> Result<()> {
        // built without TLS; terminate wss in front of the bridge
        if !self.url.starts_with("ws://") {
            return Err(AgentError::Config("transport.url must be a ws:// url".into()));
        }
        if !(1000..=120000).contains(&self.keepalive_ms) {
            return Err(AgentError::Config(
                "transport.keepalive_ms must be between 1000 and 120000".into(),
            ));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(AgentError::Config(
                "transport.reconnect_max_ms must be >= reconnect_base_ms > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionSection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Cap on concurrently running subscription workers. `0` means unbounded.
    #[serde(default)]
    pub max_concurrent: usize,
}

impl Default for SubscriptionSection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_concurrent: 0,
        }
    }
}

impl SubscriptionSection {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.attempts) {
            return Err(AgentError::Config(
                "subscriptions.attempts must be between 1 and 10".into(),
            ));
        }
        if !(100..=60000).contains(&self.ack_timeout_ms) {
            return Err(AgentError::Config(
                "subscriptions.ack_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl HeartbeatSection {
    pub fn validate(&self) -> Result<()> {
        if !(1000..=600000).contains(&self.interval_ms) {
            return Err(AgentError::Config(
                "heartbeat.interval_ms must be between 1000 and 600000".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Which backend policies are dropped when group membership shrinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClearScope {
    /// Remove the policies of every backend, then re-request the full set.
    #[default]
    AllBackends,
    /// Keep applied policies; core's next policy batch reconciles them.
    Retain,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileSection {
    #[serde(default)]
    pub policy_clear_scope: PolicyClearScope,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub name: String,

    #[serde(default = "default_backend_version")]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpsSection {
    /// Operational HTTP endpoint; disabled when absent.
    #[serde(default)]
    pub listen: Option<String>,
}

fn default_url() -> String {
    "ws://127.0.0.1:8883/bridge".into()
}
fn default_keepalive_ms() -> u64 {
    10000
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    30000
}
fn default_attempts() -> u32 {
    3
}
fn default_ack_timeout_ms() -> u64 {
    5000
}
fn default_heartbeat_interval_ms() -> u64 {
    50000
}
fn default_backend_version() -> String {
    "unknown".into()
}
