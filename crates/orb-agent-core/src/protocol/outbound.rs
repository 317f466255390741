//! Messages the agent publishes to core.
//!
//! Requests travel in the same envelope as inbound RPCs; capabilities and
//! heartbeats are bare JSON documents carrying their own schema version.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::protocol::envelope::{OutboundEnvelope, RPC_SCHEMA_VERSION};
use crate::protocol::rpc::func;

#[derive(Debug, Serialize)]
struct EmptyPayload {}

fn request(func: &str) -> Result<Bytes> {
    OutboundEnvelope::new(func, EmptyPayload {})
        .to_vec()
        .map(Bytes::from)
}

/// Ask core for the agent's current group membership.
pub fn group_membership_request() -> Result<Bytes> {
    request(func::GROUP_MEMBERSHIP_REQ)
}

/// Ask core for the agent's full policy set.
pub fn agent_policies_request() -> Result<Bytes> {
    request(func::AGENT_POLICIES_REQ)
}

fn encode<T: Serialize>(what: &str, value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| AgentError::Internal(format!("encode {what} failed: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub version: String,
}

/// Announced once per connection, before any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub schema_version: u32,
    pub orb_agent: AgentInfo,
    pub agent_tags: BTreeMap<String, String>,
    pub backends: BTreeMap<String, BackendInfo>,
}

impl Capabilities {
    pub fn new(
        agent_version: impl Into<String>,
        agent_tags: BTreeMap<String, String>,
        backends: BTreeMap<String, BackendInfo>,
    ) -> Self {
        Self {
            schema_version: RPC_SCHEMA_VERSION,
            orb_agent: AgentInfo {
                version: agent_version.into(),
            },
            agent_tags,
            backends,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        encode("capabilities", self)
    }
}

/// Liveness tag carried by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Online,
    Offline,
    Error,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Online => "online",
            AgentState::Offline => "offline",
            AgentState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRunState {
    Running,
    FailedToApply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStateInfo {
    pub name: String,
    pub backend: String,
    pub version: i32,
    pub state: PolicyRunState,
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStateInfo {
    pub name: String,
    pub channel_id: String,
}

/// Periodic or on-demand liveness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub policy_state: BTreeMap<String, PolicyStateInfo>,
    #[serde(default)]
    pub group_state: BTreeMap<String, GroupStateInfo>,
}

impl Heartbeat {
    pub fn new(timestamp: DateTime<Utc>, state: AgentState) -> Self {
        Self {
            schema_version: RPC_SCHEMA_VERSION,
            timestamp,
            state,
            message: None,
            policy_state: BTreeMap::new(),
            group_state: BTreeMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn encode(&self) -> Result<Bytes> {
        encode("heartbeat", self)
    }
}
