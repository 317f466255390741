//! Typed RPC payloads and the scoped dispatch tables.
//!
//! A message is routed by the scope of the topic it arrived on. Each scope
//! owns a table from func tag to a typed decoder, and every decoder produces
//! the same closed [`Rpc`] union, so handlers never see an untyped payload.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{AgentError, Result};
use crate::protocol::envelope::{decode_envelope, RpcEnvelope};

/// Func tags understood on the wire.
pub mod func {
    pub const GROUP_MEMBERSHIP: &str = "group-membership";
    pub const AGENT_POLICIES: &str = "agent-policies";
    pub const AGENT_STOP: &str = "agent-stop";
    pub const AGENT_RESET: &str = "agent-reset";
    pub const GROUP_REMOVED: &str = "group-removed";
    pub const DATASET_REMOVED: &str = "dataset-removed";

    /// Agent -> core requests.
    pub const GROUP_MEMBERSHIP_REQ: &str = "group-membership-req";
    pub const AGENT_POLICIES_REQ: &str = "agent-policies-req";
}

/// One group the agent belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group_id: String,
    pub name: String,
    pub channel_id: String,
}

/// Full or incremental membership update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub full_list: bool,
    #[serde(default)]
    pub groups: Vec<GroupDescriptor>,
}

/// What to do with a policy carried in an `agent-policies` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    #[default]
    Manage,
    Remove,
}

/// A named collection configuration for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub id: String,
    #[serde(alias = "agent_policy_name")]
    pub name: String,
    pub backend: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub datasets: Vec<String>,
    #[serde(default)]
    pub action: PolicyAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStop {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReset {
    #[serde(default)]
    pub full_reset: bool,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRemoved {
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRemoved {
    pub dataset_id: String,
    pub policy_id: String,
}

/// Closed set of RPCs core can send to an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Rpc {
    GroupMembership(GroupMembership),
    AgentPolicies(Vec<AgentPolicy>),
    AgentStop(AgentStop),
    AgentReset(AgentReset),
    GroupRemoved(GroupRemoved),
    DatasetRemoved(DatasetRemoved),
}

impl Rpc {
    /// Wire func tag of this RPC.
    pub fn func(&self) -> &'static str {
        match self {
            Rpc::GroupMembership(_) => func::GROUP_MEMBERSHIP,
            Rpc::AgentPolicies(_) => func::AGENT_POLICIES,
            Rpc::AgentStop(_) => func::AGENT_STOP,
            Rpc::AgentReset(_) => func::AGENT_RESET,
            Rpc::GroupRemoved(_) => func::GROUP_REMOVED,
            Rpc::DatasetRemoved(_) => func::DATASET_REMOVED,
        }
    }
}

/// Which kind of topic a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcScope {
    /// The agent's own `rpc_from_core` topic.
    Core,
    /// A group's `rpc_from_core` topic.
    Group,
}

impl RpcScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcScope::Core => "core",
            RpcScope::Group => "group",
        }
    }
}

/// Result of routing a valid envelope.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Func is known in this scope and its payload decoded.
    Rpc(Rpc),
    /// Func not handled in this scope. Not an error: core may be newer than us.
    Unknown { func: String, payload: String },
}

type DecodeFn = fn(&RawValue) -> Result<Rpc>;

fn typed<T: DeserializeOwned>(func: &str, raw: &RawValue) -> Result<T> {
    serde_json::from_str(raw.get())
        .map_err(|e| AgentError::Malformed(format!("{func} payload: {e}")))
}

fn group_membership(raw: &RawValue) -> Result<Rpc> {
    typed(func::GROUP_MEMBERSHIP, raw).map(Rpc::GroupMembership)
}

fn agent_policies(raw: &RawValue) -> Result<Rpc> {
    typed(func::AGENT_POLICIES, raw).map(Rpc::AgentPolicies)
}

fn agent_stop(raw: &RawValue) -> Result<Rpc> {
    typed(func::AGENT_STOP, raw).map(Rpc::AgentStop)
}

fn agent_reset(raw: &RawValue) -> Result<Rpc> {
    typed(func::AGENT_RESET, raw).map(Rpc::AgentReset)
}

fn group_removed(raw: &RawValue) -> Result<Rpc> {
    typed(func::GROUP_REMOVED, raw).map(Rpc::GroupRemoved)
}

fn dataset_removed(raw: &RawValue) -> Result<Rpc> {
    typed(func::DATASET_REMOVED, raw).map(Rpc::DatasetRemoved)
}

/// Func tag -> typed decoder, for one scope.
pub struct DispatchTable {
    scope: RpcScope,
    entries: HashMap<&'static str, DecodeFn>,
}

impl DispatchTable {
    /// Table for the agent's own channel.
    pub fn core() -> Self {
        let mut entries: HashMap<&'static str, DecodeFn> = HashMap::new();
        entries.insert(func::GROUP_MEMBERSHIP, group_membership);
        entries.insert(func::AGENT_POLICIES, agent_policies);
        entries.insert(func::AGENT_STOP, agent_stop);
        entries.insert(func::AGENT_RESET, agent_reset);
        Self {
            scope: RpcScope::Core,
            entries,
        }
    }

    /// Table for group channels.
    pub fn group() -> Self {
        let mut entries: HashMap<&'static str, DecodeFn> = HashMap::new();
        entries.insert(func::AGENT_POLICIES, agent_policies);
        entries.insert(func::GROUP_REMOVED, group_removed);
        entries.insert(func::DATASET_REMOVED, dataset_removed);
        Self {
            scope: RpcScope::Group,
            entries,
        }
    }

    pub fn for_scope(scope: RpcScope) -> Self {
        match scope {
            RpcScope::Core => Self::core(),
            RpcScope::Group => Self::group(),
        }
    }

    pub fn scope(&self) -> RpcScope {
        self.scope
    }

    /// Registered func tags, sorted.
    pub fn funcs(&self) -> Vec<&'static str> {
        let mut funcs: Vec<&'static str> = self.entries.keys().copied().collect();
        funcs.sort_unstable();
        funcs
    }

    /// Route an already-validated envelope.
    pub fn decode(&self, env: RpcEnvelope) -> Result<Routed> {
        match self.entries.get(env.func.as_str()) {
            Some(decode) => decode(&env.payload).map(Routed::Rpc),
            None => Ok(Routed::Unknown {
                payload: env.payload.get().to_owned(),
                func: env.func,
            }),
        }
    }

    /// Decode the envelope, then route it.
    pub fn route(&self, bytes: &[u8]) -> Result<Routed> {
        self.decode(decode_envelope(bytes)?)
    }
}
