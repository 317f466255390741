//! In-process policy manager and backends.
//!
//! Tracks which policies are installed on which backend. Actually running
//! a collector is out of scope for the agent control plane; a backend here
//! only records the comms topic it was handed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use orb_agent_core::error::{AgentError, Result};
use orb_agent_core::protocol::outbound::{PolicyRunState, PolicyStateInfo};
use orb_agent_core::protocol::rpc::{AgentPolicy, PolicyAction};

use crate::lock;
use crate::policy::manager::{Backend, PolicyManager};
use crate::transport::Transport;

pub struct LocalPolicyManager {
    backends: BTreeSet<String>,
    policies: DashMap<String, PolicyStateInfo>,
}

impl LocalPolicyManager {
    pub fn new<I, S>(backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: backends.into_iter().map(Into::into).collect(),
            policies: DashMap::new(),
        }
    }
}

#[async_trait]
impl PolicyManager for LocalPolicyManager {
    async fn manage_policy(&self, policy: &AgentPolicy) -> Result<()> {
        if policy.action == PolicyAction::Remove {
            if self.policies.remove(&policy.id).is_some() {
                info!(policy_id = %policy.id, policy_name = %policy.name, "policy removed");
            }
            return Ok(());
        }

        if !self.backends.contains(&policy.backend) {
            let error = format!("backend not available: {}", policy.backend);
            self.policies.insert(
                policy.id.clone(),
                PolicyStateInfo {
                    name: policy.name.clone(),
                    backend: policy.backend.clone(),
                    version: policy.version,
                    state: PolicyRunState::FailedToApply,
                    datasets: policy.datasets.clone(),
                    error: Some(error.clone()),
                },
            );
            return Err(AgentError::Policy(error));
        }

        if let Some(existing) = self.policies.get(&policy.id) {
            if existing.state == PolicyRunState::Running && existing.version > policy.version {
                debug!(
                    policy_id = %policy.id,
                    installed = existing.version,
                    offered = policy.version,
                    "older policy version ignored"
                );
                return Ok(());
            }
        }

        self.policies.insert(
            policy.id.clone(),
            PolicyStateInfo {
                name: policy.name.clone(),
                backend: policy.backend.clone(),
                version: policy.version,
                state: PolicyRunState::Running,
                datasets: policy.datasets.clone(),
                error: None,
            },
        );
        Ok(())
    }

    async fn remove_backend_policies(&self, backend: &str) -> Result<()> {
        let before = self.policies.len();
        self.policies.retain(|_, p| p.backend != backend);
        let removed = before.saturating_sub(self.policies.len());
        if removed > 0 {
            info!(backend, removed, "backend policies removed");
        }
        Ok(())
    }

    async fn remove_policy_dataset(&self, policy_id: &str, dataset_id: &str) -> Result<bool> {
        let now_empty = match self.policies.get_mut(policy_id) {
            Some(mut p) => {
                p.datasets.retain(|d| d != dataset_id);
                p.datasets.is_empty()
            }
            None => return Ok(false),
        };
        if now_empty {
            self.policies.remove(policy_id);
        }
        Ok(now_empty)
    }

    async fn policies(&self) -> Result<BTreeMap<String, PolicyStateInfo>> {
        Ok(self
            .policies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

struct Comms {
    agent_id: String,
    topic: String,
    // held so the backend publishes on the session it was last handed
    _transport: Arc<dyn Transport>,
}

pub struct LocalBackend {
    name: String,
    version: String,
    comms: Mutex<Option<Comms>>,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            comms: Mutex::new(None),
        }
    }

    /// `(agent_id, topic)` from the last `set_comms_client`.
    pub fn comms(&self) -> Option<(String, String)> {
        lock(&self.comms)
            .as_ref()
            .map(|c| (c.agent_id.clone(), c.topic.clone()))
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn set_comms_client(&self, agent_id: &str, transport: Arc<dyn Transport>, base_topic: &str) {
        debug!(backend = %self.name, topic = %base_topic, "backend comms configured");
        *lock(&self.comms) = Some(Comms {
            agent_id: agent_id.to_string(),
            topic: base_topic.to_string(),
            _transport: transport,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: &str, backend: &str, datasets: &[&str]) -> AgentPolicy {
        AgentPolicy {
            id: id.into(),
            name: format!("{id}-name"),
            backend: backend.into(),
            version: 1,
            format: "yaml".into(),
            data: serde_json::Value::Null,
            datasets: datasets.iter().map(|d| d.to_string()).collect(),
            action: PolicyAction::Manage,
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_recorded_as_failed() {
        let pm = LocalPolicyManager::new(["pktvisor"]);
        let err = pm.manage_policy(&policy("p1", "otel", &["d1"])).await.unwrap_err();
        assert_eq!(err.code().as_str(), "POLICY");

        let state = pm.policies().await.unwrap();
        assert_eq!(state["p1"].state, PolicyRunState::FailedToApply);
        assert!(state["p1"].error.as_deref().unwrap().contains("otel"));
    }

    #[tokio::test]
    async fn last_dataset_removal_drops_policy() {
        let pm = LocalPolicyManager::new(["pktvisor"]);
        pm.manage_policy(&policy("p1", "pktvisor", &["d1", "d2"])).await.unwrap();

        assert!(!pm.remove_policy_dataset("p1", "d1").await.unwrap());
        assert_eq!(pm.policies().await.unwrap()["p1"].datasets, vec!["d2"]);
        assert!(pm.remove_policy_dataset("p1", "d2").await.unwrap());
        assert!(pm.policies().await.unwrap().is_empty());
        assert!(!pm.remove_policy_dataset("p1", "d2").await.unwrap());
    }

    #[tokio::test]
    async fn remove_action_and_backend_clear() {
        let pm = LocalPolicyManager::new(["a", "b"]);
        pm.manage_policy(&policy("p1", "a", &[])).await.unwrap();
        pm.manage_policy(&policy("p2", "b", &[])).await.unwrap();
        pm.manage_policy(&policy("p3", "b", &[])).await.unwrap();

        let mut remove = policy("p1", "a", &[]);
        remove.action = PolicyAction::Remove;
        pm.manage_policy(&remove).await.unwrap();
        pm.remove_backend_policies("b").await.unwrap();
        assert!(pm.policies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn older_version_does_not_replace_running_policy() {
        let pm = LocalPolicyManager::new(["a"]);
        let mut v2 = policy("p1", "a", &["d1"]);
        v2.version = 2;
        pm.manage_policy(&v2).await.unwrap();
        pm.manage_policy(&policy("p1", "a", &["d9"])).await.unwrap();
        assert_eq!(pm.policies().await.unwrap()["p1"].version, 2);
    }
}
