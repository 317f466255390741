use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use orb_agent_core::protocol::outbound::AgentState;
use orb_agent_core::protocol::rpc::{AgentPolicy, DatasetRemoved};

use crate::config::PolicyClearScope;
use crate::heartbeat::HeartbeatEmitter;
use crate::obs::AgentMetrics;
use crate::policy::manager::PolicyManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyFailure {
    pub policy_id: String,
    pub policy_name: String,
    pub error: String,
}

/// Outcome of one `agent-policies` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub applied: Vec<String>,
    pub failed: Vec<PolicyFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Hands policy RPCs to the policy manager and reports back to core.
///
/// Batches, dataset removals and clears hold the policy state lock
/// exclusively, so they never interleave and heartbeats only see their
/// result.
pub struct PolicyBridge {
    manager: Arc<dyn PolicyManager>,
    backends: Vec<String>,
    clear_scope: PolicyClearScope,
    heartbeat: Arc<HeartbeatEmitter>,
    state: Arc<RwLock<()>>,
    metrics: Arc<AgentMetrics>,
}

impl PolicyBridge {
    pub fn new(
        manager: Arc<dyn PolicyManager>,
        backends: Vec<String>,
        clear_scope: PolicyClearScope,
        heartbeat: Arc<HeartbeatEmitter>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let state = heartbeat.policy_state_lock();
        Self {
            manager,
            backends,
            clear_scope,
            heartbeat,
            state,
            metrics,
        }
    }

    /// Apply every policy in order. A failing policy does not stop the batch.
    /// A heartbeat with the resulting state follows each batch.
    pub async fn apply_batch(&self, batch: Vec<AgentPolicy>) -> BatchReport {
        let mut report = BatchReport::default();
        let writing = self.state.write().await;

        for policy in &batch {
            match self.manager.manage_policy(policy).await {
                Ok(()) => {
                    self.metrics.policies_applied.inc(&[("outcome", "applied")]);
                    report.applied.push(policy.id.clone());
                }
                Err(e) => {
                    self.metrics.policies_applied.inc(&[("outcome", "failed")]);
                    error!(
                        policy_id = %policy.id,
                        policy_name = %policy.name,
                        backend = %policy.backend,
                        error = %e,
                        "failed to apply policy"
                    );
                    report.failed.push(PolicyFailure {
                        policy_id: policy.id.clone(),
                        policy_name: policy.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        drop(writing);

        info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "policy batch processed"
        );
        self.report_state().await;
        report
    }

    pub async fn remove_dataset(&self, removed: &DatasetRemoved) {
        let writing = self.state.write().await;
        let res = self
            .manager
            .remove_policy_dataset(&removed.policy_id, &removed.dataset_id)
            .await;
        drop(writing);
        match res {
            Ok(dropped) => info!(
                policy_id = %removed.policy_id,
                dataset_id = %removed.dataset_id,
                policy_dropped = dropped,
                "dataset removed from policy"
            ),
            Err(e) => error!(
                policy_id = %removed.policy_id,
                dataset_id = %removed.dataset_id,
                error = %e,
                "failed to remove dataset from policy"
            ),
        }
        self.report_state().await;
    }

    /// Drop backend policies after the agent's group set shrank.
    /// Returns true if anything was cleared, in which case the caller
    /// re-requests the full policy set.
    pub async fn clear_backends(&self, cause: &str) -> bool {
        if self.clear_scope == PolicyClearScope::Retain {
            debug!(cause, "policy clear skipped by config");
            return false;
        }
        self.clear_all(cause).await
    }

    /// Drop every backend's policies regardless of config. Used by a full reset.
    pub async fn clear_all(&self, cause: &str) -> bool {
        let _writing = self.state.write().await;
        match self.manager.policies().await {
            Ok(p) if p.is_empty() => {
                debug!(cause, "no policies to clear");
                return false;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "policy state unavailable, clearing anyway"),
        }

        for backend in &self.backends {
            if let Err(e) = self.manager.remove_backend_policies(backend).await {
                error!(backend = %backend, error = %e, "failed to remove backend policies");
            }
        }
        info!(cause, backends = self.backends.len(), "backend policies cleared");
        true
    }

    async fn report_state(&self) {
        match self.heartbeat.beat_now(AgentState::Online, None).await {
            Ok(true) => {}
            Ok(false) => debug!("heartbeat emitter stopped, state not reported"),
            // the emitter already degraded the session
            Err(e) => warn!(error = %e, "failed to send policy state heartbeat"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use orb_agent_core::error::Result;
    use orb_agent_core::protocol::outbound::PolicyStateInfo;
    use orb_agent_core::protocol::rpc::PolicyAction;

    use crate::groups::GroupRegistry;
    use crate::lifecycle::LifecycleController;
    use crate::link::CoreLink;
    use crate::policy::LocalPolicyManager;
    use crate::transport::{Connector, MemoryBroker};

    async fn bridge_over(
        broker: &MemoryBroker,
        manager: Arc<dyn PolicyManager>,
        backends: &[&str],
        scope: PolicyClearScope,
    ) -> PolicyBridge {
        let transport = broker.connect().await.unwrap();
        let metrics = Arc::new(AgentMetrics::default());
        let heartbeat = Arc::new(HeartbeatEmitter::new(
            Arc::new(CoreLink::new(transport, "ch")),
            manager.clone(),
            Arc::new(GroupRegistry::new()),
            Arc::new(LifecycleController::new()),
            metrics.clone(),
            Duration::from_secs(50),
        ));
        PolicyBridge::new(
            manager,
            backends.iter().map(|b| b.to_string()).collect(),
            scope,
            heartbeat,
            metrics,
        )
    }

    async fn bridge(
        broker: &MemoryBroker,
        scope: PolicyClearScope,
    ) -> (PolicyBridge, Arc<LocalPolicyManager>) {
        let manager = Arc::new(LocalPolicyManager::new(["pktvisor"]));
        let bridge = bridge_over(broker, manager.clone(), &["pktvisor"], scope).await;
        (bridge, manager)
    }

    /// Takes a while to clear each backend.
    struct SlowClear(LocalPolicyManager);

    #[async_trait]
    impl PolicyManager for SlowClear {
        async fn manage_policy(&self, policy: &AgentPolicy) -> Result<()> {
            self.0.manage_policy(policy).await
        }

        async fn remove_backend_policies(&self, backend: &str) -> Result<()> {
            self.0.remove_backend_policies(backend).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }

        async fn remove_policy_dataset(&self, policy_id: &str, dataset_id: &str) -> Result<bool> {
            self.0.remove_policy_dataset(policy_id, dataset_id).await
        }

        async fn policies(&self) -> Result<BTreeMap<String, PolicyStateInfo>> {
            self.0.policies().await
        }
    }

    fn policy(id: &str, backend: &str) -> AgentPolicy {
        AgentPolicy {
            id: id.into(),
            name: id.into(),
            backend: backend.into(),
            version: 1,
            format: "yaml".into(),
            data: serde_json::Value::Null,
            datasets: vec!["d1".into()],
            action: PolicyAction::Manage,
        }
    }

    #[tokio::test]
    async fn failing_policy_does_not_stop_batch() {
        let broker = MemoryBroker::new();
        let (bridge, _) = bridge(&broker, PolicyClearScope::AllBackends).await;

        let report = bridge
            .apply_batch(vec![
                policy("p1", "pktvisor"),
                policy("p2", "missing"),
                policy("p3", "pktvisor"),
            ])
            .await;

        assert_eq!(report.applied, vec!["p1", "p3"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].policy_id, "p2");
        assert!(!report.is_clean());
        assert_eq!(
            broker
                .published_to("channels/ch/messages/heartbeats")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn clear_respects_scope_and_existing_policies() {
        let broker = MemoryBroker::new();
        let (retain, manager) = bridge(&broker, PolicyClearScope::Retain).await;
        retain.apply_batch(vec![policy("p1", "pktvisor")]).await;
        assert!(!retain.clear_backends("group removed").await);
        assert_eq!(manager.policies().await.unwrap().len(), 1);

        let (all, manager) = bridge(&broker, PolicyClearScope::AllBackends).await;
        assert!(!all.clear_backends("nothing there").await);
        all.apply_batch(vec![policy("p1", "pktvisor")]).await;
        assert!(all.clear_backends("group removed").await);
        assert!(manager.policies().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_waits_for_a_clear_in_progress() {
        let broker = MemoryBroker::new();
        let manager = Arc::new(SlowClear(LocalPolicyManager::new(["a", "b"])));
        let bridge = bridge_over(
            &broker,
            manager.clone(),
            &["a", "b"],
            PolicyClearScope::AllBackends,
        )
        .await;
        bridge.apply_batch(vec![policy("old", "b")]).await;

        // the clear starts first; the batch must land after it, not between backends
        let (cleared, report) = tokio::join!(
            bridge.clear_backends("full group membership reconciliation"),
            bridge.apply_batch(vec![policy("pa", "a"), policy("pb", "b")]),
        );
        assert!(cleared);
        assert!(report.is_clean());

        let left: Vec<String> = manager.policies().await.unwrap().into_keys().collect();
        assert_eq!(left, vec!["pa", "pb"]);

        let last: serde_json::Value = serde_json::from_slice(
            &broker
                .published_to("channels/ch/messages/heartbeats")
                .last()
                .unwrap()
                .payload,
        )
        .unwrap();
        let reported: Vec<&String> = last["policy_state"].as_object().unwrap().keys().collect();
        assert_eq!(reported, vec!["pa", "pb"]);
    }
}
