use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use orb_agent_core::error::Result;
use orb_agent_core::protocol::rpc::{
    AgentPolicy, AgentReset, AgentStop, DatasetRemoved, GroupMembership, GroupRemoved,
};
use orb_agent_core::protocol::RpcScope;

use crate::dispatch::RpcHandler;
use crate::groups::Reconciler;
use crate::lifecycle::LifecycleController;
use crate::policy::PolicyBridge;

/// Routes decoded RPCs to the components of one transport session.
pub struct AgentRpcHandler {
    reconciler: Arc<Reconciler>,
    policies: Arc<PolicyBridge>,
    lifecycle: Arc<LifecycleController>,
}

impl AgentRpcHandler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        policies: Arc<PolicyBridge>,
        lifecycle: Arc<LifecycleController>,
    ) -> Self {
        Self {
            reconciler,
            policies,
            lifecycle,
        }
    }
}

#[async_trait]
impl RpcHandler for AgentRpcHandler {
    async fn group_membership(&self, update: GroupMembership) -> Result<()> {
        self.reconciler.apply(update).await;
        Ok(())
    }

    async fn agent_policies(&self, scope: RpcScope, batch: Vec<AgentPolicy>) -> Result<()> {
        info!(scope = scope.as_str(), policies = batch.len(), "agent policies received");
        self.policies.apply_batch(batch).await;
        Ok(())
    }

    async fn agent_stop(&self, stop: AgentStop) -> Result<()> {
        info!(reason = %stop.reason, "stop requested by core");
        self.lifecycle.request_stop(stop.reason);
        Ok(())
    }

    async fn agent_reset(&self, reset: AgentReset) -> Result<()> {
        info!(full_reset = reset.full_reset, reason = %reset.reason, "reset requested by core");
        self.lifecycle.request_reset(reset.full_reset, reset.reason);
        Ok(())
    }

    async fn group_removed(&self, removed: GroupRemoved) -> Result<()> {
        self.reconciler.remove_group(removed).await;
        Ok(())
    }

    async fn dataset_removed(&self, removed: DatasetRemoved) -> Result<()> {
        self.policies.remove_dataset(&removed).await;
        Ok(())
    }
}
