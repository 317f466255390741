use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use orb_agent_core::error::Result;
use orb_agent_core::protocol::outbound::PolicyStateInfo;
use orb_agent_core::protocol::rpc::AgentPolicy;

use crate::transport::Transport;

/// Applies policies to collection backends and reports their state.
#[async_trait]
pub trait PolicyManager: Send + Sync {
    /// Install, update or remove one policy, depending on its action.
    async fn manage_policy(&self, policy: &AgentPolicy) -> Result<()>;

    async fn remove_backend_policies(&self, backend: &str) -> Result<()>;

    /// Detach a dataset from a policy. Returns true if the policy was
    /// dropped because no dataset was left.
    async fn remove_policy_dataset(&self, policy_id: &str, dataset_id: &str) -> Result<bool>;

    /// Current policy state keyed by policy id.
    async fn policies(&self) -> Result<BTreeMap<String, PolicyStateInfo>>;
}

/// A collection backend the agent drives.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> String;

    /// Hand the backend its own publishing topic on a fresh transport session.
    fn set_comms_client(&self, agent_id: &str, transport: Arc<dyn Transport>, base_topic: &str);
}
