use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use orb_agent_core::error::{ErrorCode, Result};
use orb_agent_core::protocol::rpc::{
    AgentPolicy, AgentReset, AgentStop, DatasetRemoved, GroupMembership, GroupRemoved,
};
use orb_agent_core::protocol::{DispatchTable, Routed, Rpc, RpcScope};

use crate::obs::AgentMetrics;
use crate::transport::InboundMessage;

/// One method per RPC core can send. The dispatcher calls exactly one of
/// them per well-formed message.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn group_membership(&self, update: GroupMembership) -> Result<()>;
    async fn agent_policies(&self, scope: RpcScope, batch: Vec<AgentPolicy>) -> Result<()>;
    async fn agent_stop(&self, stop: AgentStop) -> Result<()>;
    async fn agent_reset(&self, reset: AgentReset) -> Result<()>;
    async fn group_removed(&self, removed: GroupRemoved) -> Result<()>;
    async fn dataset_removed(&self, removed: DatasetRemoved) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(&'static str),
    /// Well-formed envelope, func not in the scope's table.
    Unknown(String),
    /// Envelope or payload failed to decode; nothing was invoked.
    Rejected(ErrorCode),
    /// Handler ran and returned an error.
    Failed { func: &'static str, code: ErrorCode },
}

/// Routes inbound messages through the table of the scope they arrived on.
pub struct Dispatcher {
    core: DispatchTable,
    group: DispatchTable,
    handler: Arc<dyn RpcHandler>,
    metrics: Arc<AgentMetrics>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn RpcHandler>, metrics: Arc<AgentMetrics>) -> Self {
        Self {
            core: DispatchTable::core(),
            group: DispatchTable::group(),
            handler,
            metrics,
        }
    }

    pub fn table(&self, scope: RpcScope) -> &DispatchTable {
        match scope {
            RpcScope::Core => &self.core,
            RpcScope::Group => &self.group,
        }
    }

    pub async fn dispatch(&self, msg: &InboundMessage) -> DispatchOutcome {
        let scope = msg.scope.as_str();
        debug!(
            scope,
            topic = %msg.topic,
            payload = %String::from_utf8_lossy(&msg.payload),
            "RPC message from core"
        );

        let routed = match self.table(msg.scope).route(&msg.payload) {
            Ok(r) => r,
            Err(e) => {
                let code = e.code();
                self.metrics
                    .rpc_rejected
                    .inc(&[("scope", scope), ("code", code.as_str())]);
                error!(scope, topic = %msg.topic, error = %e, "error decoding RPC message from core");
                return DispatchOutcome::Rejected(code);
            }
        };

        let rpc = match routed {
            Routed::Rpc(rpc) => rpc,
            Routed::Unknown { func, payload } => {
                self.metrics
                    .rpc_unknown
                    .inc(&[("scope", scope), ("func", func.as_str())]);
                warn!(scope, func = %func, payload = %payload, "unsupported RPC from core, ignoring");
                return DispatchOutcome::Unknown(func);
            }
        };

        let func = rpc.func();
        self.metrics
            .rpc_received
            .inc(&[("scope", scope), ("func", func)]);

        let started = Instant::now();
        let res = self.invoke(msg.scope, rpc).await;
        self.metrics
            .dispatch_duration
            .observe(&[("scope", scope), ("func", func)], started.elapsed());

        match res {
            Ok(()) => DispatchOutcome::Handled(func),
            Err(e) => {
                error!(scope, func, error = %e, "RPC handler failed");
                DispatchOutcome::Failed {
                    func,
                    code: e.code(),
                }
            }
        }
    }

    async fn invoke(&self, scope: RpcScope, rpc: Rpc) -> Result<()> {
        match rpc {
            Rpc::GroupMembership(update) => self.handler.group_membership(update).await,
            Rpc::AgentPolicies(batch) => self.handler.agent_policies(scope, batch).await,
            Rpc::AgentStop(stop) => self.handler.agent_stop(stop).await,
            Rpc::AgentReset(reset) => self.handler.agent_reset(reset).await,
            Rpc::GroupRemoved(removed) => self.handler.group_removed(removed).await,
            Rpc::DatasetRemoved(removed) => self.handler.dataset_removed(removed).await,
        }
    }
}
