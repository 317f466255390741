//! Outbound messages from the agent to core.

use std::sync::Arc;

use tracing::debug;

use orb_agent_core::error::Result;
use orb_agent_core::protocol::outbound::{
    agent_policies_request, group_membership_request, Capabilities, Heartbeat,
};
use orb_agent_core::protocol::{topics, Topics};

use crate::transport::{QoS, Transport};

/// Publishing side of one transport session, bound to the agent's channel.
pub struct CoreLink {
    transport: Arc<dyn Transport>,
    topics: Topics,
}

impl CoreLink {
    pub fn new(transport: Arc<dyn Transport>, channel_id: &str) -> Self {
        Self {
            transport,
            topics: topics(channel_id),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub async fn send_capabilities(&self, caps: &Capabilities) -> Result<()> {
        let payload = caps.encode()?;
        self.transport
            .publish(&self.topics.capabilities, QoS::AtLeastOnce, payload)
            .await?;
        debug!(topic = %self.topics.capabilities, "capabilities sent");
        Ok(())
    }

    pub async fn request_group_membership(&self) -> Result<()> {
        let payload = group_membership_request()?;
        self.transport
            .publish(&self.topics.rpc_to_core, QoS::AtLeastOnce, payload)
            .await?;
        debug!("group membership requested");
        Ok(())
    }

    pub async fn request_agent_policies(&self) -> Result<()> {
        let payload = agent_policies_request()?;
        self.transport
            .publish(&self.topics.rpc_to_core, QoS::AtLeastOnce, payload)
            .await?;
        debug!("agent policies requested");
        Ok(())
    }

    pub async fn send_heartbeat(&self, hb: &Heartbeat) -> Result<()> {
        let payload = hb.encode()?;
        self.transport
            .publish(&self.topics.heartbeats, QoS::AtLeastOnce, payload)
            .await
    }
}
