//! Bounded-retry subscription to one group channel.

use std::sync::Arc;

use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use orb_agent_core::protocol::rpc::GroupDescriptor;

use crate::config::SubscriptionSection;
use crate::obs::AgentMetrics;
use crate::transport::{Inbox, QoS, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub ack_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SubscriptionSection> for RetryPolicy {
    fn from(cfg: &SubscriptionSection) -> Self {
        Self {
            attempts: cfg.attempts.max(1),
            ack_timeout: Duration::from_millis(cfg.ack_timeout_ms),
        }
    }
}

/// Every attempt failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    pub attempts: u32,
    pub last_error: String,
}

/// Subscribes group channels at-least-once, retrying immediately on failure.
#[derive(Clone)]
pub struct SubscriptionWorker {
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    policy: RetryPolicy,
    metrics: Arc<AgentMetrics>,
}

impl SubscriptionWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        policy: RetryPolicy,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            transport,
            inbox,
            policy,
            metrics,
        }
    }

    /// Returns the number of attempts it took.
    pub async fn subscribe(&self, group: &GroupDescriptor, topic: &str) -> Result<u32, Exhausted> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.attempts {
            let res = timeout(
                self.policy.ack_timeout,
                self.transport
                    .subscribe(topic, QoS::AtLeastOnce, self.inbox.clone()),
            )
            .await;

            match res {
                Ok(Ok(())) => {
                    self.metrics.subscribe_attempts.inc(&[("outcome", "ok")]);
                    info!(
                        group_id = %group.group_id,
                        group_name = %group.name,
                        topic = %topic,
                        attempt,
                        "completed RPC subscription to group"
                    );
                    return Ok(attempt);
                }
                Ok(Err(e)) => {
                    self.metrics.subscribe_attempts.inc(&[("outcome", "error")]);
                    warn!(group_id = %group.group_id, topic = %topic, attempt, error = %e, "group subscribe failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    self.metrics.subscribe_attempts.inc(&[("outcome", "timeout")]);
                    warn!(
                        group_id = %group.group_id,
                        topic = %topic,
                        attempt,
                        timeout_ms = self.policy.ack_timeout.as_millis() as u64,
                        "group subscribe not acknowledged"
                    );
                    last_error = format!("no ack within {:?}", self.policy.ack_timeout);
                }
            }
        }

        self.metrics.subscribe_permanent_failures.inc(&[]);
        error!(
            group_id = %group.group_id,
            group_name = %group.name,
            topic = %topic,
            attempts = self.policy.attempts,
            error = %last_error,
            "failed to subscribe to group channel, giving up"
        );
        Err(Exhausted {
            attempts: self.policy.attempts,
            last_error,
        })
    }

    /// Best-effort unsubscribe, bounded by the ack timeout.
    pub async fn release(&self, group: &GroupDescriptor, topic: &str) {
        match timeout(self.policy.ack_timeout, self.transport.unsubscribe(topic)).await {
            Ok(Ok(())) => debug!(group_id = %group.group_id, topic = %topic, "released group subscription"),
            Ok(Err(e)) => warn!(group_id = %group.group_id, topic = %topic, error = %e, "failed to release group subscription"),
            Err(_) => warn!(group_id = %group.group_id, topic = %topic, "group unsubscribe not acknowledged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, MemoryBroker, SubscribeFault};
    use orb_agent_core::protocol::RpcScope;
    use tokio::sync::mpsc;

    fn group() -> GroupDescriptor {
        GroupDescriptor {
            group_id: "g1".into(),
            name: "G1".into(),
            channel_id: "ch1".into(),
        }
    }

    async fn worker(broker: &MemoryBroker) -> (SubscriptionWorker, mpsc::Receiver<crate::transport::InboundMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let w = SubscriptionWorker::new(
            broker.connect().await.unwrap(),
            Inbox::new(RpcScope::Group, tx),
            RetryPolicy::default(),
            Arc::new(AgentMetrics::default()),
        );
        (w, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_and_rejects_count_as_attempts() {
        let broker = MemoryBroker::new();
        broker.inject_subscribe_faults("t", [SubscribeFault::Stall, SubscribeFault::Reject]);
        let (w, _rx) = worker(&broker).await;

        let started = tokio::time::Instant::now();
        assert_eq!(w.subscribe(&group(), "t").await, Ok(3));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(broker.subscribed_topics().contains("t"));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bound() {
        let broker = MemoryBroker::new();
        broker.inject_subscribe_faults("t", [SubscribeFault::Reject; 4]);
        let (w, _rx) = worker(&broker).await;

        let err = w.subscribe(&group(), "t").await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.last_error.contains("rejected"));
        assert_eq!(broker.ops().len(), 3);
        assert!(broker.subscribed_topics().is_empty());
    }
}
