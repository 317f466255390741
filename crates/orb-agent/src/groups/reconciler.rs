//! Group membership reconciliation.
//!
//! A membership update never waits for broker acknowledgements: each group
//! gets a reservation in the registry and a subscription worker on the
//! reconciler's `JoinSet`. Workers commit into the registry only while their
//! reservation is still live.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use orb_agent_core::protocol::rpc::{GroupDescriptor, GroupMembership, GroupRemoved};
use orb_agent_core::protocol::topics;

use crate::groups::registry::{GroupRegistry, SubscriptionFailure, Ticket};
use crate::groups::retry::SubscriptionWorker;
use crate::lifecycle::LifecycleController;
use crate::link::CoreLink;
use crate::lock;
use crate::obs::AgentMetrics;
use crate::policy::PolicyBridge;
use crate::transport::Transport;

// finished outcomes kept for `drain` between reaps
const FINISHED_CAP: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed { group_id: String, attempts: u32 },
    Failed { group_id: String, attempts: u32, error: String },
    /// Acknowledged after the group was dropped; the topic was released again.
    Superseded { group_id: String },
}

impl SubscribeOutcome {
    pub fn group_id(&self) -> &str {
        match self {
            SubscribeOutcome::Subscribed { group_id, .. }
            | SubscribeOutcome::Failed { group_id, .. }
            | SubscribeOutcome::Superseded { group_id } => group_id,
        }
    }
}

#[derive(Default)]
struct Workers {
    set: JoinSet<SubscribeOutcome>,
    finished: VecDeque<SubscribeOutcome>,
}

impl Workers {
    fn reap(&mut self) {
        while let Some(res) = self.set.try_join_next() {
            match res {
                Ok(outcome) => {
                    if self.finished.len() == FINISHED_CAP {
                        self.finished.pop_front();
                    }
                    self.finished.push_back(outcome);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "subscription worker panicked"),
            }
        }
    }
}

/// Everything a subscription worker needs once it is detached from the update.
#[derive(Clone)]
struct WorkerCtx {
    worker: SubscriptionWorker,
    transport: Arc<dyn Transport>,
    groups: Arc<GroupRegistry>,
    lifecycle: Arc<LifecycleController>,
    metrics: Arc<AgentMetrics>,
    limit: Option<Arc<Semaphore>>,
    reconcile: Arc<tokio::sync::Mutex<()>>,
}

pub struct Reconciler {
    ctx: WorkerCtx,
    policies: Arc<PolicyBridge>,
    link: Arc<CoreLink>,
    workers: Mutex<Workers>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        groups: Arc<GroupRegistry>,
        policies: Arc<PolicyBridge>,
        link: Arc<CoreLink>,
        lifecycle: Arc<LifecycleController>,
        worker: SubscriptionWorker,
        max_concurrent: usize,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let limit = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
        Self {
            ctx: WorkerCtx {
                worker,
                transport,
                groups,
                lifecycle,
                metrics,
                limit,
                reconcile: Arc::new(tokio::sync::Mutex::new(())),
            },
            policies,
            link,
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.ctx.groups
    }

    /// Apply a membership update, then re-request the policy set.
    pub async fn apply(&self, update: GroupMembership) {
        {
            let _serial = self.ctx.reconcile.lock().await;

            if update.full_list {
                let departed = self.ctx.groups.reset();
                for (group_id, info) in &departed {
                    let topic = topics(&info.channel_id).rpc_from_core;
                    match self.ctx.transport.unsubscribe(&topic).await {
                        Ok(()) => debug!(group_id = %group_id, topic = %topic, "unsubscribed group channel"),
                        Err(e) => warn!(group_id = %group_id, topic = %topic, error = %e, "failed to unsubscribe group channel"),
                    }
                }
                self.ctx.metrics.groups_active.set(&[], 0);
                self.policies
                    .clear_backends("full group membership reconciliation")
                    .await;
                info!(
                    departed = departed.len(),
                    groups = update.groups.len(),
                    "full group membership reconciliation"
                );
                // a full resync clears earlier faults; this round's failures degrade again
                self.ctx.lifecycle.recover();
            }

            for group in update.groups {
                match self.ctx.groups.reserve(&group) {
                    Some(ticket) => self.spawn(ticket, group),
                    None => debug!(group_id = %group.group_id, "group already known, skipping"),
                }
            }
        }

        if let Err(e) = self.link.request_agent_policies().await {
            error!(error = %e, "failed to request agent policies");
            self.ctx
                .lifecycle
                .degrade(format!("agent policies request failed: {e}"));
        }
    }

    /// Leave one group channel. Policies are cleared and re-requested.
    pub async fn remove_group(&self, removed: GroupRemoved) {
        {
            let _serial = self.ctx.reconcile.lock().await;
            let dropped = self.ctx.groups.remove_channel(&removed.channel_id);
            let topic = topics(&removed.channel_id).rpc_from_core;
            match self.ctx.transport.unsubscribe(&topic).await {
                Ok(()) => info!(
                    channel_id = %removed.channel_id,
                    groups = dropped.len(),
                    "group removed, unsubscribed channel"
                ),
                Err(e) => warn!(
                    channel_id = %removed.channel_id,
                    error = %e,
                    "failed to unsubscribe removed group channel"
                ),
            }
            self.update_gauge();
        }

        if self.policies.clear_backends("group removed").await {
            if let Err(e) = self.link.request_agent_policies().await {
                error!(error = %e, "failed to request agent policies");
                self.ctx
                    .lifecycle
                    .degrade(format!("agent policies request failed: {e}"));
            }
        }
    }

    /// Drop every group and unsubscribe their channels. Used by a reset.
    pub async fn release_all(&self) {
        let _serial = self.ctx.reconcile.lock().await;
        for (group_id, info) in self.ctx.groups.reset() {
            let topic = topics(&info.channel_id).rpc_from_core;
            if let Err(e) = self.ctx.transport.unsubscribe(&topic).await {
                debug!(group_id = %group_id, error = %e, "unsubscribe during release failed");
            }
        }
        self.ctx.metrics.groups_active.set(&[], 0);
    }

    /// Wait for every in-flight worker and return all outcomes not yet drained.
    pub async fn drain(&self) -> Vec<SubscribeOutcome> {
        let (mut set, mut out) = {
            let mut w = lock(&self.workers);
            w.reap();
            let out: Vec<_> = w.finished.drain(..).collect();
            (std::mem::take(&mut w.set), out)
        };
        while let Some(res) = set.join_next().await {
            match res {
                Ok(outcome) => out.push(outcome),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "subscription worker panicked"),
            }
        }
        out
    }

    /// Abort in-flight workers and wait until they are gone.
    pub async fn shutdown(&self) {
        let mut set = std::mem::take(&mut lock(&self.workers).set);
        set.shutdown().await;
    }

    pub fn in_flight(&self) -> usize {
        let mut w = lock(&self.workers);
        w.reap();
        w.set.len()
    }

    fn update_gauge(&self) {
        self.ctx
            .metrics
            .groups_active
            .set(&[], self.ctx.groups.len() as i64);
    }

    fn spawn(&self, ticket: Ticket, group: GroupDescriptor) {
        let ctx = self.ctx.clone();
        let mut w = lock(&self.workers);
        w.reap();
        w.set.spawn(subscribe_group(ctx, ticket, group));
    }
}

async fn subscribe_group(ctx: WorkerCtx, ticket: Ticket, group: GroupDescriptor) -> SubscribeOutcome {
    let topic = topics(&group.channel_id).rpc_from_core;
    let _permit = match &ctx.limit {
        Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
        None => None,
    };

    match ctx.worker.subscribe(&group, &topic).await {
        Ok(attempts) => {
            if ctx.groups.commit(ticket, &group) {
                ctx.metrics
                    .groups_active
                    .set(&[], ctx.groups.len() as i64);
                return SubscribeOutcome::Subscribed {
                    group_id: group.group_id,
                    attempts,
                };
            }

            // dropped while in flight; release the topic unless a newer
            // reservation for the same channel now relies on it
            let _serial = ctx.reconcile.lock().await;
            if !ctx.groups.channel_in_use(&group.channel_id) {
                ctx.worker.release(&group, &topic).await;
            }
            info!(group_id = %group.group_id, "group dropped while subscribing");
            SubscribeOutcome::Superseded {
                group_id: group.group_id,
            }
        }
        Err(exhausted) => {
            ctx.groups.release(ticket, &group.group_id);
            {
                // an abandoned attempt may still have reached the broker
                let _serial = ctx.reconcile.lock().await;
                if !ctx.groups.channel_in_use(&group.channel_id) {
                    ctx.worker.release(&group, &topic).await;
                }
            }
            ctx.groups.record_failure(SubscriptionFailure {
                group_id: group.group_id.clone(),
                group_name: group.name.clone(),
                topic,
                attempts: exhausted.attempts,
                error: exhausted.last_error.clone(),
                at: Utc::now(),
            });
            ctx.lifecycle.degrade(format!(
                "subscription to group {} failed after {} attempts",
                group.group_id, exhausted.attempts
            ));
            SubscribeOutcome::Failed {
                group_id: group.group_id,
                attempts: exhausted.attempts,
                error: exhausted.last_error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use orb_agent_core::protocol::RpcScope;

    use crate::config::PolicyClearScope;
    use crate::groups::retry::RetryPolicy;
    use crate::heartbeat::HeartbeatEmitter;
    use crate::lifecycle::{LifecycleEvent, SessionState};
    use crate::policy::LocalPolicyManager;
    use crate::transport::{BrokerOp, Connector, Inbox, MemoryBroker, SubscribeFault};

    struct Fixture {
        reconciler: Reconciler,
        groups: Arc<GroupRegistry>,
        lifecycle: Arc<LifecycleController>,
        _rx: mpsc::Receiver<crate::transport::InboundMessage>,
    }

    async fn fixture(broker: &MemoryBroker, max_concurrent: usize) -> Fixture {
        let transport = broker.connect().await.unwrap();
        let metrics = Arc::new(AgentMetrics::default());
        let groups = Arc::new(GroupRegistry::new());
        let manager = Arc::new(LocalPolicyManager::new(["pktvisor"]));
        let link = Arc::new(CoreLink::new(transport.clone(), "agent"));
        let lifecycle = Arc::new(LifecycleController::new());
        let heartbeat = Arc::new(HeartbeatEmitter::new(
            link.clone(),
            manager.clone(),
            groups.clone(),
            lifecycle.clone(),
            metrics.clone(),
            Duration::from_secs(50),
        ));
        let bridge = Arc::new(PolicyBridge::new(
            manager,
            vec!["pktvisor".into()],
            PolicyClearScope::AllBackends,
            heartbeat,
            metrics.clone(),
        ));
        lifecycle.fire(LifecycleEvent::Start).unwrap();
        lifecycle.fire(LifecycleEvent::TransportConnected).unwrap();
        lifecycle.fire(LifecycleEvent::HandshakeComplete).unwrap();

        let (tx, rx) = mpsc::channel(16);
        let worker = SubscriptionWorker::new(
            transport.clone(),
            Inbox::new(RpcScope::Group, tx),
            RetryPolicy::default(),
            metrics.clone(),
        );
        let reconciler = Reconciler::new(
            transport,
            groups.clone(),
            bridge,
            link,
            lifecycle.clone(),
            worker,
            max_concurrent,
            metrics,
        );
        Fixture {
            reconciler,
            groups,
            lifecycle,
            _rx: rx,
        }
    }

    fn update(full_list: bool, groups: &[(&str, &str)]) -> GroupMembership {
        GroupMembership {
            full_list,
            groups: groups
                .iter()
                .map(|(id, ch)| GroupDescriptor {
                    group_id: id.to_string(),
                    name: id.to_string(),
                    channel_id: ch.to_string(),
                })
                .collect(),
        }
    }

    fn topic(ch: &str) -> String {
        topics(ch).rpc_from_core
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_after_full_reset_is_released() {
        let broker = MemoryBroker::new();
        broker.inject_subscribe_faults(&topic("ch1"), [SubscribeFault::Stall]);
        let f = fixture(&broker, 0).await;

        f.reconciler.apply(update(true, &[("g1", "ch1")])).await;
        assert_eq!(f.groups.in_flight(), 1);

        // core drops the group while the first attempt is still unacknowledged
        f.reconciler.apply(update(true, &[])).await;
        assert_eq!(f.groups.in_flight(), 0);

        let outcomes = f.reconciler.drain().await;
        assert_eq!(
            outcomes,
            vec![SubscribeOutcome::Superseded {
                group_id: "g1".into()
            }]
        );
        assert!(f.groups.is_empty());
        assert!(broker.subscribed_topics().is_empty());
        assert_eq!(broker.ops().last(), Some(&BrokerOp::Unsubscribe(topic("ch1"))));
    }

    #[tokio::test(start_paused = true)]
    async fn projection_matches_subscriptions_after_drain() {
        let broker = MemoryBroker::new();
        broker.inject_subscribe_faults(&topic("ch2"), [SubscribeFault::Reject; 3]);
        let f = fixture(&broker, 2).await;

        f.reconciler
            .apply(update(true, &[("g1", "ch1"), ("g2", "ch2"), ("g3", "ch3")]))
            .await;
        let mut outcomes = f.reconciler.drain().await;
        outcomes.sort_by(|a, b| a.group_id().cmp(b.group_id()));

        assert!(matches!(outcomes[0], SubscribeOutcome::Subscribed { attempts: 1, .. }));
        assert!(matches!(outcomes[1], SubscribeOutcome::Failed { attempts: 3, .. }));
        assert!(matches!(outcomes[2], SubscribeOutcome::Subscribed { .. }));

        let projected: Vec<String> = f
            .groups
            .snapshot()
            .values()
            .map(|g| topic(&g.channel_id))
            .collect();
        let subscribed: Vec<String> = broker.subscribed_topics().into_iter().collect();
        assert_eq!(projected, subscribed);
        assert_eq!(f.lifecycle.state(), SessionState::Degraded);
        assert_eq!(
            broker
                .ops()
                .into_iter()
                .filter(|op| *op == BrokerOp::Unsubscribe(topic("ch2")))
                .count(),
            1,
            "failed group releases its topic"
        );
    }

    #[tokio::test]
    async fn removed_group_unsubscribes_its_channel_topic() {
        let broker = MemoryBroker::new();
        let f = fixture(&broker, 0).await;

        f.reconciler.apply(update(false, &[("g1", "ch1")])).await;
        f.reconciler.drain().await;
        assert!(f.groups.contains("g1"));

        f.reconciler
            .remove_group(GroupRemoved {
                channel_id: "ch1".into(),
            })
            .await;
        assert!(f.groups.is_empty());
        assert!(broker
            .ops()
            .contains(&BrokerOp::Unsubscribe(topic("ch1"))));
        assert!(broker.subscribed_topics().is_empty());
    }
}
