//! Periodic and on-demand heartbeats.
//!
//! Every emission (periodic or on demand) takes the same gate, and the gate
//! carries the `stopped` flag. Once [`HeartbeatEmitter::stop`] returns no
//! further heartbeat is published, except the explicit [`HeartbeatEmitter::farewell`].
//!
//! Policy state is read under the shared side of the policy state lock, so a
//! heartbeat never reports a batch or a clear halfway through. A heartbeat
//! that cannot be published degrades the session.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use orb_agent_core::error::Result;
use orb_agent_core::protocol::outbound::{AgentState, GroupStateInfo, Heartbeat};

use crate::groups::GroupRegistry;
use crate::lifecycle::LifecycleController;
use crate::link::CoreLink;
use crate::lock;
use crate::obs::AgentMetrics;
use crate::policy::PolicyManager;

pub struct HeartbeatEmitter {
    link: Arc<CoreLink>,
    policies: Arc<dyn PolicyManager>,
    groups: Arc<GroupRegistry>,
    lifecycle: Arc<LifecycleController>,
    metrics: Arc<AgentMetrics>,
    interval: Duration,
    policy_state: Arc<RwLock<()>>,
    gate: tokio::sync::Mutex<bool>,
    task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl HeartbeatEmitter {
    pub fn new(
        link: Arc<CoreLink>,
        policies: Arc<dyn PolicyManager>,
        groups: Arc<GroupRegistry>,
        lifecycle: Arc<LifecycleController>,
        metrics: Arc<AgentMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            link,
            policies,
            groups,
            lifecycle,
            metrics,
            interval,
            policy_state: Arc::new(RwLock::new(())),
            gate: tokio::sync::Mutex::new(false),
            task: Mutex::new(None),
        }
    }

    /// Start periodic emission. First tick fires one interval from now.
    pub fn start(self: &Arc<Self>) {
        let mut slot = lock(&self.task);
        if slot.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + me.interval, me.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match me.beat_now(AgentState::Online, None).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => warn!(error = %e, "failed to send heartbeat"),
                        }
                    }
                }
            }
            debug!("heartbeat loop finished");
        });
        *slot = Some((stop_tx, handle));
    }

    /// Writers of policy state hold the exclusive side while they mutate.
    pub(crate) fn policy_state_lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.policy_state)
    }

    /// Emit one heartbeat now. `Ok(false)` once the emitter was stopped.
    pub async fn beat_now(&self, state: AgentState, message: Option<String>) -> Result<bool> {
        let stopped = self.gate.lock().await;
        if *stopped {
            return Ok(false);
        }
        if let Err(e) = self.emit(state, message).await {
            self.lifecycle
                .degrade(format!("heartbeat publish failed: {e}"));
            return Err(e);
        }
        Ok(true)
    }

    /// Cancel the periodic task and wait for it. No emission can start afterwards.
    pub async fn stop(&self) {
        *self.gate.lock().await = true;
        let task = lock(&self.task).take();
        if let Some((stop_tx, handle)) = task {
            let _ = stop_tx.send(());
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "heartbeat task failed");
                }
            }
        }
    }

    /// Last heartbeat of a session, sent after `stop`.
    pub async fn farewell(&self, state: AgentState, message: Option<String>) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.emit(state, message).await
    }

    async fn emit(&self, state: AgentState, message: Option<String>) -> Result<()> {
        let hb = self.build(state, message).await;
        self.link.send_heartbeat(&hb).await?;
        self.metrics.heartbeats_sent.inc(&[("state", state.as_str())]);
        debug!(
            state = state.as_str(),
            policies = hb.policy_state.len(),
            groups = hb.group_state.len(),
            "heartbeat sent"
        );
        Ok(())
    }

    async fn build(&self, state: AgentState, message: Option<String>) -> Heartbeat {
        let mut hb = Heartbeat::new(Utc::now(), state);
        hb.message = message;
        let settled = self.policy_state.read().await;
        hb.policy_state = match self.policies.policies().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "policy state unavailable for heartbeat");
                BTreeMap::new()
            }
        };
        drop(settled);
        hb.group_state = self
            .groups
            .snapshot()
            .into_iter()
            .map(|(id, g)| {
                (
                    id,
                    GroupStateInfo {
                        name: g.name,
                        channel_id: g.channel_id,
                    },
                )
            })
            .collect();
        hb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleEvent, SessionState};
    use crate::policy::LocalPolicyManager;
    use crate::transport::{Connector, MemoryBroker, Transport};

    const CHANNEL: &str = "agent-ch";

    fn synchronized() -> Arc<LifecycleController> {
        let lc = Arc::new(LifecycleController::new());
        lc.fire(LifecycleEvent::Start).unwrap();
        lc.fire(LifecycleEvent::TransportConnected).unwrap();
        lc.fire(LifecycleEvent::HandshakeComplete).unwrap();
        lc
    }

    fn with_transport(
        transport: Arc<dyn Transport>,
        lifecycle: Arc<LifecycleController>,
        every: Duration,
    ) -> Arc<HeartbeatEmitter> {
        Arc::new(HeartbeatEmitter::new(
            Arc::new(CoreLink::new(transport, CHANNEL)),
            Arc::new(LocalPolicyManager::new(["pktvisor"])),
            Arc::new(GroupRegistry::new()),
            lifecycle,
            Arc::new(AgentMetrics::default()),
            every,
        ))
    }

    async fn emitter(broker: &MemoryBroker, every: Duration) -> Arc<HeartbeatEmitter> {
        let transport = broker.connect().await.unwrap();
        with_transport(transport, synchronized(), every)
    }

    fn beats(broker: &MemoryBroker) -> Vec<Heartbeat> {
        broker
            .published_to("channels/agent-ch/messages/heartbeats")
            .iter()
            .map(|p| serde_json::from_slice(&p.payload).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn emits_every_interval_and_never_after_stop() {
        let broker = MemoryBroker::new();
        let hb = emitter(&broker, Duration::from_secs(50)).await;
        hb.start();

        tokio::time::sleep(Duration::from_secs(49)).await;
        assert_eq!(beats(&broker).len(), 0);

        tokio::time::sleep(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert_eq!(beats(&broker).len(), 1);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(beats(&broker).len(), 3);
        assert!(beats(&broker).iter().all(|b| b.state == AgentState::Online));

        hb.stop().await;
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(beats(&broker).len(), 3);
        assert!(!hb.beat_now(AgentState::Online, None).await.unwrap());
        assert_eq!(beats(&broker).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn farewell_is_sent_after_stop() {
        let broker = MemoryBroker::new();
        let hb = emitter(&broker, Duration::from_secs(50)).await;
        hb.start();
        hb.stop().await;
        hb.farewell(AgentState::Offline, Some("agent-stop".into()))
            .await
            .unwrap();

        let sent = beats(&broker);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].state, AgentState::Offline);
        assert_eq!(sent[0].message.as_deref(), Some("agent-stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_degrades_the_session() {
        let broker = MemoryBroker::new();
        let transport = broker.connect().await.unwrap();
        let lifecycle = synchronized();
        let hb = with_transport(transport.clone(), lifecycle.clone(), Duration::from_secs(50));
        transport.close().await.unwrap();

        assert!(hb.beat_now(AgentState::Online, None).await.is_err());
        assert_eq!(lifecycle.state(), SessionState::Degraded);
        assert!(lifecycle.last_fault().unwrap().contains("heartbeat"));

        // the periodic loop reports the same way
        lifecycle.recover();
        hb.start();
        tokio::time::sleep(Duration::from_secs(51)).await;
        assert_eq!(lifecycle.state(), SessionState::Degraded);
        hb.stop().await;
        assert!(beats(&broker).is_empty());
    }
}
