//! Agent session: one connect/handshake/serve cycle per transport session.
//!
//! `run` keeps cycling on reset requests and returns a [`Termination`] when
//! core stops the agent or the shutdown future completes.
//!
//! Inbound messages are dispatched on one lane per scope: messages of the
//! same scope are handled one at a time in arrival order, while the agent
//! channel and the group channels proceed independently. Components that
//! hold the transport (link, heartbeat, reconciler, dispatcher) are rebuilt
//! for every cycle; the group registry, policy manager and lifecycle
//! controller live for the whole process.

pub mod handler;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use orb_agent_core::error::Result;
use orb_agent_core::protocol::outbound::{AgentState, BackendInfo, Capabilities};
use orb_agent_core::protocol::RpcScope;

use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;
use crate::groups::{GroupRegistry, Reconciler, RetryPolicy, SubscriptionWorker};
use crate::heartbeat::HeartbeatEmitter;
use crate::lifecycle::{ControlRequest, LifecycleController, LifecycleEvent};
use crate::link::CoreLink;
use crate::lock;
use crate::obs::AgentMetrics;
use crate::policy::{Backend, PolicyBridge, PolicyManager};
use crate::transport::{backoff, Connector, InboundMessage, Inbox, QoS, Transport};

pub use handler::AgentRpcHandler;

/// Process exit code after core sent `agent-stop`.
pub const EXIT_STOPPED_BY_CORE: u8 = 3;

const INBOX_CAPACITY: usize = 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Core sent `agent-stop`.
    Stopped { reason: String },
    /// The local shutdown signal fired.
    Interrupted,
}

enum Exit {
    Stop(String),
    Reset { full: bool, reason: String },
    Interrupted,
}

/// Ordered dispatch queues, one per scope.
struct Lanes {
    core: mpsc::UnboundedSender<InboundMessage>,
    group: mpsc::UnboundedSender<InboundMessage>,
}

impl Lanes {
    fn open(dispatcher: &Arc<Dispatcher>, tasks: &mut JoinSet<()>) -> Self {
        Self {
            core: Self::lane(dispatcher, tasks),
            group: Self::lane(dispatcher, tasks),
        }
    }

    fn lane(
        dispatcher: &Arc<Dispatcher>,
        tasks: &mut JoinSet<()>,
    ) -> mpsc::UnboundedSender<InboundMessage> {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        let dispatcher = Arc::clone(dispatcher);
        tasks.spawn(async move {
            while let Some(msg) = rx.recv().await {
                dispatcher.dispatch(&msg).await;
            }
        });
        tx
    }

    fn push(&self, msg: InboundMessage) {
        let lane = match msg.scope {
            RpcScope::Core => &self.core,
            RpcScope::Group => &self.group,
        };
        if let Err(e) = lane.send(msg) {
            debug!(topic = %e.0.topic, "dispatch lane closed, dropping message");
        }
    }
}

/// Per-transport-session components.
struct Epoch {
    transport: Arc<dyn Transport>,
    link: Arc<CoreLink>,
    heartbeat: Arc<HeartbeatEmitter>,
    policies: Arc<PolicyBridge>,
    reconciler: Arc<Reconciler>,
    core_inbox: Inbox,
    inbox: mpsc::Receiver<InboundMessage>,
    lanes: Option<Lanes>,
    tasks: JoinSet<()>,
}

pub struct AgentSession {
    cfg: Arc<AgentConfig>,
    connector: Arc<dyn Connector>,
    policies: Arc<dyn PolicyManager>,
    backends: Vec<Arc<dyn Backend>>,
    groups: Arc<GroupRegistry>,
    lifecycle: Arc<LifecycleController>,
    metrics: Arc<AgentMetrics>,
    current: Mutex<Option<Arc<Reconciler>>>,
}

impl AgentSession {
    pub fn new(
        cfg: Arc<AgentConfig>,
        connector: Arc<dyn Connector>,
        policies: Arc<dyn PolicyManager>,
        backends: Vec<Arc<dyn Backend>>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            cfg,
            connector,
            policies,
            backends,
            groups: Arc::new(GroupRegistry::new()),
            lifecycle: Arc::new(LifecycleController::new()),
            metrics,
            current: Mutex::new(None),
        }
    }

    pub fn groups(&self) -> Arc<GroupRegistry> {
        Arc::clone(&self.groups)
    }

    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.lifecycle)
    }

    pub fn metrics(&self) -> Arc<AgentMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn policy_manager(&self) -> Arc<dyn PolicyManager> {
        Arc::clone(&self.policies)
    }

    /// Reconciler of the live transport session, if any.
    pub fn reconciler(&self) -> Option<Arc<Reconciler>> {
        lock(&self.current).clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        let backends = self
            .backends
            .iter()
            .map(|b| {
                (
                    b.name().to_string(),
                    BackendInfo {
                        version: b.version(),
                    },
                )
            })
            .collect();
        Capabilities::new(
            env!("CARGO_PKG_VERSION"),
            self.cfg.agent.tags.clone(),
            backends,
        )
    }

    /// Run until core stops the agent or `shutdown` completes.
    /// Failing to connect the first time is fatal.
    pub async fn run<F>(&self, shutdown: F) -> Result<Termination>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut restart = false;

        loop {
            self.lifecycle.fire(LifecycleEvent::Start)?;
            let transport = if restart {
                match self.reconnect(&mut shutdown).await {
                    Some(t) => t,
                    None => return Ok(Termination::Interrupted),
                }
            } else {
                self.connector.connect().await.map_err(|e| {
                    error!(error = %e, "failed to connect to core");
                    e
                })?
            };
            self.lifecycle.fire(LifecycleEvent::TransportConnected)?;

            let mut epoch = self.open(transport);
            *lock(&self.current) = Some(Arc::clone(&epoch.reconciler));
            self.handshake(&epoch).await;

            match self.serve(&mut epoch, &mut shutdown).await {
                Exit::Reset { full, reason } => {
                    self.metrics
                        .resets
                        .inc(&[("full", if full { "true" } else { "false" })]);
                    self.lifecycle
                        .fire(LifecycleEvent::Reset { full, reason })?;
                    self.teardown(epoch, full).await;
                    restart = true;
                }
                Exit::Stop(reason) => {
                    self.lifecycle
                        .fire(LifecycleEvent::StopRequested(reason.clone()))?;
                    self.close(epoch, &reason).await;
                    self.lifecycle.fire(LifecycleEvent::Closed)?;
                    return Ok(Termination::Stopped { reason });
                }
                Exit::Interrupted => {
                    let reason = "interrupted".to_string();
                    self.lifecycle
                        .fire(LifecycleEvent::StopRequested(reason.clone()))?;
                    self.close(epoch, &reason).await;
                    self.lifecycle.fire(LifecycleEvent::Closed)?;
                    return Ok(Termination::Interrupted);
                }
            }
        }
    }

    async fn reconnect<F>(&self, shutdown: &mut Pin<&mut F>) -> Option<Arc<dyn Transport>>
    where
        F: Future<Output = ()>,
    {
        let mut attempt = 0u32;
        loop {
            match self.connector.connect().await {
                Ok(t) => return Some(t),
                Err(e) => {
                    attempt += 1;
                    let delay = backoff(&self.cfg.transport, attempt);
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "reconnect after reset failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.as_mut() => return None,
                    }
                }
            }
        }
    }

    fn open(&self, transport: Arc<dyn Transport>) -> Epoch {
        let link = Arc::new(CoreLink::new(
            Arc::clone(&transport),
            &self.cfg.agent.channel_id,
        ));
        for backend in &self.backends {
            let topic = link.topics().backend(backend.name());
            backend.set_comms_client(&self.cfg.agent.id, Arc::clone(&transport), &topic);
        }

        let heartbeat = Arc::new(HeartbeatEmitter::new(
            Arc::clone(&link),
            Arc::clone(&self.policies),
            Arc::clone(&self.groups),
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.metrics),
            self.cfg.heartbeat.interval(),
        ));
        let policies = Arc::new(PolicyBridge::new(
            Arc::clone(&self.policies),
            self.backends.iter().map(|b| b.name().to_string()).collect(),
            self.cfg.reconcile.policy_clear_scope,
            Arc::clone(&heartbeat),
            Arc::clone(&self.metrics),
        ));

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let worker = SubscriptionWorker::new(
            Arc::clone(&transport),
            Inbox::new(RpcScope::Group, tx.clone()),
            RetryPolicy::from(&self.cfg.subscriptions),
            Arc::clone(&self.metrics),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&transport),
            Arc::clone(&self.groups),
            Arc::clone(&policies),
            Arc::clone(&link),
            Arc::clone(&self.lifecycle),
            worker,
            self.cfg.subscriptions.max_concurrent,
            Arc::clone(&self.metrics),
        ));
        let handler = Arc::new(AgentRpcHandler::new(
            Arc::clone(&reconciler),
            Arc::clone(&policies),
            Arc::clone(&self.lifecycle),
        ));
        let dispatcher = Arc::new(Dispatcher::new(handler, Arc::clone(&self.metrics)));
        let mut tasks = JoinSet::new();
        let lanes = Lanes::open(&dispatcher, &mut tasks);

        Epoch {
            transport,
            link,
            heartbeat,
            policies,
            reconciler,
            core_inbox: Inbox::new(RpcScope::Core, tx),
            inbox,
            lanes: Some(lanes),
            tasks,
        }
    }

    /// Subscribe the agent channel, announce capabilities, request state.
    /// Failures degrade the session instead of aborting it.
    async fn handshake(&self, epoch: &Epoch) {
        let own = epoch.link.topics().rpc_from_core.clone();
        let ack = RetryPolicy::from(&self.cfg.subscriptions).ack_timeout;
        let subscribed = timeout(
            ack,
            epoch
                .transport
                .subscribe(&own, QoS::AtLeastOnce, epoch.core_inbox.clone()),
        )
        .await;
        match subscribed {
            Ok(Ok(())) => info!(topic = %own, "subscribed to agent RPC channel"),
            Ok(Err(e)) => {
                error!(topic = %own, error = %e, "failed to subscribe to agent RPC channel");
                self.lifecycle.degrade(format!("agent channel subscribe failed: {e}"));
            }
            Err(_) => {
                error!(topic = %own, "agent RPC channel subscription not acknowledged");
                self.lifecycle.degrade("agent channel subscribe timed out");
            }
        }

        if let Err(e) = epoch.link.send_capabilities(&self.capabilities()).await {
            error!(error = %e, "failed to send agent capabilities");
            self.lifecycle.degrade(format!("capabilities publish failed: {e}"));
        }
        if let Err(e) = epoch.link.request_group_membership().await {
            error!(error = %e, "failed to request group membership");
            self.lifecycle.degrade(format!("group membership request failed: {e}"));
        }
        if let Err(e) = epoch.link.request_agent_policies().await {
            error!(error = %e, "failed to request agent policies");
            self.lifecycle.degrade(format!("agent policies request failed: {e}"));
        }

        if let Err(e) = self.lifecycle.fire(LifecycleEvent::HandshakeComplete) {
            debug!(error = %e, "handshake completion not recorded");
        }
        epoch.heartbeat.start();
    }

    async fn serve<F>(&self, epoch: &mut Epoch, shutdown: &mut Pin<&mut F>) -> Exit
    where
        F: Future<Output = ()>,
    {
        loop {
            tokio::select! {
                Some(msg) = epoch.inbox.recv() => {
                    if let Some(lanes) = &epoch.lanes {
                        lanes.push(msg);
                    }
                }
                req = self.lifecycle.next_request() => match req {
                    Some(ControlRequest::Stop { reason }) => return Exit::Stop(reason),
                    Some(ControlRequest::Reset { full, reason }) => return Exit::Reset { full, reason },
                    None => return Exit::Interrupted,
                },
                _ = shutdown.as_mut() => return Exit::Interrupted,
            }
        }
    }

    /// Tear a session down before reconnecting.
    async fn teardown(&self, mut epoch: Epoch, full: bool) {
        epoch.heartbeat.stop().await;
        epoch.tasks.shutdown().await;
        epoch.reconciler.shutdown().await;
        epoch.reconciler.release_all().await;
        if full {
            epoch.policies.clear_all("full reset").await;
        }
        if let Err(e) = epoch.transport.close().await {
            warn!(error = %e, "failed to close transport");
        }
        *lock(&self.current) = None;
    }

    /// Final shutdown: no heartbeat after the offline one, transport closed.
    async fn close(&self, mut epoch: Epoch, reason: &str) {
        epoch.heartbeat.stop().await;

        // queued messages still run; the lanes end once they are empty
        epoch.lanes = None;
        let drained = timeout(DRAIN_TIMEOUT, async {
            while epoch.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("in-flight RPCs did not finish, aborting");
            epoch.tasks.shutdown().await;
        }
        epoch.reconciler.shutdown().await;

        if let Err(e) = epoch
            .heartbeat
            .farewell(AgentState::Offline, Some(reason.to_string()))
            .await
        {
            warn!(error = %e, "failed to send offline heartbeat");
        }
        if let Err(e) = epoch.transport.close().await {
            warn!(error = %e, "failed to close transport");
        }
        self.groups.reset();
        self.metrics.groups_active.set(&[], 0);
        *lock(&self.current) = None;
        info!(reason, "agent session closed");
    }
}
