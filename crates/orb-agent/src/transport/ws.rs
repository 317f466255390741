//! WebSocket bridge transport.
//!
//! Responsibilities:
//! - Connect to the bridge and wait for its connection ack
//! - Correlate subscribe/unsubscribe acks by request id
//! - Keepalive pings on the configured interval
//! - Reconnect with exponential backoff and re-establish every active subscription
//!
//! Pending acks fail as soon as the connection drops, so callers waiting on a
//! subscription observe the failure instead of their own timeout. A route is
//! registered before its subscribe goes out and survives only if the ack
//! arrives; a subscribe that fails or is abandoned by its caller leaves no route.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use orb_agent_core::error::{AgentError, Result};

use crate::config::TransportSection;
use crate::transport::codec::{self, ClientFrame, ServerFrame};
use crate::transport::{Connector, Inbox, QoS, Transport};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`WsTransport`] sessions for one agent identity.
pub struct WsConnector {
    cfg: TransportSection,
    client_id: String,
    key: Option<String>,
}

impl WsConnector {
    pub fn new(cfg: TransportSection, client_id: impl Into<String>, key: Option<String>) -> Self {
        Self {
            cfg,
            client_id: client_id.into(),
            key,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let t = WsTransport::connect(self.cfg.clone(), self.client_id.clone(), self.key.clone())
            .await?;
        Ok(Arc::new(t))
    }
}

struct Shared {
    cfg: TransportSection,
    client_id: String,
    key: Option<String>,
    out: Mutex<Option<mpsc::Sender<Message>>>,
    pending: DashMap<u64, oneshot::Sender<Result<()>>>,
    subscriptions: DashMap<String, Route>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

struct Route {
    id: u64,
    qos: QoS,
    inbox: Inbox,
}

/// Unregisters a route whose subscribe was never acknowledged.
struct RouteSlot<'a> {
    routes: &'a DashMap<String, Route>,
    topic: &'a str,
    id: u64,
    acked: bool,
}

impl Drop for RouteSlot<'_> {
    fn drop(&mut self) {
        if !self.acked {
            self.routes.remove_if(self.topic, |_, r| r.id == self.id);
        }
    }
}

/// Removes a pending ack slot when the waiting request goes away.
struct PendingSlot<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<Result<()>>>,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct WsTransport {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Connect once. A failure here is reported, not retried.
    pub async fn connect(
        cfg: TransportSection,
        client_id: String,
        key: Option<String>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            cfg,
            client_id,
            key,
            out: Mutex::new(None),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let socket = open_socket(&shared).await?;
        info!(url = %shared.cfg.url, client_id = %shared.client_id, "bridge connected");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(supervise(Arc::clone(&shared), socket, shutdown_rx, ready_tx));
        // The writer must be installed before the first request goes out.
        let _ = ready_rx.await;

        Ok(Self {
            shared,
            shutdown,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    async fn send(&self, frame: &ClientFrame) -> Result<()> {
        let text = codec::encode(frame)?;
        let tx = self
            .shared
            .out
            .lock()
            .await
            .clone()
            .ok_or_else(|| AgentError::Transport("bridge not connected".into()))?;
        tx.send(Message::Text(text.into()))
            .await
            .map_err(|_| AgentError::Transport("bridge writer closed".into()))
    }

    /// Send a request frame and wait for its ack.
    async fn request(&self, frame: impl FnOnce(u64) -> ClientFrame) -> Result<()> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.shared.pending,
            id,
        };

        self.send(&frame(id)).await?;
        rx.await
            .map_err(|_| AgentError::Transport("ack dropped".into()))?
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, topic: &str, qos: QoS, inbox: Inbox) -> Result<()> {
        // Registered before the ack so nothing published right after it is lost.
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscriptions
            .insert(topic.to_string(), Route { id, qos, inbox });
        let mut slot = RouteSlot {
            routes: &self.shared.subscriptions,
            topic,
            id,
            acked: false,
        };

        self.request(|id| ClientFrame::Subscribe {
            id,
            topic: topic.to_string(),
            qos: qos.as_u8(),
        })
        .await?;
        slot.acked = true;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.shared.subscriptions.remove(topic);
        self.request(|id| ClientFrame::Unsubscribe {
            id,
            topic: topic.to_string(),
        })
        .await
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        let payload = codec::payload_text(&payload)?;
        self.send(&ClientFrame::Publish {
            topic: topic.to_string(),
            qos: qos.as_u8(),
            payload,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        if let Some(tx) = self.shared.out.lock().await.clone() {
            let _ = tx.send(Message::Close(None)).await;
        }
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        fail_pending(&self.shared, "bridge closed");
        info!(client_id = %self.shared.client_id, "bridge closed");
        Ok(())
    }
}

async fn open_socket(shared: &Shared) -> Result<Socket> {
    let (mut socket, _) = connect_async(shared.cfg.url.as_str())
        .await
        .map_err(|e| AgentError::Connection(format!("{}: {e}", shared.cfg.url)))?;

    let hello = codec::encode(&ClientFrame::Connect {
        client_id: shared.client_id.clone(),
        key: shared.key.clone(),
        keepalive_ms: shared.cfg.keepalive_ms,
    })?;
    socket
        .send(Message::Text(hello.into()))
        .await
        .map_err(|e| AgentError::Connection(format!("connect frame: {e}")))?;

    let ack = timeout(shared.cfg.keepalive(), socket.next())
        .await
        .map_err(|_| AgentError::Connection("no connection ack".into()))?;
    match ack {
        Some(Ok(Message::Text(text))) => match codec::decode(text.as_str())? {
            ServerFrame::ConnAck { ok: true, .. } => Ok(socket),
            ServerFrame::ConnAck { ok: false, error } => Err(AgentError::Connection(
                error.unwrap_or_else(|| "connection refused".into()),
            )),
            other => Err(AgentError::Connection(format!(
                "expected connection ack, got {other:?}"
            ))),
        },
        Some(Ok(other)) => Err(AgentError::Connection(format!(
            "expected connection ack, got {other:?}"
        ))),
        Some(Err(e)) => Err(AgentError::Connection(e.to_string())),
        None => Err(AgentError::Connection("closed before connection ack".into())),
    }
}

fn fail_pending(shared: &Shared, why: &str) {
    let ids: Vec<u64> = shared.pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = shared.pending.remove(&id) {
            let _ = tx.send(Err(AgentError::Transport(why.to_string())));
        }
    }
}

/// Reconnect delay for the n-th consecutive failure (1-based).
pub fn backoff(cfg: &TransportSection, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ms = cfg.reconnect_base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(ms.min(cfg.reconnect_max_ms))
}

async fn supervise(
    shared: Arc<Shared>,
    mut socket: Socket,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    loop {
        tokio::select! {
            _ = run_connection(&shared, socket, ready.take()) => {}
            _ = shutdown.changed() => return,
        }
        *shared.out.lock().await = None;
        fail_pending(&shared, "bridge connection lost");
        if shared.closed.load(Ordering::Relaxed) {
            return;
        }

        let mut attempt = 0u32;
        socket = loop {
            attempt += 1;
            let delay = backoff(&shared.cfg, attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "bridge connection lost, reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            match open_socket(&shared).await {
                Ok(s) => break s,
                Err(e) => warn!(attempt, error = %e, "bridge reconnect failed"),
            }
        };
        info!(attempts = attempt, "bridge reconnected");
    }
}

/// Drive one socket until it closes.
async fn run_connection(shared: &Shared, socket: Socket, ready: Option<oneshot::Sender<()>>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    *shared.out.lock().await = Some(out_tx.clone());

    let keepalive = shared.cfg.keepalive();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(keepalive);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe_out = out_rx.recv() => {
                    let Some(m) = maybe_out else { break; };
                    let closing = matches!(m, Message::Close(_));
                    if ws_tx.send(m).await.is_err() || closing {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    match ready {
        Some(ready) => {
            let _ = ready.send(());
        }
        None => resubscribe(shared, &out_tx).await,
    }

    while let Some(incoming) = ws_rx.next().await {
        let msg = match incoming {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "bridge read failed");
                break;
            }
        };
        match msg {
            Message::Text(text) => match codec::decode(text.as_str()) {
                Ok(ServerFrame::Ack { id, ok, error }) => {
                    if let Some((_, tx)) = shared.pending.remove(&id) {
                        let res = if ok {
                            Ok(())
                        } else {
                            Err(AgentError::Transport(
                                error.unwrap_or_else(|| "request rejected".into()),
                            ))
                        };
                        let _ = tx.send(res);
                    }
                }
                Ok(ServerFrame::Message { topic, payload }) => {
                    let inbox = shared.subscriptions.get(&topic).map(|e| e.value().inbox.clone());
                    match inbox {
                        Some(inbox) => {
                            if !inbox.deliver(&topic, Bytes::from(payload)).await {
                                debug!(topic = %topic, "inbox closed, dropping message");
                            }
                        }
                        None => info!(topic = %topic, payload = %payload, "message on unknown channel, ignoring"),
                    }
                }
                Ok(ServerFrame::ConnAck { .. }) => {}
                Err(e) => warn!(error = %e, "dropping bridge frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
}

/// Replay every active subscription on a fresh connection. Acks are not awaited.
async fn resubscribe(shared: &Shared, out: &mpsc::Sender<Message>) {
    let subs: Vec<(String, QoS)> = shared
        .subscriptions
        .iter()
        .map(|e| (e.key().clone(), e.value().qos))
        .collect();
    for (topic, qos) in subs {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame::Subscribe {
            id,
            topic: topic.clone(),
            qos: qos.as_u8(),
        };
        match codec::encode(&frame) {
            Ok(text) => {
                if out.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
                debug!(topic = %topic, "resubscribed");
            }
            Err(e) => warn!(topic = %topic, error = %e, "resubscribe encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use orb_agent_core::protocol::rpc::GroupDescriptor;
    use orb_agent_core::protocol::RpcScope;

    use crate::groups::{RetryPolicy, SubscriptionWorker};
    use crate::obs::AgentMetrics;

    /// Bridge that acks subscribes to `acked` only. Once `push` fires it
    /// publishes a message on `silent`, then one on `acked`.
    async fn selective_bridge(
        acked: &'static str,
        silent: &'static str,
        push: oneshot::Receiver<()>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _connect = ws.next().await;
            ws.send(Message::Text(json!({ "op": "conn_ack", "ok": true }).to_string().into()))
                .await
                .unwrap();

            let mut push = push;
            let mut pushed = false;
            loop {
                tokio::select! {
                    _ = &mut push, if !pushed => {
                        pushed = true;
                        for topic in [silent, acked] {
                            let frame = json!({ "op": "message", "topic": topic, "payload": "{}" });
                            ws.send(Message::Text(frame.to_string().into())).await.unwrap();
                        }
                    }
                    frame = ws.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let v: Value = serde_json::from_str(text.as_str()).unwrap();
                            if v["op"] == "subscribe" && v["topic"] == acked {
                                let ack = json!({ "op": "ack", "id": v["id"], "ok": true });
                                ws.send(Message::Text(ack.to_string().into())).await.unwrap();
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
            }
        });
        format!("ws://{addr}/bridge")
    }

    #[tokio::test]
    async fn unacknowledged_subscribe_leaves_no_route() {
        let (push_tx, push_rx) = oneshot::channel();
        let url = selective_bridge("own", "orphan", push_rx).await;
        let cfg = TransportSection {
            url,
            ..TransportSection::default()
        };
        let transport: Arc<dyn Transport> =
            Arc::new(WsTransport::connect(cfg, "agent-1".into(), None).await.unwrap());

        let (tx, mut rx) = mpsc::channel(8);
        let inbox = Inbox::new(RpcScope::Group, tx);
        transport
            .subscribe("own", QoS::AtLeastOnce, inbox.clone())
            .await
            .unwrap();

        let worker = SubscriptionWorker::new(
            Arc::clone(&transport),
            inbox,
            RetryPolicy {
                attempts: 3,
                ack_timeout: Duration::from_millis(100),
            },
            Arc::new(AgentMetrics::default()),
        );
        let group = GroupDescriptor {
            group_id: "g1".into(),
            name: "G1".into(),
            channel_id: "ch1".into(),
        };
        let err = worker.subscribe(&group, "orphan").await.unwrap_err();
        assert_eq!(err.attempts, 3);

        // messages arrive in order, so the first one received tells whether
        // the abandoned topic still routed
        push_tx.send(()).unwrap();
        let first = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.topic, "own");

        transport.close().await.unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let cfg = TransportSection {
            reconnect_base_ms: 1000,
            reconnect_max_ms: 5000,
            ..TransportSection::default()
        };
        assert_eq!(backoff(&cfg, 1), Duration::from_millis(1000));
        assert_eq!(backoff(&cfg, 2), Duration::from_millis(2000));
        assert_eq!(backoff(&cfg, 3), Duration::from_millis(4000));
        assert_eq!(backoff(&cfg, 4), Duration::from_millis(5000));
        assert_eq!(backoff(&cfg, 40), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn unreachable_bridge_is_a_connection_error() {
        let cfg = TransportSection {
            url: "ws://127.0.0.1:1/bridge".into(),
            ..TransportSection::default()
        };
        let err = WsTransport::connect(cfg, "agent-1".into(), None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code().as_str(), "CONNECTION");
    }
}
