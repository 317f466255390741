//! In-process broker.
//!
//! Plays both roles of a broker: the agent connects to it through
//! [`Connector`], and the other side (core, or a test) injects messages with
//! [`MemoryBroker::deliver`] and inspects what the agent did through the
//! recorded subscribe/unsubscribe operations and publishes.
//! Subscribe acknowledgements can be scripted to fail or stall per topic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use orb_agent_core::error::{AgentError, Result};

use crate::lock;
use crate::transport::{Connector, Inbox, QoS, Transport};

/// What the broker should do with the next subscribe on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFault {
    /// Negative acknowledgement.
    Reject,
    /// Never acknowledge.
    Stall,
}

/// Subscription operations, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Subscribe(String),
    Unsubscribe(String),
}

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

#[derive(Default)]
struct BrokerInner {
    subscriptions: DashMap<String, (u64, Inbox)>,
    faults: DashMap<String, VecDeque<SubscribeFault>>,
    ops: Mutex<Vec<BrokerOp>>,
    published: Mutex<Vec<Published>>,
    refuse_connections: AtomicBool,
    next_client: AtomicU64,
}

/// Cloneable handle to one shared broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::Relaxed);
    }

    /// Script the outcome of the next subscribes on `topic`, one fault per attempt.
    pub fn inject_subscribe_faults(
        &self,
        topic: &str,
        faults: impl IntoIterator<Item = SubscribeFault>,
    ) {
        self.inner
            .faults
            .entry(topic.to_string())
            .or_default()
            .extend(faults);
    }

    /// Deliver a message to whoever subscribed `topic`. Returns false if nobody did.
    pub async fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let inbox = self
            .inner
            .subscriptions
            .get(topic)
            .map(|e| e.value().1.clone());
        match inbox {
            Some(inbox) => inbox.deliver(topic, payload.into()).await,
            None => false,
        }
    }

    pub fn ops(&self) -> Vec<BrokerOp> {
        lock(&self.inner.ops).clone()
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.inner.published).clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        lock(&self.inner.published)
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.inner
            .subscriptions
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn connections(&self) -> u64 {
        self.inner.next_client.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        if self.inner.refuse_connections.load(Ordering::Relaxed) {
            return Err(AgentError::Connection("memory broker refused connection".into()));
        }
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(MemoryClient {
            id,
            broker: self.clone(),
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One connection to a [`MemoryBroker`]. Its subscriptions die with it.
struct MemoryClient {
    id: u64,
    broker: MemoryBroker,
    topics: Mutex<HashMap<String, QoS>>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(AgentError::Transport("connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryClient {
    async fn subscribe(&self, topic: &str, qos: QoS, inbox: Inbox) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.broker.inner;
        lock(&inner.ops).push(BrokerOp::Subscribe(topic.to_string()));

        let fault = inner
            .faults
            .get_mut(topic)
            .and_then(|mut queue| queue.pop_front());
        match fault {
            Some(SubscribeFault::Reject) => {
                return Err(AgentError::Transport(format!("subscribe rejected: {topic}")))
            }
            Some(SubscribeFault::Stall) => {
                futures_util::future::pending::<()>().await;
            }
            None => {}
        }

        inner
            .subscriptions
            .insert(topic.to_string(), (self.id, inbox));
        lock(&self.topics).insert(topic.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        let inner = &self.broker.inner;
        lock(&inner.ops).push(BrokerOp::Unsubscribe(topic.to_string()));
        inner
            .subscriptions
            .remove_if(topic, |_, (owner, _)| *owner == self.id);
        lock(&self.topics).remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        lock(&self.broker.inner.published).push(Published {
            topic: topic.to_string(),
            qos,
            payload,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let topics: Vec<String> = lock(&self.topics).drain().map(|(t, _)| t).collect();
        for t in topics {
            self.broker
                .inner
                .subscriptions
                .remove_if(&t, |_, (owner, _)| *owner == self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_agent_core::protocol::RpcScope;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delivers_to_subscriber_and_drops_on_close() {
        let broker = MemoryBroker::new();
        let client = broker.connect().await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        client
            .subscribe("t/1", QoS::AtLeastOnce, Inbox::new(RpcScope::Core, tx))
            .await
            .unwrap();
        assert!(broker.deliver("t/1", "hello").await);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "t/1");
        assert_eq!(&msg.payload[..], b"hello");

        client.close().await.unwrap();
        assert!(!broker.deliver("t/1", "again").await);
        assert!(client.publish("t/2", QoS::AtMostOnce, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn scripted_reject_is_consumed_per_attempt() {
        let broker = MemoryBroker::new();
        broker.inject_subscribe_faults("t/1", [SubscribeFault::Reject]);
        let client = broker.connect().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let inbox = Inbox::new(RpcScope::Group, tx);

        assert!(client.subscribe("t/1", QoS::AtLeastOnce, inbox.clone()).await.is_err());
        assert!(client.subscribe("t/1", QoS::AtLeastOnce, inbox).await.is_ok());
        assert_eq!(
            broker.ops(),
            vec![
                BrokerOp::Subscribe("t/1".into()),
                BrokerOp::Subscribe("t/1".into())
            ]
        );
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let err = broker.connect().await.err().unwrap();
        assert_eq!(err.code().as_str(), "CONNECTION");
    }
}
