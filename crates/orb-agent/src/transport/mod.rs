//! Transport layer (publish/subscribe session to core).
//!
//! The agent only depends on the [`Transport`] and [`Connector`] traits.
//! Inbound messages are pushed into a scope-tagged [`Inbox`]; the session
//! drains it into one ordered dispatch lane per scope.
//!
//! - `memory`: in-process broker, used for local runs and tests.
//! - `ws`: JSON bridge frames over a WebSocket, with keepalive and reconnect.
//! - `codec`: the bridge frame format used by `ws`.

pub mod codec;
pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use orb_agent_core::error::Result;
use orb_agent_core::protocol::RpcScope;

pub use memory::{BrokerOp, MemoryBroker, Published, SubscribeFault};
pub use ws::{backoff, WsConnector, WsTransport};

/// Delivery quality requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// One message delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub scope: RpcScope,
    pub topic: String,
    pub payload: Bytes,
}

/// Scope-tagged sink handed to the transport with each subscription.
#[derive(Debug, Clone)]
pub struct Inbox {
    scope: RpcScope,
    tx: mpsc::Sender<InboundMessage>,
}

impl Inbox {
    pub fn new(scope: RpcScope, tx: mpsc::Sender<InboundMessage>) -> Self {
        Self { scope, tx }
    }

    pub fn scope(&self) -> RpcScope {
        self.scope
    }

    /// Returns false once the session stopped draining.
    pub async fn deliver(&self, topic: &str, payload: Bytes) -> bool {
        self.tx
            .send(InboundMessage {
                scope: self.scope,
                topic: topic.to_string(),
                payload,
            })
            .await
            .is_ok()
    }
}

/// Publish/subscribe session with at-least-once delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the broker acknowledged the subscription.
    async fn subscribe(&self, topic: &str, qos: QoS, inbox: Inbox) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    /// Resolves once the message is enqueued, not when core processed it.
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Opens transport sessions. Failure here is fatal at agent startup.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}
