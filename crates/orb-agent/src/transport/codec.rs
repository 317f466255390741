//! Bridge frame codec for the WebSocket transport.
//!
//! - Client frames: connect, subscribe/unsubscribe (acknowledged by id), publish
//! - Server frames: connection ack, per-request ack, topic message
//! - Payloads travel as UTF-8 text; every control-plane payload is JSON

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use orb_agent_core::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        keepalive_ms: u64,
    },
    Subscribe {
        id: u64,
        topic: String,
        qos: u8,
    },
    Unsubscribe {
        id: u64,
        topic: String,
    },
    Publish {
        topic: String,
        qos: u8,
        payload: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnAck {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Ack {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Message {
        topic: String,
        payload: String,
    },
}

pub fn encode(frame: &ClientFrame) -> Result<String> {
    serde_json::to_string(frame)
        .map_err(|e| AgentError::Internal(format!("bridge frame encode failed: {e}")))
}

pub fn decode(text: &str) -> Result<ServerFrame> {
    serde_json::from_str(text)
        .map_err(|e| AgentError::Transport(format!("invalid bridge frame: {e}")))
}

/// Payload bytes as frame text.
pub fn payload_text(payload: &Bytes) -> Result<String> {
    std::str::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|e| AgentError::Transport(format!("payload is not utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_is_tagged_by_op() {
        let s = encode(&ClientFrame::Subscribe {
            id: 7,
            topic: "channels/a/messages/rpc_from_core".into(),
            qos: 1,
        })
        .unwrap();
        assert_eq!(
            s,
            r#"{"op":"subscribe","id":7,"topic":"channels/a/messages/rpc_from_core","qos":1}"#
        );
    }

    #[test]
    fn decodes_server_frames() {
        assert_eq!(
            decode(r#"{"op":"ack","id":3,"ok":false,"error":"denied"}"#).unwrap(),
            ServerFrame::Ack {
                id: 3,
                ok: false,
                error: Some("denied".into())
            }
        );
        assert_eq!(
            decode(r#"{"op":"conn_ack","ok":true}"#).unwrap(),
            ServerFrame::ConnAck { ok: true, error: None }
        );
        assert!(decode(r#"{"op":"bogus"}"#).is_err());
    }

    #[test]
    fn rejects_binary_payloads() {
        assert!(payload_text(&Bytes::from_static(&[0xff, 0xfe])).is_err());
    }
}
