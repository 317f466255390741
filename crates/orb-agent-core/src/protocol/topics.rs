//! Canonical topic names for a channel.
//!
//! Every channel, the agent's own or a group's, exposes the same fixed set of
//! topics under `channels/{channel_id}/messages`.

pub const RPC_TO_CORE_SUFFIX: &str = "rpc_to_core";
pub const RPC_FROM_CORE_SUFFIX: &str = "rpc_from_core";
pub const CAPABILITIES_SUFFIX: &str = "capabilities";
pub const HEARTBEATS_SUFFIX: &str = "heartbeats";
pub const LOG_SUFFIX: &str = "log";

/// Topic set of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topics {
    pub base: String,
    pub rpc_to_core: String,
    pub rpc_from_core: String,
    pub capabilities: String,
    pub heartbeats: String,
    pub log: String,
}

/// Name every topic of `channel_id`. Pure and deterministic.
pub fn topics(channel_id: &str) -> Topics {
    let base = format!("channels/{channel_id}/messages");
    Topics {
        rpc_to_core: format!("{base}/{RPC_TO_CORE_SUFFIX}"),
        rpc_from_core: format!("{base}/{RPC_FROM_CORE_SUFFIX}"),
        capabilities: format!("{base}/{CAPABILITIES_SUFFIX}"),
        heartbeats: format!("{base}/{HEARTBEATS_SUFFIX}"),
        log: format!("{base}/{LOG_SUFFIX}"),
        base,
    }
}

impl Topics {
    /// Topic handed to a backend for its own traffic.
    pub fn backend(&self, backend: &str) -> String {
        format!("{}/be/{backend}", self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_every_suffix_under_base() {
        let t = topics("abc");
        assert_eq!(t.base, "channels/abc/messages");
        assert_eq!(t.rpc_to_core, "channels/abc/messages/rpc_to_core");
        assert_eq!(t.rpc_from_core, "channels/abc/messages/rpc_from_core");
        assert_eq!(t.capabilities, "channels/abc/messages/capabilities");
        assert_eq!(t.heartbeats, "channels/abc/messages/heartbeats");
        assert_eq!(t.log, "channels/abc/messages/log");
        assert_eq!(t.backend("pktvisor"), "channels/abc/messages/be/pktvisor");
    }

    #[test]
    fn deterministic_and_distinct() {
        assert_eq!(topics("abc"), topics("abc"));
        assert_ne!(topics("abc"), topics("xyz"));
    }
}
