#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use orb_agent::config::{self, PolicyClearScope};

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
agent:
  id: "a1"
  channel_id: "ch-a1"
subscriptions:
  atempts: 5 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.code().as_str(), "CONFIG");
}

#[test]
fn ok_minimal_config() {
    let ok = r#"
version: 1
agent:
  id: "a1"
  channel_id: "ch-a1"
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.agent.id, "a1");
    assert_eq!(cfg.subscriptions.attempts, 3);
    assert_eq!(cfg.subscriptions.ack_timeout_ms, 5000);
    assert_eq!(cfg.heartbeat.interval(), Duration::from_secs(50));
    assert_eq!(cfg.reconcile.policy_clear_scope, PolicyClearScope::AllBackends);
    assert!(cfg.backends.is_empty());
    assert!(cfg.ops.listen.is_none());
}

#[test]
fn full_config() {
    let ok = r#"
version: 1
agent:
  id: "a1"
  channel_id: "ch-a1"
  key: "secret"
  tags: { region: "eu", pop: "ams" }
transport:
  url: "ws://broker:8883/bridge"
  keepalive_ms: 5000
subscriptions:
  attempts: 5
  max_concurrent: 8
heartbeat:
  interval_ms: 30000
reconcile:
  policy_clear_scope: retain
backends:
  - name: pktvisor
    version: "4.2.0"
  - name: otel
ops:
  listen: "127.0.0.1:9100"
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.agent.tags["region"], "eu");
    assert_eq!(cfg.transport.keepalive(), Duration::from_secs(5));
    assert_eq!(cfg.subscriptions.max_concurrent, 8);
    assert_eq!(cfg.reconcile.policy_clear_scope, PolicyClearScope::Retain);
    assert_eq!(cfg.backends[1].version, "unknown");
}

#[test]
fn invalid_values_are_config_errors() {
    let cases = [
        // unsupported config version
        "version: 2\nagent: { id: a1, channel_id: ch }\n",
        // channel id becomes a topic segment
        "version: 1\nagent: { id: a1, channel_id: \"a/b\" }\n",
        // no TLS support compiled in
        "version: 1\nagent: { id: a1, channel_id: ch }\ntransport: { url: \"wss://x\" }\n",
        "version: 1\nagent: { id: a1, channel_id: ch }\nsubscriptions: { attempts: 0 }\n",
        "version: 1\nagent: { id: a1, channel_id: ch }\nbackends: [{ name: a }, { name: a }]\n",
    ];
    for case in cases {
        let err = config::load_from_str(case).expect_err(case);
        assert_eq!(err.code().as_str(), "CONFIG", "{case}");
    }
}
