//! Envelope + dispatch table vector tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;

use serde::Deserialize;

use orb_agent_core::protocol::{DispatchTable, Routed, RpcScope};

#[derive(Debug, Deserialize)]
struct TestVector {
    description: String,
    scope: String,
    #[serde(default)]
    frame: Option<serde_json::Value>,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    expect: Option<Expect>,
    #[serde(default)]
    expect_error: Option<ExpectError>,
}

#[derive(Debug, Deserialize)]
struct Expect {
    #[serde(default)]
    func: Option<String>,
    #[serde(default)]
    unknown: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpectError {
    code: String,
}

impl TestVector {
    fn bytes(&self) -> Vec<u8> {
        match (&self.frame, &self.raw) {
            (Some(frame), None) => serde_json::to_vec(frame).unwrap(),
            (None, Some(raw)) => raw.as_bytes().to_vec(),
            _ => panic!("{}: exactly one of frame/raw", self.description),
        }
    }

    fn table(&self) -> DispatchTable {
        match self.scope.as_str() {
            "core" => DispatchTable::for_scope(RpcScope::Core),
            "group" => DispatchTable::for_scope(RpcScope::Group),
            other => panic!("unsupported scope: {other}"),
        }
    }
}

fn load(name: &str) -> Vec<TestVector> {
    let path = format!("{}/tests/vectors/{name}", env!("CARGO_MANIFEST_DIR"));
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn envelope_vectors() {
    let vectors = load("envelopes.json");
    assert!(!vectors.is_empty());

    for v in vectors {
        let routed = v.table().route(&v.bytes());
        match (&v.expect, &v.expect_error) {
            (Some(expect), None) => {
                let routed = routed.unwrap_or_else(|e| panic!("{}: {e}", v.description));
                match (routed, &expect.func, &expect.unknown) {
                    (Routed::Rpc(rpc), Some(func), None) => {
                        assert_eq!(rpc.func(), func, "{}", v.description)
                    }
                    (Routed::Unknown { func, .. }, None, Some(unknown)) => {
                        assert_eq!(&func, unknown, "{}", v.description)
                    }
                    (other, _, _) => panic!("{}: unexpected {other:?}", v.description),
                }
            }
            (None, Some(err)) => {
                let e = routed.expect_err(&v.description);
                assert_eq!(e.code().as_str(), err.code, "{}", v.description);
            }
            _ => panic!("{}: exactly one of expect/expect_error", v.description),
        }
    }
}

#[test]
fn unknown_func_keeps_raw_payload() {
    let frame = br#"{"schema_version":1,"func":"agent-upgrade","payload":{"to":"9.9"}}"#;
    match DispatchTable::core().route(frame).unwrap() {
        Routed::Unknown { func, payload } => {
            assert_eq!(func, "agent-upgrade");
            assert_eq!(payload, r#"{"to":"9.9"}"#);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn tables_are_scoped() {
    assert_eq!(
        DispatchTable::core().funcs(),
        vec!["agent-policies", "agent-reset", "agent-stop", "group-membership"]
    );
    assert_eq!(
        DispatchTable::group().funcs(),
        vec!["agent-policies", "dataset-removed", "group-removed"]
    );
}
