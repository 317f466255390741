//! Operational HTTP endpoints.
//!
//! - `/healthz` : liveness
//! - `/readyz`  : readiness (503 unless synchronized with core)
//! - `/metrics` : Prometheus text format
//! - `/status`  : session state, groups, policies and failures as JSON

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use orb_agent_core::protocol::outbound::PolicyStateInfo;

use crate::app_state::AppState;
use crate::groups::{GroupInfo, SubscriptionFailure};
use crate::lifecycle::{ResetRecord, SessionState};

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.session_state() {
        SessionState::Synchronized => (StatusCode::OK, "ready".to_string()),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics().render();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<String>,
    pub groups: BTreeMap<String, GroupInfo>,
    pub groups_in_flight: usize,
    pub subscription_failures: Vec<SubscriptionFailure>,
    pub policies: BTreeMap<String, PolicyStateInfo>,
    pub resets: Vec<ResetRecord>,
}

pub async fn status(State(state): State<AppState>) -> Json<StatusView> {
    let policies = state.policies().policies().await.unwrap_or_else(|e| {
        warn!(error = %e, "policy state unavailable");
        BTreeMap::new()
    });
    Json(StatusView {
        agent_id: state.agent_id().to_string(),
        started_at: state.started_at(),
        state: state.session_state(),
        last_fault: state.lifecycle().last_fault(),
        groups: state.groups().snapshot(),
        groups_in_flight: state.groups().in_flight(),
        subscription_failures: state.groups().failures(),
        policies,
        resets: state.lifecycle().resets(),
    })
}
