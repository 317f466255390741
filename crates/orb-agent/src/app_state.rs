//! Shared state for the ops HTTP surface.
//!
//! Read-only handles onto the long-lived parts of an [`AgentSession`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::groups::GroupRegistry;
use crate::lifecycle::{LifecycleController, SessionState};
use crate::obs::AgentMetrics;
use crate::policy::PolicyManager;
use crate::session::AgentSession;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    agent_id: String,
    started_at: DateTime<Utc>,
    groups: Arc<GroupRegistry>,
    lifecycle: Arc<LifecycleController>,
    session_state: watch::Receiver<SessionState>,
    metrics: Arc<AgentMetrics>,
    policies: Arc<dyn PolicyManager>,
}

impl AppState {
    pub fn new(agent_id: impl Into<String>, session: &AgentSession) -> Self {
        let lifecycle = session.lifecycle();
        let session_state = lifecycle.watch();
        Self {
            inner: Arc::new(AppStateInner {
                agent_id: agent_id.into(),
                started_at: Utc::now(),
                groups: session.groups(),
                lifecycle,
                session_state,
                metrics: session.metrics(),
                policies: session.policy_manager(),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.inner.groups
    }

    /// Latest published session state.
    pub fn session_state(&self) -> SessionState {
        *self.inner.session_state.borrow()
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.inner.lifecycle
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.inner.metrics
    }

    pub fn policies(&self) -> &dyn PolicyManager {
        self.inner.policies.as_ref()
    }
}
