//! Agent session state machine and control requests.
//!
//! ```text
//! Disconnected -> Connecting -> HandshakeInFlight -> Synchronized -> Stopping -> Stopped
//!                     \______________\__________________\__> Degraded __/
//! ```
//!
//! Stop and reset RPCs do not act directly: they enqueue a [`ControlRequest`]
//! that the session loop consumes, so teardown always runs on the session's
//! own task and never inside a message handler.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use orb_agent_core::error::{AgentError, Result};

use crate::lock;

// resets kept for /status
const RESET_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeInFlight,
    Synchronized,
    Degraded,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::HandshakeInFlight => "handshake_in_flight",
            SessionState::Synchronized => "synchronized",
            SessionState::Degraded => "degraded",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopping | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    TransportConnected,
    /// Capabilities, membership request and policy request all enqueued.
    HandshakeComplete,
    /// Non-fatal subscribe/publish failure.
    Fault(String),
    /// Core resent its full view and we re-requested policies.
    Recovered,
    StopRequested(String),
    /// Transport closed and timers cancelled.
    Closed,
    Reset { full: bool, reason: String },
}

impl LifecycleEvent {
    fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Start => "start",
            LifecycleEvent::TransportConnected => "transport_connected",
            LifecycleEvent::HandshakeComplete => "handshake_complete",
            LifecycleEvent::Fault(_) => "fault",
            LifecycleEvent::Recovered => "recovered",
            LifecycleEvent::StopRequested(_) => "stop_requested",
            LifecycleEvent::Closed => "closed",
            LifecycleEvent::Reset { .. } => "reset",
        }
    }
}

/// Transition table. `None` means the event is illegal in `from`.
pub fn next_state(from: SessionState, event: &LifecycleEvent) -> Option<SessionState> {
    use LifecycleEvent as E;
    use SessionState as S;

    match (from, event) {
        (S::Disconnected, E::Start) => Some(S::Connecting),
        (S::Connecting, E::TransportConnected) => Some(S::HandshakeInFlight),
        (S::HandshakeInFlight, E::HandshakeComplete) => Some(S::Synchronized),
        // a fault raced the handshake; stay degraded until recovery
        (S::Degraded, E::HandshakeComplete) => Some(S::Degraded),
        (S::Connecting | S::HandshakeInFlight | S::Synchronized | S::Degraded, E::Fault(_)) => {
            Some(S::Degraded)
        }
        (S::Degraded, E::Recovered) => Some(S::Synchronized),
        (S::Synchronized, E::Recovered) => Some(S::Synchronized),
        (S::HandshakeInFlight | S::Synchronized | S::Degraded, E::StopRequested(_)) => {
            Some(S::Stopping)
        }
        (S::Stopping, E::Closed) => Some(S::Stopped),
        (s, E::Reset { .. }) if !s.is_terminal() => Some(S::Disconnected),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Stop { reason: String },
    Reset { full: bool, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetRecord {
    pub full: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

pub struct LifecycleController {
    state: watch::Sender<SessionState>,
    requests_tx: mpsc::UnboundedSender<ControlRequest>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlRequest>>,
    resets: Mutex<VecDeque<ResetRecord>>,
    last_fault: Mutex<Option<String>>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            state,
            requests_tx,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            resets: Mutex::new(VecDeque::new()),
            last_fault: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Apply an event. Illegal transitions leave the state untouched.
    pub fn fire(&self, event: LifecycleEvent) -> Result<SessionState> {
        let mut outcome = Err(AgentError::Internal("transition not evaluated".into()));
        self.state.send_if_modified(|current| {
            let from = *current;
            match next_state(from, &event) {
                Some(to) => {
                    *current = to;
                    outcome = Ok((from, to));
                    from != to
                }
                None => {
                    outcome = Err(AgentError::Lifecycle {
                        from: from.to_string(),
                        event: event.name().to_string(),
                    });
                    false
                }
            }
        });

        let (from, to) = outcome?;
        match &event {
            LifecycleEvent::Fault(reason) => {
                *lock(&self.last_fault) = Some(reason.clone());
                if from != to {
                    warn!(from = %from, reason = %reason, "session degraded");
                }
            }
            LifecycleEvent::Reset { full, reason } => {
                let mut resets = lock(&self.resets);
                if resets.len() == RESET_HISTORY {
                    resets.pop_front();
                }
                resets.push_back(ResetRecord {
                    full: *full,
                    reason: reason.clone(),
                    at: Utc::now(),
                });
                drop(resets);
                info!(from = %from, full_reset = *full, reason = %reason, "session reset");
            }
            LifecycleEvent::Recovered => {
                *lock(&self.last_fault) = None;
                if from != to {
                    info!("session recovered");
                }
            }
            _ => {
                if from != to {
                    info!(from = %from, to = %to, event = event.name(), "session state changed");
                }
            }
        }
        Ok(to)
    }

    /// Record a non-fatal failure. Ignored once the session is shutting down.
    pub fn degrade(&self, reason: impl Into<String>) {
        if let Err(e) = self.fire(LifecycleEvent::Fault(reason.into())) {
            debug!(error = %e, "fault ignored");
        }
    }

    pub fn recover(&self) {
        if self.state() == SessionState::Degraded {
            let _ = self.fire(LifecycleEvent::Recovered);
        }
    }

    pub fn last_fault(&self) -> Option<String> {
        lock(&self.last_fault).clone()
    }

    /// Most recent resets, oldest first.
    pub fn resets(&self) -> Vec<ResetRecord> {
        lock(&self.resets).iter().cloned().collect()
    }

    pub fn request_stop(&self, reason: impl Into<String>) {
        let _ = self.requests_tx.send(ControlRequest::Stop {
            reason: reason.into(),
        });
    }

    pub fn request_reset(&self, full: bool, reason: impl Into<String>) {
        let _ = self.requests_tx.send(ControlRequest::Reset {
            full,
            reason: reason.into(),
        });
    }

    /// Next pending control request. Only the session loop calls this.
    pub async fn next_request(&self) -> Option<ControlRequest> {
        self.requests_rx.lock().await.recv().await
    }
}
