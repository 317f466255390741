//! Shared error type across orb agent crates.

use thiserror::Error;

/// Stable error codes (metric labels, log fields, test assertions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Envelope or payload could not be decoded.
    Malformed,
    /// Envelope carried a schema version we do not speak.
    UnsupportedVersion,
    /// Transport rejected or failed an operation.
    Transport,
    /// Could not establish the transport session.
    Connection,
    /// An acknowledgement did not arrive in time.
    Timeout,
    /// Policy manager failure.
    Policy,
    /// Invalid configuration.
    Config,
    /// Illegal session state transition.
    Lifecycle,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// String representation used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Malformed => "MALFORMED",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::Transport => "TRANSPORT",
            ErrorCode::Connection => "CONNECTION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Policy => "POLICY",
            ErrorCode::Config => "CONFIG",
            ErrorCode::Lifecycle => "LIFECYCLE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Unified error type used by core and agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("malformed rpc: {0}")]
    Malformed(String),
    #[error("unsupported rpc schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("transport: {0}")]
    Transport(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("policy: {0}")]
    Policy(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("illegal transition from {from} on {event}")]
    Lifecycle { from: String, event: String },
    #[error("internal: {0}")]
    Internal(String),
}

impl AgentError {
    /// Map to a stable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Malformed(_) => ErrorCode::Malformed,
            AgentError::UnsupportedVersion { .. } => ErrorCode::UnsupportedVersion,
            AgentError::Transport(_) => ErrorCode::Transport,
            AgentError::Connection(_) => ErrorCode::Connection,
            AgentError::Timeout(_) => ErrorCode::Timeout,
            AgentError::Policy(_) => ErrorCode::Policy,
            AgentError::Config(_) => ErrorCode::Config,
            AgentError::Lifecycle { .. } => ErrorCode::Lifecycle,
            AgentError::Internal(_) => ErrorCode::Internal,
        }
    }
}
