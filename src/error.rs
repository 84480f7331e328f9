//! Error types for Synheart Coach

use std::time::Duration;

use thiserror::Error;

/// Failures of the remote reasoning path.
///
/// These never reach the presentation boundary; the arbiter converts every
/// one of them into a rule-based fallback decision. `Clone` because a single
/// in-flight call fans its result out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// No credential, provider misconfigured, transport failure or cancelled call
    #[error("Remote reasoning unavailable: {0}")]
    Unavailable(String),

    #[error("Remote reasoning timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed remote response: {0}")]
    MalformedResponse(String),
}

/// Errors surfaced by the outer API (parsing inputs, configuration, lifecycle)
#[derive(Debug, Error)]
pub enum CoachError {
    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session has already ended")]
    SessionEnded,

    #[error("Out-of-order tick {tick} (last published {last})")]
    OutOfOrderTick { tick: u64, last: u64 },

    #[error("Runtime error: {0}")]
    Runtime(String),
}
