//! Error kinds surfaced by the coordination core.
//!
//! A plain enum with a hand-written `Display` and `Error` impl, no
//! derive-macro error crate.

use std::error::Error;
use std::fmt;

/// Error kinds returned by public operations across the crate.
///
/// Optional-path errors (embedding, categorizer, event-bus fan-out) are
/// logged and swallowed by the component that encounters them — callers only
/// ever see a `CoreError` on a critical path (pattern dispatch, store write,
/// a non-isolated hook).
#[derive(Debug, Clone)]
pub enum CoreError {
    /// Malformed task, unknown pattern, missing required agent metadata.
    InvalidInput(String),
    /// Orchestration id, agent name, or similar lookup key not found.
    NotFound(String),
    /// A blocking operation exceeded its deadline.
    Timeout(String),
    /// A cancellation token fired before the operation completed.
    Cancelled(String),
    /// An `AgentDriver::invoke` call failed (after retries, if any).
    AgentFailure(String),
    /// `PersistentStore` is in a degraded state.
    StoreUnavailable(String),
    /// The embedding circuit breaker is open.
    EmbeddingUnavailable(String),
    /// Categorization failed structurally; callers should use the rule fallback.
    CategorizerFailed(String),
    /// A hard cost ceiling (`cost.enforce = true`) was hit.
    BudgetExceeded(String),
    /// I/O, (de)serialization, or other unclassified failure.
    Internal(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidInput(m) => write!(f, "invalid input: {}", m),
            CoreError::NotFound(m) => write!(f, "not found: {}", m),
            CoreError::Timeout(m) => write!(f, "timed out: {}", m),
            CoreError::Cancelled(m) => write!(f, "cancelled: {}", m),
            CoreError::AgentFailure(m) => write!(f, "agent failure: {}", m),
            CoreError::StoreUnavailable(m) => write!(f, "store unavailable: {}", m),
            CoreError::EmbeddingUnavailable(m) => write!(f, "embedding unavailable: {}", m),
            CoreError::CategorizerFailed(m) => write!(f, "categorizer failed: {}", m),
            CoreError::BudgetExceeded(m) => write!(f, "budget exceeded: {}", m),
            CoreError::Internal(m) => write!(f, "internal error: {}", m),
        }
    }
}

impl Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

/// Convenience alias used throughout the crate's public API.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_kind() {
        let err = CoreError::NotFound("orch-123".into());
        assert_eq!(err.to_string(), "not found: orch-123");
    }
}
