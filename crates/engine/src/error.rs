//! Engine error types and client-visible rejections.

use thiserror::Error;

use relay_proto::reason;

use crate::storage::StorageError;

/// Internal failures. Client-visible outcomes are [`Rejection`]s, not errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Proto(#[from] relay_proto::ProtoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A policy outcome presented to the client through an OK or CLOSED
/// envelope. The reason always carries a machine-readable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    fn prefixed(prefix: &str, msg: &str) -> Self {
        Rejection {
            reason: reason::normalize(prefix, msg),
        }
    }

    pub fn blocked(msg: &str) -> Self {
        Self::prefixed(reason::BLOCKED, msg)
    }

    pub fn invalid(msg: &str) -> Self {
        Self::prefixed(reason::INVALID, msg)
    }

    pub fn error(msg: &str) -> Self {
        Self::prefixed(reason::ERROR, msg)
    }

    pub fn restricted(msg: &str) -> Self {
        Self::prefixed(reason::RESTRICTED, msg)
    }

    pub fn auth_required(msg: &str) -> Self {
        Self::prefixed(reason::AUTH_REQUIRED, msg)
    }

    pub fn duplicate(msg: &str) -> Self {
        Self::prefixed(reason::DUPLICATE, msg)
    }

    /// Whether the client should be handed a fresh auth challenge.
    pub fn needs_auth(&self) -> bool {
        reason::has_prefix(&self.reason, reason::AUTH_REQUIRED)
    }

    /// Duplicates are idempotent successes, not failures.
    pub fn is_duplicate(&self) -> bool {
        reason::has_prefix(&self.reason, reason::DUPLICATE)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_carry_their_prefix() {
        assert_eq!(Rejection::blocked("spam").reason, "blocked: spam");
        assert_eq!(
            Rejection::invalid("bad signature").reason,
            "invalid: bad signature"
        );
        assert!(Rejection::auth_required("login first").needs_auth());
        assert!(Rejection::duplicate("already have it").is_duplicate());
        assert!(!Rejection::blocked("spam").is_duplicate());
    }

    #[test]
    fn existing_prefixes_are_not_doubled() {
        let r = Rejection::blocked("auth-required: login first");
        assert_eq!(r.reason, "auth-required: login first");
        assert!(r.needs_auth());
    }
}
