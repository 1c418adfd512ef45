//! Error types for protocol-level operations.

use thiserror::Error;

/// Errors that can occur while handling events, keys and signatures.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Errors produced by the envelope codec.
///
/// `Malformed` marks structural failures that cannot be attributed to a
/// specific message variant: input that is not a JSON array, an empty array,
/// a non-string label, or an unknown label. Everything else is a
/// variant-specific validation failure and carries a client-presentable
/// description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid: {0}")]
    Invalid(String),
}

impl EnvelopeError {
    /// Whether this failure should count against the sender's offense budget.
    pub fn is_malformed(&self) -> bool {
        matches!(self, EnvelopeError::Malformed(_))
    }
}
