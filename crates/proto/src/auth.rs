//! Connection authentication.
//!
//! The relay issues a random challenge when a connection needs to prove key
//! ownership. The client answers with a signed, ephemeral event of kind
//! [`KIND_CLIENT_AUTH`](crate::event::KIND_CLIENT_AUTH) carrying the
//! challenge and the relay's URL in its tags. Validation here is pure; the
//! session layer decides when a challenge is required and what an identity
//! is allowed to do.

use rand::RngCore;
use thiserror::Error;
use url::Url;

use crate::event::{Event, KIND_CLIENT_AUTH};

/// Maximum allowed clock skew, in seconds, between the auth event's
/// `created_at` and the relay's clock.
pub const MAX_TIME_DIFF: u64 = 600;

/// Why an auth event was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong kind: expected {KIND_CLIENT_AUTH}, got {0}")]
    WrongKind(u16),

    #[error("missing or unparseable relay tag")]
    MissingRelay,

    #[error("relay url mismatch: {0}")]
    RelayMismatch(String),

    #[error("missing challenge tag")]
    MissingChallenge,

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("timestamp outside the allowed window")]
    StaleTimestamp,

    #[error("signature verification failed")]
    BadSignature,
}

/// Generate a fresh 16-byte hex challenge.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Reduce a relay URL to a comparable form: ws and http schemes are
/// equivalent (clients see either, depending on proxying), the whole URL
/// is case-insensitive, and a trailing slash on the path is meaningless.
pub fn normalize_relay_url(raw: &str) -> Option<String> {
    let raw = raw.trim().to_lowercase();
    let url = Url::parse(&raw).ok()?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return None,
    };
    let host = url.host_str()?.to_lowercase();
    let mut normalized = format!("{}://{}", scheme, host);
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    let path = url.path().trim_end_matches('/');
    normalized.push_str(path);
    Some(normalized)
}

/// Validate an auth event against the outstanding challenge.
///
/// `now` is the relay's current unix time. On success the event's `pubkey`
/// is the proven identity.
pub fn validate_auth_event(
    event: &Event,
    challenge: &str,
    relay_url: &str,
    now: u64,
) -> Result<String, AuthError> {
    if event.kind != KIND_CLIENT_AUTH {
        return Err(AuthError::WrongKind(event.kind));
    }

    let claimed = event
        .first_tag_value("relay")
        .and_then(normalize_relay_url)
        .ok_or(AuthError::MissingRelay)?;
    let expected = normalize_relay_url(relay_url).ok_or(AuthError::MissingRelay)?;
    if claimed != expected {
        return Err(AuthError::RelayMismatch(claimed));
    }

    let answered = event
        .first_tag_value("challenge")
        .ok_or(AuthError::MissingChallenge)?;
    if answered != challenge {
        return Err(AuthError::ChallengeMismatch);
    }

    if event.created_at.abs_diff(now) > MAX_TIME_DIFF {
        return Err(AuthError::StaleTimestamp);
    }

    if !event.verify().map_err(|_| AuthError::BadSignature)? {
        return Err(AuthError::BadSignature);
    }

    Ok(event.pubkey.clone())
}
