//! Wire protocol for the relay.
//!
//! This crate is transport-agnostic: it defines the signed event format,
//! query filters, the JSON envelope codec spoken over a socket, and the
//! challenge/response authentication handshake. The engine crate builds the
//! session, storage and broadcast machinery on top of these types.

pub mod auth;
pub mod envelope;
pub mod error;
pub mod event;
pub mod filter;

pub use auth::{generate_challenge, normalize_relay_url, validate_auth_event, AuthError};
pub use envelope::{reason, ClientEnvelope, RelayEnvelope, MAX_SUBSCRIPTION_ID_LEN};
pub use error::{EnvelopeError, ProtoError};
pub use event::{
    classify_kind, generate_secret_key, public_key_hex, Event, EventTemplate, KindClass,
    DEFAULT_PRIVILEGED_KINDS, KIND_CLIENT_AUTH, KIND_DELETION,
};
pub use filter::Filter;
