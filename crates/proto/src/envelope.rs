//! Wire envelope codec.
//!
//! Every message on the wire is a JSON array whose first element is a string
//! label. Client-to-relay and relay-to-client variants are distinct enums;
//! parsing distinguishes structural failures (not an array, unknown label)
//! from variant-specific validation failures (a REQ with no filters), since
//! only the former count against a connection's offense budget.

use serde_json::{json, Value};

use crate::error::EnvelopeError;
use crate::event::Event;
use crate::filter::Filter;

/// Machine-readable reason prefixes for OK/CLOSED messages.
pub mod reason {
    pub const DUPLICATE: &str = "duplicate";
    pub const BLOCKED: &str = "blocked";
    pub const INVALID: &str = "invalid";
    pub const ERROR: &str = "error";
    pub const RESTRICTED: &str = "restricted";
    pub const RATE_LIMITED: &str = "rate-limited";
    pub const POW: &str = "pow";
    pub const AUTH_REQUIRED: &str = "auth-required";

    const KNOWN: [&str; 8] = [
        DUPLICATE,
        BLOCKED,
        INVALID,
        ERROR,
        RESTRICTED,
        RATE_LIMITED,
        POW,
        AUTH_REQUIRED,
    ];

    /// Prefix `msg` with `prefix: ` unless it already carries a known prefix.
    pub fn normalize(prefix: &str, msg: &str) -> String {
        for known in KNOWN {
            if msg.starts_with(known) {
                return msg.to_string();
            }
        }
        format!("{}: {}", prefix, msg)
    }

    /// Whether a reason string carries the given prefix.
    pub fn has_prefix(reason: &str, prefix: &str) -> bool {
        reason.starts_with(prefix)
    }
}

/// Longest accepted subscription id.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// A message sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEnvelope {
    /// `["EVENT", event]` — publish
    Event(Event),
    /// `["REQ", sub_id, filter, ...]` — open or extend a live query
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", sub_id]`
    Close { sub_id: String },
    /// `["AUTH", signed_event]` — challenge response
    Auth(Event),
    /// `["COUNT", sub_id, filter, ...]`
    Count {
        sub_id: String,
        filters: Vec<Filter>,
    },
}

/// A message sent by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEnvelope {
    /// `["OK", event_id, accepted, reason]`
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// `["EVENT", sub_id, event]` — push to a subscription
    Event { sub_id: String, event: Event },
    /// `["EOSE", sub_id]` — end of stored events
    Eose { sub_id: String },
    /// `["CLOSED", sub_id, reason]`
    Closed { sub_id: String, reason: String },
    /// `["NOTICE", text]`
    Notice { message: String },
    /// `["AUTH", challenge]`
    Auth { challenge: String },
    /// `["COUNT", sub_id, {"count": n}]`
    Count { sub_id: String, count: u64 },
}

fn envelope_parts(value: &Value) -> Result<(&str, &[Value]), EnvelopeError> {
    let array = value
        .as_array()
        .ok_or_else(|| EnvelopeError::Malformed("message must be an array".to_string()))?;
    if array.is_empty() {
        return Err(EnvelopeError::Malformed("empty message".to_string()));
    }
    let label = array[0]
        .as_str()
        .ok_or_else(|| EnvelopeError::Malformed("label must be a string".to_string()))?;
    Ok((label, &array[1..]))
}

fn parse_sub_id(value: &Value) -> Result<String, EnvelopeError> {
    let id = value
        .as_str()
        .ok_or_else(|| EnvelopeError::Invalid("subscription id must be a string".to_string()))?;
    if id.is_empty() || id.len() > MAX_SUBSCRIPTION_ID_LEN {
        return Err(EnvelopeError::Invalid(format!(
            "subscription id must be 1-{} characters",
            MAX_SUBSCRIPTION_ID_LEN
        )));
    }
    Ok(id.to_string())
}

fn parse_event(value: &Value) -> Result<Event, EnvelopeError> {
    serde_json::from_value(value.clone())
        .map_err(|e| EnvelopeError::Invalid(format!("failed to parse event: {}", e)))
}

fn parse_filters(values: &[Value]) -> Result<Vec<Filter>, EnvelopeError> {
    values
        .iter()
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|e| EnvelopeError::Invalid(format!("failed to parse filter: {}", e)))
        })
        .collect()
}

impl ClientEnvelope {
    /// Parse one raw message.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| EnvelopeError::Malformed(format!("invalid json: {}", e)))?;
        Self::from_value(&value)
    }

    /// Parse an already-decoded JSON value.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let (label, rest) = envelope_parts(value)?;
        match label {
            "EVENT" => {
                if rest.len() != 1 {
                    return Err(EnvelopeError::Invalid(
                        "EVENT requires exactly one event object".to_string(),
                    ));
                }
                Ok(ClientEnvelope::Event(parse_event(&rest[0])?))
            }
            "REQ" => {
                if rest.is_empty() {
                    return Err(EnvelopeError::Invalid(
                        "REQ requires a subscription id".to_string(),
                    ));
                }
                let sub_id = parse_sub_id(&rest[0])?;
                if rest.len() < 2 {
                    return Err(EnvelopeError::Invalid(
                        "REQ requires at least one filter".to_string(),
                    ));
                }
                let filters = parse_filters(&rest[1..])?;
                Ok(ClientEnvelope::Req { sub_id, filters })
            }
            "CLOSE" => {
                if rest.len() != 1 {
                    return Err(EnvelopeError::Invalid(
                        "CLOSE requires exactly one subscription id".to_string(),
                    ));
                }
                Ok(ClientEnvelope::Close {
                    sub_id: parse_sub_id(&rest[0])?,
                })
            }
            "AUTH" => {
                if rest.len() != 1 {
                    return Err(EnvelopeError::Invalid(
                        "AUTH requires exactly one signed event".to_string(),
                    ));
                }
                Ok(ClientEnvelope::Auth(parse_event(&rest[0])?))
            }
            "COUNT" => {
                if rest.is_empty() {
                    return Err(EnvelopeError::Invalid(
                        "COUNT requires a subscription id".to_string(),
                    ));
                }
                let sub_id = parse_sub_id(&rest[0])?;
                if rest.len() < 2 {
                    return Err(EnvelopeError::Invalid(
                        "COUNT requires at least one filter".to_string(),
                    ));
                }
                let filters = parse_filters(&rest[1..])?;
                Ok(ClientEnvelope::Count { sub_id, filters })
            }
            other => Err(EnvelopeError::Malformed(format!(
                "unknown label: {}",
                other
            ))),
        }
    }

    /// Wire representation.
    pub fn to_value(&self) -> Value {
        match self {
            ClientEnvelope::Event(event) => json!(["EVENT", event]),
            ClientEnvelope::Req { sub_id, filters } => {
                let mut parts = vec![json!("REQ"), json!(sub_id)];
                parts.extend(filters.iter().map(|f| json!(f)));
                Value::Array(parts)
            }
            ClientEnvelope::Close { sub_id } => json!(["CLOSE", sub_id]),
            ClientEnvelope::Auth(event) => json!(["AUTH", event]),
            ClientEnvelope::Count { sub_id, filters } => {
                let mut parts = vec![json!("COUNT"), json!(sub_id)];
                parts.extend(filters.iter().map(|f| json!(f)));
                Value::Array(parts)
            }
        }
    }

    /// Wire bytes.
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

impl RelayEnvelope {
    /// Wire representation.
    pub fn to_value(&self) -> Value {
        match self {
            RelayEnvelope::Ok {
                event_id,
                accepted,
                reason,
            } => json!(["OK", event_id, accepted, reason]),
            RelayEnvelope::Event { sub_id, event } => json!(["EVENT", sub_id, event]),
            RelayEnvelope::Eose { sub_id } => json!(["EOSE", sub_id]),
            RelayEnvelope::Closed { sub_id, reason } => json!(["CLOSED", sub_id, reason]),
            RelayEnvelope::Notice { message } => json!(["NOTICE", message]),
            RelayEnvelope::Auth { challenge } => json!(["AUTH", challenge]),
            RelayEnvelope::Count { sub_id, count } => {
                json!(["COUNT", sub_id, { "count": count }])
            }
        }
    }

    /// Wire bytes.
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse one raw relay-side message. Used by clients and tests.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| EnvelopeError::Malformed(format!("invalid json: {}", e)))?;
        Self::from_value(&value)
    }

    /// Parse an already-decoded JSON value.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let (label, rest) = envelope_parts(value)?;
        match label {
            "OK" => {
                if rest.len() != 3 {
                    return Err(EnvelopeError::Invalid(
                        "OK requires an id, a flag and a reason".to_string(),
                    ));
                }
                let event_id = rest[0]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::Invalid("event id must be a string".to_string()))?
                    .to_string();
                let accepted = rest[1]
                    .as_bool()
                    .ok_or_else(|| EnvelopeError::Invalid("flag must be a boolean".to_string()))?;
                let reason = rest[2]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::Invalid("reason must be a string".to_string()))?
                    .to_string();
                Ok(RelayEnvelope::Ok {
                    event_id,
                    accepted,
                    reason,
                })
            }
            "EVENT" => {
                if rest.len() != 2 {
                    return Err(EnvelopeError::Invalid(
                        "EVENT push requires a subscription id and an event".to_string(),
                    ));
                }
                Ok(RelayEnvelope::Event {
                    sub_id: parse_sub_id(&rest[0])?,
                    event: parse_event(&rest[1])?,
                })
            }
            "EOSE" => {
                if rest.len() != 1 {
                    return Err(EnvelopeError::Invalid(
                        "EOSE requires exactly one subscription id".to_string(),
                    ));
                }
                Ok(RelayEnvelope::Eose {
                    sub_id: parse_sub_id(&rest[0])?,
                })
            }
            "CLOSED" => {
                if rest.len() != 2 {
                    return Err(EnvelopeError::Invalid(
                        "CLOSED requires a subscription id and a reason".to_string(),
                    ));
                }
                let reason = rest[1]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::Invalid("reason must be a string".to_string()))?
                    .to_string();
                Ok(RelayEnvelope::Closed {
                    sub_id: parse_sub_id(&rest[0])?,
                    reason,
                })
            }
            "NOTICE" => {
                if rest.len() != 1 {
                    return Err(EnvelopeError::Invalid(
                        "NOTICE requires exactly one message".to_string(),
                    ));
                }
                let message = rest[0]
                    .as_str()
                    .ok_or_else(|| EnvelopeError::Invalid("notice must be a string".to_string()))?
                    .to_string();
                Ok(RelayEnvelope::Notice { message })
            }
            "AUTH" => {
                if rest.len() != 1 {
                    return Err(EnvelopeError::Invalid(
                        "AUTH challenge requires exactly one string".to_string(),
                    ));
                }
                let challenge = rest[0]
                    .as_str()
                    .ok_or_else(|| {
                        EnvelopeError::Invalid("challenge must be a string".to_string())
                    })?
                    .to_string();
                Ok(RelayEnvelope::Auth { challenge })
            }
            "COUNT" => {
                if rest.len() != 2 {
                    return Err(EnvelopeError::Invalid(
                        "COUNT response requires a subscription id and a count".to_string(),
                    ));
                }
                let count = rest[1]
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        EnvelopeError::Invalid("count must be an object with a count".to_string())
                    })?;
                Ok(RelayEnvelope::Count {
                    sub_id: parse_sub_id(&rest[0])?,
                    count,
                })
            }
            other => Err(EnvelopeError::Malformed(format!(
                "unknown label: {}",
                other
            ))),
        }
    }
}
