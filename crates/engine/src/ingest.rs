//! The event ingestion pipeline.
//!
//! Every published event walks the same stages in order: auth gate, age
//! gate, identity check, signature check, then either the deletion handler
//! or the policy/storage path, then response rewriting, broadcast, and the
//! OK acknowledgement. Each stage short-circuits to a rejection.

use std::sync::Arc;

use tracing::{debug, warn};

use relay_proto::{Event, KindClass, RelayEnvelope, KIND_DELETION};

use crate::broadcast;
use crate::delete;
use crate::error::Rejection;
use crate::hooks::PolicyDecision;
use crate::server::Relay;
use crate::session::Session;
use crate::storage::SaveOutcome;

/// Handle one EVENT envelope end to end, including the OK reply.
pub async fn handle_event(relay: Arc<Relay>, session: Arc<Session>, event: Event) {
    let event_id = event.id.clone();
    match ingest(&relay, &session, event).await {
        Ok(accepted) => {
            broadcast::broadcast(&relay, &accepted.event);
            session.send(RelayEnvelope::Ok {
                event_id,
                accepted: true,
                reason: accepted.reason,
            });
        }
        Err(rejection) => {
            debug!(conn = %session.id, event = %event_id, reason = %rejection, "event rejected");
            session.send(RelayEnvelope::Ok {
                event_id,
                accepted: false,
                reason: rejection.reason.clone(),
            });
            if rejection.needs_auth() {
                session.issue_challenge();
            }
        }
    }
}

/// A successful ingestion: the (possibly rewritten) event to broadcast and
/// the reason string for the OK envelope.
pub(crate) struct Accepted {
    pub event: Event,
    pub reason: String,
}

pub(crate) async fn ingest(
    relay: &Relay,
    session: &Session,
    mut event: Event,
) -> Result<Accepted, Rejection> {
    // 1. auth gate
    if relay.gate().auth_mandatory() && session.authed_pubkey().is_none() {
        return Err(Rejection::auth_required(
            "this relay requires authentication",
        ));
    }

    // 2. age gate
    if event.created_at <= relay.config.oldest_allowed {
        return Err(Rejection::invalid("event is too old for this relay"));
    }

    // 3. identity check
    let computed = event
        .compute_id()
        .map_err(|e| Rejection::invalid(&e.to_string()))?;
    if computed != event.id {
        return Err(Rejection::invalid(
            "id does not match the canonical serialization",
        ));
    }

    // 4. signature check
    let valid = event
        .verify()
        .map_err(|e| Rejection::invalid(&e.to_string()))?;
    if !valid {
        return Err(Rejection::invalid("signature verification failed"));
    }

    // 5. kind dispatch
    let mut reason = String::new();
    if event.kind == KIND_DELETION {
        delete::handle_deletion(relay, &event).await?;
    } else {
        relay.gate().screen_publish(session, &event)?;
        if let PolicyDecision::Reject(msg) = relay
            .hooks
            .screen_event(session.authed_pubkey(), &event)
            .await
        {
            return Err(Rejection::blocked(&msg));
        }
        if event.kind_class() != KindClass::Ephemeral {
            reason = store_event(relay, &event).await?;
        }
    }

    // 6. response overwrite; persisted copy is untouched
    for rewrite in &relay.hooks.overwrite_response {
        rewrite.rewrite(&mut event);
    }

    Ok(Accepted { event, reason })
}

/// Supersede older replaceable/addressable versions, then save to every
/// backend. Returns the OK reason ("" or a duplicate marker).
async fn store_event(relay: &Relay, event: &Event) -> Result<String, Rejection> {
    if supersede(relay, event).await? {
        return Ok(Rejection::duplicate("have a newer version").reason);
    }

    let mut duplicates = 0;
    for store in &relay.stores {
        match store.save(event).await {
            Ok(SaveOutcome::Saved) => {}
            Ok(SaveOutcome::Duplicate) => duplicates += 1,
            Err(e) => {
                warn!(event = %event.id, error = %e, "storage failure");
                return Err(Rejection::error("failed to store the event"));
            }
        }
    }
    if !relay.stores.is_empty() && duplicates == relay.stores.len() {
        return Ok(Rejection::duplicate("already have this event").reason);
    }

    for observer in &relay.hooks.on_saved {
        observer.on_saved(event);
    }
    Ok(String::new())
}

/// For replaceable and addressable kinds, delete strictly older stored
/// versions. Returns true when a stored version is at least as new, in
/// which case the incoming event is not saved.
async fn supersede(relay: &Relay, event: &Event) -> Result<bool, Rejection> {
    let mut filter = relay_proto::Filter {
        authors: Some(vec![event.pubkey.clone()]),
        kinds: Some(vec![event.kind]),
        ..Default::default()
    };
    match event.kind_class() {
        KindClass::Replaceable => {}
        KindClass::Addressable => {
            let d = event.first_tag_value("d").unwrap_or_default().to_string();
            filter.tags.insert("#d".to_string(), vec![d]);
        }
        _ => return Ok(false),
    }

    let mut superseded = false;
    for store in &relay.stores {
        let mut rx = store
            .query(&filter)
            .await
            .map_err(|_| Rejection::error("failed to query for older versions"))?;
        while let Some(previous) = rx.recv().await {
            if previous.id == event.id {
                continue;
            }
            if previous.created_at < event.created_at {
                if let Err(e) = store.delete(&previous.id).await {
                    warn!(event = %previous.id, error = %e, "failed to delete superseded event");
                }
            } else {
                superseded = true;
            }
        }
    }
    Ok(superseded)
}
