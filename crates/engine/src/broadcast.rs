//! Broadcast fan-out.
//!
//! Runs on whichever task completed an event's ingestion, walking the
//! registry without any connection-wide lock. Per-session delivery order
//! follows ingestion completion order because frames go through each
//! session's serialized writer; there is no ordering across sessions.

use tracing::trace;

use relay_proto::{Event, RelayEnvelope};

use crate::server::Relay;

/// Offer a freshly ingested event to every live subscription.
pub fn broadcast(relay: &Relay, event: &Event) {
    let auth_mandatory = relay.gate().auth_mandatory();

    for entry in relay.registry.conns.iter() {
        let session = &entry.session;
        let viewer = session.authed_pubkey();
        if auth_mandatory && viewer.is_none() {
            continue;
        }
        if !relay.gate().visible_to(viewer, event) {
            continue;
        }
        for sub in entry.subs.iter() {
            if sub.cancel.is_cancelled() {
                continue;
            }
            if !sub.filters.iter().any(|f| f.matches(event)) {
                continue;
            }
            trace!(conn = %session.id, sub = %sub.key(), event = %event.id, "broadcast match");
            session.send(RelayEnvelope::Event {
                sub_id: sub.key().clone(),
                event: event.clone(),
            });
        }
    }
}
