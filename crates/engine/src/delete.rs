//! The deletion handler.
//!
//! A deletion event names its targets through `e` tags. For each target:
//! absent events are skipped, the deleting author must match the target's
//! author, and every registered override must also agree (logical AND).
//! The first rejected target aborts the whole deletion event.

use tracing::{debug, warn};

use relay_proto::Event;

use crate::error::Rejection;
use crate::server::Relay;

pub(crate) async fn handle_deletion(relay: &Relay, deletion: &Event) -> Result<(), Rejection> {
    for target_id in deletion.tag_values("e") {
        let Some(target) = find_event(relay, target_id).await else {
            continue;
        };

        if target.pubkey != deletion.pubkey {
            return Err(Rejection::blocked(
                "deletion author does not match the target's author",
            ));
        }
        for policy in &relay.hooks.override_deletion {
            if !policy.allow(deletion, &target) {
                return Err(Rejection::blocked("deletion vetoed by relay policy"));
            }
        }

        for store in &relay.stores {
            if let Err(e) = store.delete(&target.id).await {
                warn!(event = %target.id, error = %e, "failed to delete event");
            }
        }
        debug!(event = %target.id, by = %deletion.pubkey, "event deleted");
    }
    Ok(())
}

async fn find_event(relay: &Relay, event_id: &str) -> Option<Event> {
    let filter = relay_proto::Filter {
        ids: Some(vec![event_id.to_string()]),
        limit: Some(1),
        ..Default::default()
    };
    for store in &relay.stores {
        match store.query(&filter).await {
            Ok(mut rx) => {
                if let Some(event) = rx.recv().await {
                    return Some(event);
                }
            }
            Err(e) => {
                warn!(event = %event_id, error = %e, "deletion lookup failed");
            }
        }
    }
    None
}
