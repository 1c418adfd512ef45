//! The query dispatcher.
//!
//! A REQ opens a subscription and replays stored history for it. Each
//! filter is rewritten, screened, and then streamed from every backend by
//! its own task; a counting latch tracks one unit per (filter × backend)
//! pair and the EOSE marker is emitted exactly once, when the last unit
//! completes. Any single rejection aborts the whole request with one
//! CLOSED envelope. COUNT requests share the screening path but answer
//! with a total instead of a stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_proto::{Event, Filter, RelayEnvelope};

use crate::error::Rejection;
use crate::hooks::PolicyDecision;
use crate::server::Relay;
use crate::session::Session;
use crate::storage::EventStore;

/// A counting latch: one unit per concurrent helper task, released at zero.
#[derive(Debug, Default)]
pub struct TaskCounter {
    count: AtomicUsize,
    notify: Notify,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, units: usize) {
        self.count.fetch_add(units, Ordering::SeqCst);
    }

    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait until every unit has completed. Returns immediately at zero.
    pub async fn wait_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn close(session: &Session, sub_id: &str, reason: &str, cancel: &CancellationToken) {
    cancel.cancel();
    session.send(RelayEnvelope::Closed {
        sub_id: sub_id.to_string(),
        reason: reason.to_string(),
    });
}

/// Handle one REQ envelope: screen, register, replay history, emit EOSE.
/// The subscription stays live afterwards until CLOSE or teardown.
pub async fn handle_req(
    relay: Arc<Relay>,
    session: Arc<Session>,
    sub_id: String,
    mut filters: Vec<Filter>,
) {
    let sub_token = session.cancel.child_token();
    let request_token = sub_token.child_token();
    let authed = session.authed_pubkey().map(str::to_string);

    for filter in &mut filters {
        for rewrite in &relay.hooks.overwrite_filter {
            rewrite.rewrite(authed.as_deref(), filter);
        }
    }

    for filter in &filters {
        if filter.limit.is_some_and(|l| l < 0) {
            close(&session, &sub_id, "blocked: filter invalidated", &request_token);
            return;
        }
        if let Err(rejection) = relay
            .gate()
            .screen_filter(&session, filter, &request_token, relay.config.filter_auth_wait)
            .await
        {
            close(&session, &sub_id, &rejection.reason, &request_token);
            return;
        }
        // the session may have authenticated during the screen
        let authed = session.authed_pubkey();
        if let PolicyDecision::Reject(msg) = relay
            .hooks
            .screen_filter(&relay.hooks.reject_filter, authed, filter)
            .await
        {
            close(&session, &sub_id, &Rejection::blocked(&msg).reason, &request_token);
            return;
        }
    }

    relay
        .registry
        .set_subscription(session.id, &sub_id, filters.clone(), sub_token.clone());
    debug!(conn = %session.id, sub = %sub_id, filters = filters.len(), "subscription opened");

    // all units are registered before any task can finish, so the latch
    // cannot reach zero early
    let counter = Arc::new(TaskCounter::new());
    counter.add(filters.len() * relay.stores.len());
    for filter in &filters {
        for store in &relay.stores {
            tokio::spawn(stream_stored(
                relay.clone(),
                session.clone(),
                sub_id.clone(),
                filter.clone(),
                store.clone(),
                request_token.clone(),
                counter.clone(),
            ));
        }
    }

    counter.wait_zero().await;
    request_token.cancel();
    if !sub_token.is_cancelled() {
        session.send(RelayEnvelope::Eose { sub_id });
    }
}

async fn stream_stored(
    relay: Arc<Relay>,
    session: Arc<Session>,
    sub_id: String,
    filter: Filter,
    store: Arc<dyn EventStore>,
    cancel: CancellationToken,
    counter: Arc<TaskCounter>,
) {
    match store.query(&filter).await {
        Ok(mut rx) => loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(event) => forward(&relay, &session, &sub_id, event),
                    None => break,
                },
            }
        },
        Err(e) => {
            warn!(conn = %session.id, sub = %sub_id, error = %e, "stored query failed");
        }
    }
    counter.done();
}

fn forward(relay: &Relay, session: &Session, sub_id: &str, event: Event) {
    if !relay.gate().visible_to(session.authed_pubkey(), &event) {
        return;
    }
    session.send(RelayEnvelope::Event {
        sub_id: sub_id.to_string(),
        event,
    });
}

/// Handle one COUNT envelope.
pub async fn handle_count(
    relay: Arc<Relay>,
    session: Arc<Session>,
    sub_id: String,
    mut filters: Vec<Filter>,
) {
    let cancel = session.cancel.child_token();
    let authed = session.authed_pubkey().map(str::to_string);

    for filter in &mut filters {
        for rewrite in &relay.hooks.overwrite_count_filter {
            rewrite.rewrite(authed.as_deref(), filter);
        }
    }

    for filter in &filters {
        if let Err(rejection) = relay
            .gate()
            .screen_filter(&session, filter, &cancel, relay.config.count_auth_wait)
            .await
        {
            close(&session, &sub_id, &rejection.reason, &cancel);
            return;
        }
        let authed = session.authed_pubkey();
        if let PolicyDecision::Reject(msg) = relay
            .hooks
            .screen_filter(&relay.hooks.reject_count_filter, authed, filter)
            .await
        {
            close(&session, &sub_id, &Rejection::blocked(&msg).reason, &cancel);
            return;
        }
    }

    if !relay.stores.iter().any(|s| s.supports_count()) {
        close(
            &session,
            &sub_id,
            &Rejection::error("counting is not supported").reason,
            &cancel,
        );
        return;
    }

    let mut total = 0u64;
    for filter in &filters {
        for store in relay.stores.iter().filter(|s| s.supports_count()) {
            match store.count(filter).await {
                Ok(n) => total += n,
                Err(e) => {
                    warn!(conn = %session.id, sub = %sub_id, error = %e, "count failed");
                    close(
                        &session,
                        &sub_id,
                        &Rejection::error("count failed").reason,
                        &cancel,
                    );
                    return;
                }
            }
        }
    }
    session.send(RelayEnvelope::Count {
        sub_id,
        count: total,
    });
}
