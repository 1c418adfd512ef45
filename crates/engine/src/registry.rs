//! The subscription registry.
//!
//! A two-level sharded map: connection → (subscription id → subscription).
//! Broadcast iterates all entries while other tasks add and remove them;
//! `DashMap` gives that without a global lock. Removal cancels the
//! subscription's token, which cascades to any streaming tasks it owns.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_proto::Filter;

use crate::session::{ConnId, Session};

/// One live query: its filters and the handle that stops it.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub filters: Vec<Filter>,
    pub cancel: CancellationToken,
}

/// A connection's registry slot.
#[derive(Debug)]
pub struct ConnEntry {
    pub session: Arc<Session>,
    pub subs: DashMap<String, Subscription>,
}

/// All live connections and their subscriptions.
#[derive(Debug, Default)]
pub struct Registry {
    pub(crate) conns: DashMap<ConnId, ConnEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Called once per socket, before any traffic.
    pub fn register(&self, session: Arc<Session>) {
        self.conns.insert(
            session.id,
            ConnEntry {
                session,
                subs: DashMap::new(),
            },
        );
    }

    /// Remove a connection and cancel everything it owns.
    pub fn unregister(&self, conn: ConnId) {
        if let Some((_, entry)) = self.conns.remove(&conn) {
            for sub in entry.subs.iter() {
                sub.cancel.cancel();
            }
            entry.session.cancel.cancel();
            debug!(conn = %conn, "connection unregistered");
        }
    }

    /// Install or replace a subscription. A replaced subscription's token
    /// is canceled so its in-flight query stops streaming.
    pub fn set_subscription(
        &self,
        conn: ConnId,
        sub_id: &str,
        filters: Vec<Filter>,
        cancel: CancellationToken,
    ) {
        if let Some(entry) = self.conns.get(&conn) {
            let replaced = entry
                .subs
                .insert(sub_id.to_string(), Subscription { filters, cancel });
            if let Some(old) = replaced {
                old.cancel.cancel();
            }
        }
    }

    /// Remove one subscription, canceling its token. Unknown ids are a
    /// no-op; a CLOSE may race teardown.
    pub fn remove_subscription(&self, conn: ConnId, sub_id: &str) {
        if let Some(entry) = self.conns.get(&conn) {
            if let Some((_, sub)) = entry.subs.remove(sub_id) {
                sub.cancel.cancel();
            }
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Number of live subscriptions across all connections.
    pub fn subscription_count(&self) -> usize {
        self.conns.iter().map(|e| e.subs.len()).sum()
    }
}
