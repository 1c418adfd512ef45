//! Per-connection session state.
//!
//! One `Session` exists per open socket. It carries the outstanding auth
//! challenge, the write-once authenticated key with its single-fire wake
//! signal, the malformed-message offense counter, and the outbound queue
//! drained by the connection's single writer task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_proto::{generate_challenge, RelayEnvelope};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Identifies one connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One item on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Envelope(RelayEnvelope),
    Ping,
    Pong(Vec<u8>),
}

/// Write-once authenticated identity with a broadcast wake.
///
/// Multiple tasks can wait for authentication; setting the key wakes all of
/// them exactly once, and later waiters observe the flag without blocking.
#[derive(Debug, Default)]
struct AuthState {
    pubkey: OnceLock<String>,
    signal: Notify,
}

/// Per-socket state. Shared as `Arc<Session>` between the read task, the
/// writer task, broadcast, and any in-flight request tasks.
#[derive(Debug)]
pub struct Session {
    pub id: ConnId,
    pub remote: SocketAddr,
    /// Connection root token; canceling it cascades to every subscription.
    pub cancel: CancellationToken,
    challenge: Mutex<String>,
    auth: AuthState,
    offenses: AtomicU32,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    pub fn new(
        remote: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Session {
            id: ConnId::next(),
            remote,
            cancel,
            challenge: Mutex::new(generate_challenge()),
            auth: AuthState::default(),
            offenses: AtomicU32::new(0),
            outbound,
        }
    }

    /// The outstanding challenge.
    pub fn challenge(&self) -> String {
        self.challenge.lock().unwrap().clone()
    }

    /// Replace the challenge, invalidating any previous one.
    pub fn rotate_challenge(&self) -> String {
        let fresh = generate_challenge();
        *self.challenge.lock().unwrap() = fresh.clone();
        fresh
    }

    /// The proven identity, if the session has authenticated.
    pub fn authed_pubkey(&self) -> Option<&str> {
        self.auth.pubkey.get().map(String::as_str)
    }

    /// Record a successful auth handshake. The identity is write-once:
    /// repeating the same key is a no-op, a different key is ignored.
    /// Returns whether `pubkey` is now the session identity.
    pub fn set_authenticated(&self, pubkey: &str) -> bool {
        let _ = self.auth.pubkey.set(pubkey.to_string());
        let accepted = self.authed_pubkey() == Some(pubkey);
        if accepted {
            self.auth.signal.notify_waiters();
        }
        accepted
    }

    /// Wait until the session is authenticated. Returns immediately if it
    /// already is. The notified future is created before the flag check so
    /// a wake between the two is never lost.
    pub async fn authenticated(&self) {
        loop {
            let notified = self.auth.signal.notified();
            if self.auth.pubkey.get().is_some() {
                return;
            }
            notified.await;
        }
    }

    /// Count one malformed message; returns the new total.
    pub fn record_offense(&self) -> u32 {
        let total = self.offenses.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(conn = %self.id, offenses = total, "malformed message");
        total
    }

    /// Whether the session has exhausted its offense budget and further
    /// messages should be dropped unprocessed. The budget itself is still
    /// processed; the drop starts once the counter exceeds it.
    pub fn muted(&self, max_offenses: u32) -> bool {
        self.offenses.load(Ordering::Relaxed) > max_offenses
    }

    /// Enqueue an envelope on the serialized writer. Returns false once the
    /// writer is gone; the connection is tearing down and the frame is lost.
    pub fn send(&self, envelope: RelayEnvelope) -> bool {
        self.outbound.send(Outbound::Envelope(envelope)).is_ok()
    }

    pub fn send_raw(&self, item: Outbound) -> bool {
        self.outbound.send(item).is_ok()
    }

    /// Send the outstanding challenge to the client. Concurrent requests
    /// may each trigger this; re-sending rather than rotating keeps an
    /// in-flight auth response answerable.
    pub fn issue_challenge(&self) -> bool {
        self.send(RelayEnvelope::Auth {
            challenge: self.challenge(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_session() -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "127.0.0.1:9000".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (Arc::new(session), rx)
    }

    #[test]
    fn identity_is_write_once() {
        let (session, _rx) = test_session();
        assert!(session.authed_pubkey().is_none());

        assert!(session.set_authenticated("alice"));
        assert!(session.set_authenticated("alice"));
        assert!(!session.set_authenticated("mallory"));
        assert_eq!(session.authed_pubkey(), Some("alice"));
    }

    #[tokio::test]
    async fn auth_signal_wakes_every_waiter_once() {
        let (session, _rx) = test_session();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let s = session.clone();
            waiters.push(tokio::spawn(async move { s.authenticated().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.set_authenticated("alice");

        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter should wake")
                .unwrap();
        }

        // late waiter returns immediately
        tokio::time::timeout(Duration::from_millis(50), session.authenticated())
            .await
            .expect("already authenticated");
    }

    #[test]
    fn offense_budget_mutes_the_session_once_exceeded() {
        let (session, _rx) = test_session();
        assert!(!session.muted(3));
        for _ in 0..3 {
            session.record_offense();
        }
        // the third offense is within budget; the fourth crosses it
        assert!(!session.muted(3));
        session.record_offense();
        assert!(session.muted(3));
    }

    #[test]
    fn rotating_the_challenge_invalidates_the_old_one() {
        let (session, _rx) = test_session();
        let first = session.challenge();
        let second = session.rotate_challenge();
        assert_ne!(first, second);
        assert_eq!(session.challenge(), second);
    }

    #[test]
    fn repeated_challenges_stay_answerable() {
        let (session, mut rx) = test_session();
        session.issue_challenge();
        session.issue_challenge();

        let mut sent = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Envelope(RelayEnvelope::Auth { challenge }) => sent.push(challenge),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(session.challenge(), sent[0]);
    }

    #[test]
    fn enqueued_envelopes_preserve_order() {
        let (session, mut rx) = test_session();
        session.send(RelayEnvelope::Notice {
            message: "one".to_string(),
        });
        session.send(RelayEnvelope::Eose {
            sub_id: "two".to_string(),
        });

        match rx.try_recv().unwrap() {
            Outbound::Envelope(RelayEnvelope::Notice { message }) => assert_eq!(message, "one"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Outbound::Envelope(RelayEnvelope::Eose { sub_id }) => assert_eq!(sub_id, "two"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
