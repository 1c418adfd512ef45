//! The access gate.
//!
//! Both the query and ingestion paths funnel privilege decisions through
//! here. A request touching a privileged kind (or hitting a relay that
//! mandates auth) must come from an authenticated session whose key is a
//! party to the data it asks for; the same party rule is applied again,
//! independently, to every privileged event before it is handed to a
//! client.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_proto::{Event, Filter};

use crate::acl::{AccessList, Role};
use crate::config::RelayConfig;
use crate::error::Rejection;
use crate::session::{unix_now, Session};

pub struct AccessGate {
    config: Arc<RelayConfig>,
    acl: Arc<AccessList>,
}

impl AccessGate {
    pub fn new(config: Arc<RelayConfig>, acl: Arc<AccessList>) -> Self {
        AccessGate { config, acl }
    }

    /// Whether policy demands auth before serving any request.
    pub fn auth_mandatory(&self) -> bool {
        self.config.auth_mandatory()
    }

    fn privileged_kind(&self, kind: u16) -> bool {
        self.config.privileged_kinds.contains(&kind)
    }

    fn ip_allowlisted(&self, session: &Session) -> bool {
        self.config.allowed_ips.contains(&session.remote.ip())
    }

    fn role_of(&self, pubkey: &str) -> Option<Role> {
        self.acl.role_of(pubkey, unix_now())
    }

    /// Screen one query filter. Blocks only the calling task: a privileged
    /// filter from an unauthenticated session triggers a challenge and then
    /// waits for the auth signal, the request's cancellation, or `wait`.
    pub async fn screen_filter(
        &self,
        session: &Session,
        filter: &Filter,
        cancel: &CancellationToken,
        wait: Duration,
    ) -> Result<(), Rejection> {
        let privileged = filter.touches_kinds(&self.config.privileged_kinds);
        let needs_auth = privileged || self.auth_mandatory() || !self.config.public;

        if needs_auth && session.authed_pubkey().is_none() {
            session.issue_challenge();
            tokio::select! {
                _ = session.authenticated() => {}
                _ = cancel.cancelled() => {
                    return Err(Rejection::auth_required("request canceled"));
                }
                _ = tokio::time::sleep(wait) => {
                    debug!(conn = %session.id, "auth wait timed out");
                    return Err(Rejection::auth_required("authentication timed out"));
                }
            }
        }

        if let Some(pubkey) = session.authed_pubkey() {
            match self.role_of(pubkey) {
                Some(Role::Owner) => return Ok(()),
                Some(Role::Denied) => {
                    return Err(Rejection::restricted("access denied"));
                }
                Some(_) => {}
                None if !self.config.public => {
                    return Err(Rejection::restricted("no access role on this relay"));
                }
                None => {}
            }
        }

        if !privileged {
            return Ok(());
        }
        if self.ip_allowlisted(session) {
            return Ok(());
        }

        // the session is authenticated here: privileged implies needs_auth
        let viewer = session.authed_pubkey().unwrap_or_default();
        if filter.parties().contains(&viewer) {
            Ok(())
        } else {
            Err(Rejection::restricted(
                "privileged kinds may only be queried by their parties",
            ))
        }
    }

    /// Screen an event publication. Runs after the signature check, so the
    /// author key is trustworthy; the question is what this session may do.
    pub fn screen_publish(&self, session: &Session, event: &Event) -> Result<(), Rejection> {
        match session.authed_pubkey() {
            Some(pubkey) => match self.role_of(pubkey) {
                Some(Role::Owner) => return Ok(()),
                Some(role) if !role.can_write() => {
                    return Err(Rejection::restricted("role cannot publish"));
                }
                Some(_) => {}
                None if !self.config.public => {
                    return Err(Rejection::restricted("no access role on this relay"));
                }
                None => {}
            },
            None if !self.config.public => {
                return Err(Rejection::auth_required(
                    "publishing on this relay requires authentication",
                ));
            }
            None => {}
        }

        if self.privileged_kind(event.kind) {
            let Some(pubkey) = session.authed_pubkey() else {
                return Err(Rejection::auth_required(
                    "publishing privileged events requires authentication",
                ));
            };
            if !event.parties().contains(&pubkey) {
                return Err(Rejection::restricted(
                    "privileged events may only be published by their parties",
                ));
            }
        }
        Ok(())
    }

    /// The per-event visibility rule. A privileged event is shown only to
    /// a viewer who is its author or a tagged recipient; everything else is
    /// visible to anyone the request screen already admitted.
    pub fn visible_to(&self, viewer: Option<&str>, event: &Event) -> bool {
        if !self.privileged_kind(event.kind) {
            return true;
        }
        match viewer {
            Some(v) => event.parties().contains(&v),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_proto::{generate_secret_key, public_key_hex, EventTemplate};
    use tokio::sync::mpsc;

    fn gate(config: RelayConfig) -> AccessGate {
        let acl = Arc::new(AccessList::new());
        acl.seed_owners(["f".repeat(64)], unix_now());
        AccessGate::new(Arc::new(config), acl)
    }

    fn session() -> Arc<Session> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx); // keep the queue alive; tests inspect nothing
        Arc::new(Session::new(
            "127.0.0.1:9000".parse().unwrap(),
            tx,
            CancellationToken::new(),
        ))
    }

    fn dm(author_sk: &[u8; 32], recipient: &str) -> Event {
        EventTemplate {
            created_at: unix_now(),
            kind: 4,
            tags: vec![vec!["p".to_string(), recipient.to_string()]],
            content: "psst".to_string(),
        }
        .sign(author_sk)
        .unwrap()
    }

    #[tokio::test]
    async fn plain_filters_pass_without_auth_on_an_open_relay() {
        let gate = gate(RelayConfig::default());
        let s = session();
        let filter = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        gate.screen_filter(&s, &filter, &CancellationToken::new(), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn privileged_filter_times_out_without_auth() {
        let gate = gate(RelayConfig::default());
        let s = session();
        let filter = Filter {
            kinds: Some(vec![4]),
            ..Default::default()
        };
        let err = gate
            .screen_filter(&s, &filter, &CancellationToken::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.needs_auth());
    }

    #[tokio::test]
    async fn privileged_filter_requires_party_membership() {
        let gate = gate(RelayConfig::default());
        let s = session();
        let me = public_key_hex(&generate_secret_key()).unwrap();
        s.set_authenticated(&me);

        let mine = Filter {
            kinds: Some(vec![4]),
            authors: Some(vec![me.clone()]),
            ..Default::default()
        };
        gate.screen_filter(&s, &mine, &CancellationToken::new(), Duration::from_millis(50))
            .await
            .unwrap();

        let theirs = Filter {
            kinds: Some(vec![4]),
            authors: Some(vec!["a".repeat(64)]),
            ..Default::default()
        };
        let err = gate
            .screen_filter(&s, &theirs, &CancellationToken::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.reason.starts_with("restricted:"));
    }

    #[tokio::test]
    async fn owners_bypass_the_party_check() {
        let gate = gate(RelayConfig::default());
        let s = session();
        s.set_authenticated(&"f".repeat(64));

        let theirs = Filter {
            kinds: Some(vec![4]),
            authors: Some(vec!["a".repeat(64)]),
            ..Default::default()
        };
        gate.screen_filter(&s, &theirs, &CancellationToken::new(), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn allowlisted_ip_bypasses_the_party_check() {
        let config = RelayConfig {
            allowed_ips: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        };
        let gate = gate(config);
        let s = session();
        s.set_authenticated(&public_key_hex(&generate_secret_key()).unwrap());

        let theirs = Filter {
            kinds: Some(vec![4]),
            authors: Some(vec!["a".repeat(64)]),
            ..Default::default()
        };
        gate.screen_filter(&s, &theirs, &CancellationToken::new(), Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[test]
    fn visibility_is_author_or_recipient_only() {
        let gate = gate(RelayConfig::default());
        let sk = generate_secret_key();
        let author = public_key_hex(&sk).unwrap();
        let recipient = "b".repeat(64);
        let event = dm(&sk, &recipient);

        assert!(gate.visible_to(Some(&author), &event));
        assert!(gate.visible_to(Some(&recipient), &event));
        assert!(!gate.visible_to(Some(&"c".repeat(64)), &event));
        assert!(!gate.visible_to(None, &event));
    }

    #[test]
    fn ordinary_events_are_visible_to_everyone() {
        let gate = gate(RelayConfig::default());
        let event = EventTemplate {
            created_at: unix_now(),
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
        }
        .sign(&generate_secret_key())
        .unwrap();
        assert!(gate.visible_to(None, &event));
    }

    #[test]
    fn denied_role_cannot_publish() {
        let acl = Arc::new(AccessList::new());
        acl.upsert(&"d".repeat(64), Role::Denied, None, unix_now())
            .unwrap();
        let gate = AccessGate::new(Arc::new(RelayConfig::default()), acl);
        let s = session();
        s.set_authenticated(&"d".repeat(64));

        let event = EventTemplate {
            created_at: unix_now(),
            kind: 1,
            tags: vec![],
            content: "spam".to_string(),
        }
        .sign(&generate_secret_key())
        .unwrap();
        let err = gate.screen_publish(&s, &event).unwrap_err();
        assert!(err.reason.starts_with("restricted:"));
    }
}
