//! Extension points.
//!
//! The surrounding application customizes the relay through ordered hook
//! chains. Evaluation order is registration order and is part of the
//! contract: the first rejecting policy wins, rewrites compose left to
//! right, and observers run for their side effects only.

use std::sync::Arc;

use async_trait::async_trait;

use relay_proto::{Event, Filter};

use crate::session::Session;

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Reject with a human-readable reason; the caller adds the prefix.
    Reject(String),
}

/// Accept or reject an event before storage. `authed` is the publishing
/// session's proven identity, if any.
#[async_trait]
pub trait EventPolicy: Send + Sync {
    async fn evaluate(&self, authed: Option<&str>, event: &Event) -> PolicyDecision;
}

/// Accept or reject a query filter. Also used for count requests.
#[async_trait]
pub trait FilterPolicy: Send + Sync {
    async fn evaluate(&self, authed: Option<&str>, filter: &Filter) -> PolicyDecision;
}

/// Rewrite a filter before it is screened and executed.
pub trait FilterRewrite: Send + Sync {
    fn rewrite(&self, authed: Option<&str>, filter: &mut Filter);
}

/// Rewrite the event that will be broadcast and acknowledged, without
/// touching what was persisted.
pub trait EventRewrite: Send + Sync {
    fn rewrite(&self, event: &mut Event);
}

/// Additional veto over a deletion. Combined with AND: the default
/// same-author rule and every registered override must all pass.
pub trait DeletionOverride: Send + Sync {
    fn allow(&self, deletion: &Event, target: &Event) -> bool;
}

/// Side effects after an event is durably stored. Failures are the
/// observer's own problem; the pipeline never surfaces them.
pub trait EventObserver: Send + Sync {
    fn on_saved(&self, event: &Event);
}

/// Connection lifecycle notifications.
pub trait ConnectionHook: Send + Sync {
    fn on_connect(&self, session: &Session) {
        let _ = session;
    }
    fn on_disconnect(&self, session: &Session) {
        let _ = session;
    }
}

/// All hook chains, in registration order.
#[derive(Default)]
pub struct Hooks {
    pub reject_event: Vec<Arc<dyn EventPolicy>>,
    pub reject_filter: Vec<Arc<dyn FilterPolicy>>,
    pub reject_count_filter: Vec<Arc<dyn FilterPolicy>>,
    pub overwrite_filter: Vec<Arc<dyn FilterRewrite>>,
    pub overwrite_count_filter: Vec<Arc<dyn FilterRewrite>>,
    pub overwrite_response: Vec<Arc<dyn EventRewrite>>,
    pub override_deletion: Vec<Arc<dyn DeletionOverride>>,
    pub on_saved: Vec<Arc<dyn EventObserver>>,
    pub connection: Vec<Arc<dyn ConnectionHook>>,
}

impl Hooks {
    /// First rejection wins.
    pub(crate) async fn screen_event(
        &self,
        authed: Option<&str>,
        event: &Event,
    ) -> PolicyDecision {
        for policy in &self.reject_event {
            if let PolicyDecision::Reject(msg) = policy.evaluate(authed, event).await {
                return PolicyDecision::Reject(msg);
            }
        }
        PolicyDecision::Allow
    }

    pub(crate) async fn screen_filter(
        &self,
        chain: &[Arc<dyn FilterPolicy>],
        authed: Option<&str>,
        filter: &Filter,
    ) -> PolicyDecision {
        for policy in chain {
            if let PolicyDecision::Reject(msg) = policy.evaluate(authed, filter).await {
                return PolicyDecision::Reject(msg);
            }
        }
        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectKind(u16, &'static str);

    #[async_trait]
    impl EventPolicy for RejectKind {
        async fn evaluate(&self, _authed: Option<&str>, event: &Event) -> PolicyDecision {
            if event.kind == self.0 {
                PolicyDecision::Reject(self.1.to_string())
            } else {
                PolicyDecision::Allow
            }
        }
    }

    #[tokio::test]
    async fn first_rejection_wins() {
        let mut hooks = Hooks::default();
        hooks.reject_event.push(Arc::new(RejectKind(7, "first")));
        hooks.reject_event.push(Arc::new(RejectKind(7, "second")));

        let event = relay_proto::EventTemplate {
            created_at: 1_700_000_000,
            kind: 7,
            tags: vec![],
            content: String::new(),
        }
        .sign(&relay_proto::generate_secret_key())
        .unwrap();

        assert_eq!(
            hooks.screen_event(None, &event).await,
            PolicyDecision::Reject("first".to_string())
        );
    }
}
