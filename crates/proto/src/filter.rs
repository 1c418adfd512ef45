//! Query filters.
//!
//! A filter is a predicate over events: every populated field must match
//! (logical AND). Requests carry one or more filters combined with logical
//! OR. Tag constraints are written as `"#<letter>": [values...]` on the wire
//! and an event satisfies one when any of its tags of that name carries one
//! of the listed values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A single query predicate. All populated fields combine with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    /// Exact event ids
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Exact author public keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events at or after this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events at or before this timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of results. Negative marks the filter as invalidated;
    /// an overwrite hook uses this to poison a filter it cannot fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    /// Free-text search over event content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag constraints, keyed by `#<tag name>`
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Check whether an event satisfies every populated field.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(ref authors) = self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        if let Some(ref search) = self.search {
            if !event
                .content
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let tag_name = match name.strip_prefix('#') {
                Some(n) => n,
                // non-tag leftovers from deserialization never match anything
                None => return false,
            };
            let satisfied = event
                .tag_values(tag_name)
                .any(|v| values.iter().any(|want| want == v));
            if !satisfied {
                return false;
            }
        }
        true
    }

    /// The parties this filter asks about: its authors plus `#p` recipients.
    pub fn parties(&self) -> Vec<&str> {
        let mut parties: Vec<&str> = self
            .authors
            .iter()
            .flatten()
            .map(|s| s.as_str())
            .collect();
        if let Some(receivers) = self.tags.get("#p") {
            parties.extend(receivers.iter().map(|s| s.as_str()));
        }
        parties
    }

    /// Whether any of the filter's kinds is in `privileged`.
    pub fn touches_kinds(&self, privileged: &[u16]) -> bool {
        self.kinds
            .iter()
            .flatten()
            .any(|k| privileged.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{generate_secret_key, EventTemplate};

    fn event_with(kind: u16, tags: Vec<Vec<String>>, content: &str) -> Event {
        EventTemplate {
            created_at: 1_700_000_000,
            kind,
            tags,
            content: content.to_string(),
        }
        .sign(&generate_secret_key())
        .unwrap()
    }

    #[test]
    fn kind_and_author_are_anded() {
        let event = event_with(1, vec![], "x");
        let filter = Filter {
            kinds: Some(vec![1]),
            authors: Some(vec![event.pubkey.clone()]),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let wrong_kind = Filter {
            kinds: Some(vec![2]),
            authors: Some(vec![event.pubkey.clone()]),
            ..Default::default()
        };
        assert!(!wrong_kind.matches(&event));
    }

    #[test]
    fn ids_require_exact_match() {
        let event = event_with(1, vec![], "x");
        let exact = Filter {
            ids: Some(vec![event.id.clone()]),
            ..Default::default()
        };
        assert!(exact.matches(&event));

        let prefix = Filter {
            ids: Some(vec![event.id[..8].to_string()]),
            ..Default::default()
        };
        assert!(!prefix.matches(&event));
    }

    #[test]
    fn since_until_are_inclusive_bounds() {
        let event = event_with(1, vec![], "x");
        let inside = Filter {
            since: Some(event.created_at),
            until: Some(event.created_at),
            ..Default::default()
        };
        assert!(inside.matches(&event));

        let late = Filter {
            since: Some(event.created_at + 1),
            ..Default::default()
        };
        assert!(!late.matches(&event));

        let early = Filter {
            until: Some(event.created_at - 1),
            ..Default::default()
        };
        assert!(!early.matches(&event));
    }

    #[test]
    fn tag_constraints_match_any_listed_value() {
        let event = event_with(
            1,
            vec![
                vec!["e".to_string(), "target".to_string()],
                vec!["p".to_string(), "alice".to_string()],
            ],
            "x",
        );
        let mut tags = HashMap::new();
        tags.insert("#e".to_string(), vec!["other".to_string(), "target".to_string()]);
        let filter = Filter {
            tags,
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let mut missing = HashMap::new();
        missing.insert("#e".to_string(), vec!["absent".to_string()]);
        let filter = Filter {
            tags: missing,
            ..Default::default()
        };
        assert!(!filter.matches(&event));
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let event = event_with(1, vec![], "Hello World");
        let hit = Filter {
            search: Some("hello".to_string()),
            ..Default::default()
        };
        assert!(hit.matches(&event));
        let miss = Filter {
            search: Some("goodbye".to_string()),
            ..Default::default()
        };
        assert!(!miss.matches(&event));
    }

    #[test]
    fn wire_round_trip_preserves_tag_map() {
        let mut tags = HashMap::new();
        tags.insert("#p".to_string(), vec!["a".repeat(64)]);
        let filter = Filter {
            kinds: Some(vec![4]),
            limit: Some(10),
            tags,
            ..Default::default()
        };
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"#p\""));
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, back);
    }

    #[test]
    fn parties_collects_authors_and_recipients() {
        let mut tags = HashMap::new();
        tags.insert("#p".to_string(), vec!["bob".to_string()]);
        let filter = Filter {
            authors: Some(vec!["alice".to_string()]),
            tags,
            ..Default::default()
        };
        let parties = filter.parties();
        assert!(parties.contains(&"alice"));
        assert!(parties.contains(&"bob"));
    }
}
