//! Event filtering for webhook subscriptions.
//!
//! A subscription expression is a comma-separated list of tokens:
//!
//! - `*` or `all` matches every event type
//! - a group name (`messages`) matches every event type in that group
//! - a group wildcard (`messages.*`) is the same as the bare group name
//! - anything else must be an exact, known event type (`group.create`)
//!
//! The group table is expanded once into hash sets the first time it is
//! touched, so matching on the dispatch path is a handful of lookups.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use crate::error::FilterError;

/// Static group definitions. A group may share its name with one of its own
/// members (`presence`), never with an event outside it.
pub const EVENT_GROUPS: &[(&str, &[&str])] = &[
    (
        "messages",
        &[
            "message",
            "message_ack",
            "message_edit",
            "message_revoke",
            "message_reaction",
            "message_delete",
            "undecryptable_message",
            "media_retry",
        ],
    ),
    ("receipts", &["receipt", "read_receipt", "played_receipt"]),
    ("presence", &["presence", "chat_presence"]),
    (
        "connection",
        &[
            "connected",
            "disconnected",
            "logged_out",
            "qr",
            "pair_success",
            "connect_failure",
            "stream_replaced",
            "keep_alive_timeout",
            "keep_alive_restored",
            "temporary_ban",
        ],
    ),
    (
        "groups",
        &[
            "group.create",
            "group.update",
            "group.join",
            "group.leave",
            "group.participants",
            "group.picture",
        ],
    ),
    ("calls", &["call.offer", "call.accept", "call.reject", "call.terminate"]),
    (
        "contacts",
        &["contact.update", "push_name", "picture", "blocklist", "identity_change"],
    ),
    (
        "history",
        &["history_sync", "app_state_sync_complete", "offline_sync_completed"],
    ),
];

const GROUP_WILDCARD_SUFFIX: &str = ".*";

struct EventCatalog {
    groups: HashMap<&'static str, HashSet<&'static str>>,
    known: HashSet<&'static str>,
}

impl EventCatalog {
    fn build() -> Self {
        let mut groups = HashMap::with_capacity(EVENT_GROUPS.len());
        let mut known = HashSet::new();

        for (name, events) in EVENT_GROUPS {
            groups.insert(*name, events.iter().copied().collect::<HashSet<_>>());
            known.extend(events.iter().copied());
        }

        Self { groups, known }
    }

    fn resolve<'a>(&'a self, token: &'a str) -> Option<Resolved<'a>> {
        if token == "*" || token == "all" {
            return Some(Resolved::All);
        }

        let wildcard = token.strip_suffix(GROUP_WILDCARD_SUFFIX);
        if let Some(set) = self.groups.get(wildcard.unwrap_or(token)) {
            return Some(Resolved::Group(set));
        }

        if wildcard.is_none() && self.known.contains(token) {
            return Some(Resolved::Exact(token));
        }

        None
    }
}

enum Resolved<'a> {
    All,
    Group(&'a HashSet<&'static str>),
    Exact(&'a str),
}

impl Resolved<'_> {
    fn contains(&self, event_type: &str) -> bool {
        match self {
            Resolved::All => true,
            Resolved::Group(set) => set.contains(event_type),
            Resolved::Exact(name) => *name == event_type,
        }
    }
}

static CATALOG: LazyLock<EventCatalog> = LazyLock::new(EventCatalog::build);

fn tokens(expr: &str) -> impl Iterator<Item = &str> {
    expr.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Check that every token of `expr` is a wildcard, a group, or a known event.
///
/// Returns the first offending token.
pub fn validate_events(expr: &str) -> Result<(), FilterError> {
    validate_patterns(tokens(expr))
}

/// Same as [`validate_events`] for an already-split pattern set.
pub fn validate_patterns<'a, I>(patterns: I) -> Result<(), FilterError>
where
    I: IntoIterator<Item = &'a str>,
{
    for token in patterns {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if CATALOG.resolve(token).is_none() {
            return Err(FilterError::InvalidEventPattern {
                token: token.to_string(),
            });
        }
    }
    Ok(())
}

/// Whether `event_type` is selected by the comma-separated expression.
pub fn matches(event_type: &str, expr: &str) -> bool {
    matches_patterns(event_type, tokens(expr))
}

/// Whether `event_type` is selected by any pattern in the set.
///
/// Unknown patterns select nothing.
pub fn matches_patterns<'a, I>(event_type: &str, patterns: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    patterns.into_iter().any(|token| {
        CATALOG
            .resolve(token.trim())
            .is_some_and(|resolved| resolved.contains(event_type))
    })
}

/// Split an expression into its non-empty, trimmed tokens.
pub fn parse_patterns(expr: &str) -> Vec<String> {
    tokens(expr).map(str::to_string).collect()
}

/// Every event type the catalog knows about, sorted.
pub fn known_event_types() -> Vec<&'static str> {
    let mut all: Vec<_> = CATALOG.known.iter().copied().collect();
    all.sort_unstable();
    all
}

/// Event types of a group, or `None` if the group does not exist.
pub fn group_events(group: &str) -> Option<&'static [&'static str]> {
    EVENT_GROUPS
        .iter()
        .find(|(name, _)| *name == group)
        .map(|(_, events)| *events)
}
