//! Tagging utility (SPEC_FULL §3 SUPPLEMENT "Tag").
//!
//! [`crate::context::EventContext`] carries a bare `HashSet<String>`; this
//! module adds the matching helpers shared by the broadcast filter chain
//! and dispatcher node selection so both sites express "any of" / "all of"
//! queries the same way instead of re-deriving set logic ad hoc.

use std::collections::HashSet;

/// A normalized tag: trimmed and lowercased so `"Urgent"` and `"urgent "`
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(String);

impl Tag {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::new(s)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Query predicates over a tag set.
pub enum TagQuery {
    Any(Vec<Tag>),
    All(Vec<Tag>),
}

impl TagQuery {
    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagQuery::Any(want) => want.iter().any(|t| tags.contains(t.as_str())),
            TagQuery::All(want) => want.iter().all(|t| tags.contains(t.as_str())),
        }
    }
}
