use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Class assigned to targets and sources that don't name one.
pub const DEFAULT_CLASS: &str = "default";

fn default_class() -> String {
    DEFAULT_CLASS.to_string()
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `at + d`, saturating at the latest representable instant.
pub fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// How a source retrieves content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    /// Plain HTTP request against the endpoint.
    Direct,
    /// Full page execution through a pooled rendering session.
    Rendered,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionKind::Direct => write!(f, "direct"),
            ExecutionKind::Rendered => write!(f, "rendered"),
        }
    }
}

/// An account, channel or feed being polled for new content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target_id: String,
    /// Lower value = polled first.
    pub priority: u32,
    /// Named sink or webhook URL that receives this target's new items.
    pub sink_ref: String,
    /// Groups a target with the sources able to serve it.
    #[serde(default = "default_class")]
    pub class: String,
}

impl Target {
    pub fn new(target_id: impl Into<String>, priority: u32, sink_ref: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            priority,
            sink_ref: sink_ref.into(),
            class: default_class(),
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }
}

/// Static configuration of one retrieval strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub name: String,
    /// Endpoint template. `{target}` is replaced by the target id; without
    /// the placeholder the id is appended as a path segment.
    pub base_endpoint: String,
    pub kind: ExecutionKind,
    /// Lower value = preferred by the priority strategy.
    pub priority: u32,
    pub max_fails: u32,
    #[serde(default = "default_class")]
    pub class: String,
    /// Substring an item link must contain when extracting items from
    /// rendered HTML that isn't a feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_pattern: Option<String>,
}

impl SourceSpec {
    pub fn new(
        name: impl Into<String>,
        base_endpoint: impl Into<String>,
        kind: ExecutionKind,
        priority: u32,
        max_fails: u32,
    ) -> Self {
        Self {
            name: name.into(),
            base_endpoint: base_endpoint.into(),
            kind,
            priority,
            max_fails,
            class: default_class(),
            link_pattern: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn with_link_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.link_pattern = Some(pattern.into());
        self
    }
}

/// One item as reported by a source, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    /// Creation time reported by the source, if any.
    pub created_at: Option<DateTime<Utc>>,
}

impl CandidateItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            title: None,
            created_at: None,
        }
    }
}

/// Structurally valid result of one successful poll. May be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemBatch {
    pub target_id: String,
    /// Name of the source that produced the batch.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<CandidateItem>,
}

/// A previously-unseen item handed to a delivery sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub target_id: String,
    pub item_id: String,
    pub source: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewItem {
    pub fn from_candidate(batch: &ItemBatch, item: &CandidateItem) -> Self {
        Self {
            target_id: batch.target_id.clone(),
            item_id: item.id.clone(),
            source: batch.source.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            created_at: item.created_at,
        }
    }
}
