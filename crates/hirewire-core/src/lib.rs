//! Core domain model for hirewire: upstream items, normalized postings and the
//! source error taxonomy shared by every stage of the pipeline.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hirewire-core";

/// Message-bus subject normalized postings are published on.
pub const JOB_POSTINGS_SUBJECT: &str = "jobs.new";

/// Source-assigned item identifier. Opaque; only ever compared and formatted.
pub type ItemId = u64;

/// Raw item as served by the upstream content API (`/item/{id}.json`).
///
/// Every field except `id` is optional on the wire and defaults when absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourcePost {
    pub id: ItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub by: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub kids: Vec<ItemId>,
    #[serde(default)]
    pub parent: Option<ItemId>,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub descendants: u64,
}

impl SourcePost {
    /// Pure field projection into the normalized posting handed to publishers.
    pub fn to_job_posting(&self) -> JobPosting {
        JobPosting {
            id: job_posting_id(self.id),
            title: self.title.clone(),
            description: self.text.clone(),
            posted_at: unix_to_utc(self.time),
            raw_text: self.text.clone(),
            parent_id: self.parent,
        }
    }
}

/// Normalized posting published downstream, one per hiring-thread comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    pub raw_text: String,
    pub parent_id: Option<ItemId>,
}

/// Stable across cycles so consumers can deduplicate on it.
pub fn job_posting_id(id: ItemId) -> String {
    id.to_string()
}

fn unix_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl SourceError {
    pub fn internal(context: impl Into<String>) -> Self {
        Self::Internal(context.into())
    }

    /// Flattens the underlying failure into the message; callers only log it.
    pub fn internal_with(context: &str, source: impl std::fmt::Display) -> Self {
        Self::Internal(format!("{context}: {source}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
