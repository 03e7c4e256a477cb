//! Core data types for the devlog watcher.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single devlog entry scraped from a project page.
///
/// Entries are transient: only the `slug` of the newest entry is ever
/// persisted, as the project's devlog state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Opaque identifier of the entry, also the path suffix of its link.
    pub slug: String,
    /// The entry title as shown on the page.
    pub title: String,
    /// Publication timestamp exactly as the page published it, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

impl Entry {
    /// Creates a new entry.
    ///
    /// ## Examples
    ///
    /// ```
    /// use devlog_watch_lib::Entry;
    ///
    /// let entry = Entry::new("/devlogs/1", "Day 1", Some("2024-01-01".to_string()));
    /// assert_eq!(entry.slug, "/devlogs/1");
    /// ```
    pub fn new(
        slug: impl Into<String>,
        title: impl Into<String>,
        published_at: Option<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            title: title.into(),
            published_at,
        }
    }
}

/// Result of adding a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeOutcome {
    /// A new (project, target) record was created.
    Added,
    /// The record already existed; nothing changed.
    AlreadySubscribed,
}

/// What happened to one project during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProjectOutcome {
    /// First observation; the head slug was stored without notifying anyone.
    Baseline {
        /// The stored slug.
        slug: String,
    },
    /// The head slug matches the stored one.
    Unchanged,
    /// A new entry was detected, stored, and announced.
    Changed {
        /// The new head slug.
        slug: String,
        /// Targets that accepted the notification.
        delivered: usize,
        /// Targets whose delivery failed.
        failed: usize,
    },
    /// The page was reachable but yielded no entries.
    Empty,
    /// Skipped because the project is backing off after repeated failures.
    BackedOff,
    /// The fetch failed; nothing was changed.
    FetchFailed {
        /// The error message.
        error: String,
    },
    /// A store read or write failed; nothing was announced.
    StoreFailed {
        /// The error message.
        error: String,
    },
    /// Another writer advanced the state first; nothing was announced.
    Conflict,
}

impl ProjectOutcome {
    /// Whether this outcome counts as a failure for backoff purposes.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, ProjectOutcome::FetchFailed { .. })
    }
}

/// Summary of one scheduler pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// When the pass started.
    pub started_at: DateTime<Utc>,
    /// True when the pass did not run because a previous one was in flight.
    pub skipped: bool,
    /// Per-project outcomes, keyed by project id.
    pub projects: BTreeMap<String, ProjectOutcome>,
    /// Number of orphaned devlog-state records removed after the pass.
    pub pruned: u64,
    /// Set when the watched projects could not be listed, so nothing was
    /// checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

impl TickReport {
    /// Creates an empty report for a pass starting now.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            skipped: false,
            projects: BTreeMap::new(),
            pruned: 0,
            store_error: None,
        }
    }

    /// Creates a report for a pass that was not started.
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::new()
        }
    }

    /// Creates a report for a pass that could not list its projects.
    pub fn store_failed(error: impl Into<String>) -> Self {
        Self {
            store_error: Some(error.into()),
            ..Self::new()
        }
    }

    /// Whether the pass failed as a whole rather than per project.
    pub fn is_failed(&self) -> bool {
        self.store_error.is_some()
    }

    /// Total notifications delivered during the pass.
    pub fn notifications_sent(&self) -> usize {
        self.projects
            .values()
            .map(|outcome| match outcome {
                ProjectOutcome::Changed { delivered, .. } => *delivered,
                _ => 0,
            })
            .sum()
    }

    /// Number of projects whose fetch failed.
    pub fn fetch_failures(&self) -> usize {
        self.projects
            .values()
            .filter(|outcome| outcome.is_fetch_failure())
            .count()
    }

    /// Number of projects with a detected change.
    pub fn changes(&self) -> usize {
        self.projects
            .values()
            .filter(|outcome| matches!(outcome, ProjectOutcome::Changed { .. }))
            .count()
    }
}

impl Default for TickReport {
    fn default() -> Self {
        Self::new()
    }
}
