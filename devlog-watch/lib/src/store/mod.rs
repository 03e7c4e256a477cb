//! Subscription and devlog-state persistence.
//!
//! The scheduler and the command service only see the two store traits.
//! Two backends implement both:
//!
//! - [`SqliteStore`] - durable storage over a `sqlx` SQLite pool
//! - [`MemoryStore`] - mutex-guarded maps for tests and throwaway runs
//!
//! ## Examples
//!
//! ```no_run
//! use devlog_watch_lib::store::{SqliteStore, SubscriptionStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::connect("sqlite://devlog-watch.db").await?;
//! store.put("42", "C123").await?;
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

use std::collections::BTreeSet;
use std::future::Future;

use crate::error::StoreError;
use crate::types::SubscribeOutcome;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, init_memory_pool, init_pool, run_migrations};

/// Durable mapping of project to the set of targets watching it.
///
/// Written by the command interface, read by the scheduler.
pub trait SubscriptionStore: Send + Sync {
    /// Adds a (project, target) subscription. Idempotent.
    fn put(
        &self,
        project: &str,
        target: &str,
    ) -> impl Future<Output = Result<SubscribeOutcome, StoreError>> + Send;

    /// Removes a subscription, returning whether one existed.
    fn remove(
        &self,
        project: &str,
        target: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// All projects with at least one subscription.
    fn distinct_projects(&self) -> impl Future<Output = Result<BTreeSet<String>, StoreError>> + Send;

    /// All targets subscribed to `project`.
    fn subscribers_of(
        &self,
        project: &str,
    ) -> impl Future<Output = Result<BTreeSet<String>, StoreError>> + Send;
}

/// Durable mapping of project to the slug of the last entry seen.
///
/// Owned by the scheduler.
pub trait DevlogStateStore: Send + Sync {
    /// Last seen slug of `project`, if any.
    fn get(&self, project: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Atomically replaces the slug of `project` with `new_slug` if the
    /// current value equals `expected`.
    ///
    /// `expected = None` means "no record yet": the record is created only if
    /// absent. Returns `false` when the current value did not match.
    fn compare_and_set(
        &self,
        project: &str,
        expected: Option<&str>,
        new_slug: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes state of every project not in `active`, returning how many
    /// records were removed.
    fn prune_orphans(
        &self,
        active: &BTreeSet<String>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}
