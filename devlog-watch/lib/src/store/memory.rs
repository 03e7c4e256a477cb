//! In-memory stores.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{DevlogStateStore, SubscriptionStore};
use crate::error::StoreError;
use crate::types::SubscribeOutcome;

/// Subscription and devlog-state store kept in process memory.
///
/// Each map sits behind its own mutex; every operation holds the lock for
/// its whole read-modify-write, so `compare_and_set` is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    subscriptions: Mutex<BTreeMap<String, BTreeSet<String>>>,
    states: Mutex<BTreeMap<String, String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for MemoryStore {
    async fn put(&self, project: &str, target: &str) -> Result<SubscribeOutcome, StoreError> {
        let mut subscriptions = lock(&self.subscriptions)?;
        let added = subscriptions
            .entry(project.to_string())
            .or_default()
            .insert(target.to_string());

        Ok(if added {
            SubscribeOutcome::Added
        } else {
            SubscribeOutcome::AlreadySubscribed
        })
    }

    async fn remove(&self, project: &str, target: &str) -> Result<bool, StoreError> {
        let mut subscriptions = lock(&self.subscriptions)?;
        let Some(targets) = subscriptions.get_mut(project) else {
            return Ok(false);
        };

        let removed = targets.remove(target);
        if targets.is_empty() {
            subscriptions.remove(project);
        }
        Ok(removed)
    }

    async fn distinct_projects(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(lock(&self.subscriptions)?.keys().cloned().collect())
    }

    async fn subscribers_of(&self, project: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(lock(&self.subscriptions)?
            .get(project)
            .cloned()
            .unwrap_or_default())
    }
}

impl DevlogStateStore for MemoryStore {
    async fn get(&self, project: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.states)?.get(project).cloned())
    }

    async fn compare_and_set(
        &self,
        project: &str,
        expected: Option<&str>,
        new_slug: &str,
    ) -> Result<bool, StoreError> {
        let mut states = lock(&self.states)?;
        if states.get(project).map(String::as_str) != expected {
            return Ok(false);
        }
        states.insert(project.to_string(), new_slug.to_string());
        Ok(true)
    }

    async fn prune_orphans(&self, active: &BTreeSet<String>) -> Result<u64, StoreError> {
        let mut states = lock(&self.states)?;
        let before = states.len();
        states.retain(|project, _| active.contains(project));
        Ok((before - states.len()) as u64)
    }
}
