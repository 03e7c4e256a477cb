//! SQLite-backed stores.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::{DevlogStateStore, SubscriptionStore};
use crate::error::{StoreError, is_busy_error};
use crate::types::SubscribeOutcome;

/// Initialize a SQLite connection pool from a connection string.
///
/// Configures the pool with:
/// - `busy_timeout=5000ms` - Wait up to 5 seconds for a locked database
/// - `journal_mode=WAL` - Write-ahead logging so the command endpoint and the
///   scheduler do not block each other
///
/// ## Errors
///
/// Returns `StoreError::ConnectionFailed` if the URL is invalid or the
/// connection cannot be established.
pub async fn init_pool(url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(StoreError::ConnectionFailed)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_millis(5000))
        .pragma("journal_mode", "WAL");

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| {
            if is_busy_error(&e) {
                StoreError::BusyTimeout
            } else {
                StoreError::ConnectionFailed(e)
            }
        })
        .inspect(|_| {
            tracing::debug!(db.url = %url, "Database pool initialized");
        })
}

/// Initialize an in-memory SQLite database pool.
///
/// A single connection that is never recycled keeps every query on the same
/// in-memory database. Each call gets its own database.
///
/// ## Errors
///
/// Returns `StoreError::ConnectionFailed` if the connection cannot be established.
pub async fn init_memory_pool() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(StoreError::ConnectionFailed)?
        .busy_timeout(Duration::from_millis(5000));

    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(StoreError::ConnectionFailed)
}

/// Run embedded database migrations.
///
/// ## Errors
///
/// Returns `StoreError::MigrationFailed` if any migration fails to apply.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(StoreError::MigrationFailed)?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

/// Subscription and devlog-state store over one SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wraps an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens `url`, applies migrations, and returns the store.
    ///
    /// ## Errors
    ///
    /// Returns a [`StoreError`] if connecting or migrating fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = init_pool(url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Opens a fresh migrated in-memory database.
    ///
    /// ## Errors
    ///
    /// Returns a [`StoreError`] if connecting or migrating fails.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = init_memory_pool().await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl SubscriptionStore for SqliteStore {
    async fn put(&self, project: &str, target: &str) -> Result<SubscribeOutcome, StoreError> {
        let result = sqlx::query(
            "INSERT INTO subscriptions (project_id, target_id, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT (project_id, target_id) DO NOTHING",
        )
        .bind(project)
        .bind(target)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StoreError::query)?;

        Ok(if result.rows_affected() == 1 {
            SubscribeOutcome::Added
        } else {
            SubscribeOutcome::AlreadySubscribed
        })
    }

    async fn remove(&self, project: &str, target: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE project_id = ?1 AND target_id = ?2")
            .bind(project)
            .bind(target)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn distinct_projects(&self) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT project_id FROM subscriptions")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::query)?;

        Ok(rows.into_iter().map(|(project,)| project).collect())
    }

    async fn subscribers_of(&self, project: &str) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT target_id FROM subscriptions WHERE project_id = ?1")
                .bind(project)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::query)?;

        Ok(rows.into_iter().map(|(target,)| target).collect())
    }
}

impl DevlogStateStore for SqliteStore {
    async fn get(&self, project: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT last_slug FROM devlog_state WHERE project_id = ?1")
                .bind(project)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::query)?;

        Ok(row.map(|(slug,)| slug))
    }

    async fn compare_and_set(
        &self,
        project: &str,
        expected: Option<&str>,
        new_slug: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();

        // Single statements keep the check and the write atomic.
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO devlog_state (project_id, last_slug, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT (project_id) DO NOTHING",
                )
                .bind(project)
                .bind(new_slug)
                .bind(now)
                .execute(&self.pool)
                .await
            }
            Some(previous) => {
                sqlx::query(
                    "UPDATE devlog_state SET last_slug = ?1, updated_at = ?2 \
                     WHERE project_id = ?3 AND last_slug = ?4",
                )
                .bind(new_slug)
                .bind(now)
                .bind(project)
                .bind(previous)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(StoreError::query)?;

        Ok(result.rows_affected() == 1)
    }

    async fn prune_orphans(&self, active: &BTreeSet<String>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::query)?;

        let rows: Vec<(String,)> = sqlx::query_as("SELECT project_id FROM devlog_state")
            .fetch_all(&mut *tx)
            .await
            .map_err(StoreError::query)?;

        let mut removed = 0;
        for (project,) in rows {
            if active.contains(&project) {
                continue;
            }
            removed += sqlx::query("DELETE FROM devlog_state WHERE project_id = ?1")
                .bind(&project)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::query)?
                .rows_affected();
        }

        tx.commit().await.map_err(StoreError::query)?;
        Ok(removed)
    }
}
