//! Error types for the devlog watcher.
//!
//! Each collaborator owns its own error enum. The scheduler never propagates
//! these past a single project; it folds them into a
//! [`ProjectOutcome`](crate::ProjectOutcome) instead.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while fetching a project's devlog page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP request failed (connection refused, DNS, body read, ...).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The project page answered with a non-success status.
    #[error("project page returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The project host asked us to slow down (HTTP 429).
    #[error("project host rate limit exceeded")]
    RateLimited,

    /// The fetch did not complete within its time budget.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The project page URL could not be built.
    #[error("invalid project URL: {0}")]
    InvalidUrl(String),
}

/// Errors that can occur while delivering a notification.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The chat API answered with a non-success status.
    #[error("chat API returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The chat API rejected the message (`{"ok": false}`).
    #[error("chat API rejected message: {0}")]
    Rejected(String),

    /// The chat API rate limit was hit.
    #[error("chat API rate limit exceeded")]
    RateLimited,

    /// The send did not complete within its time budget.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur in the subscription or devlog-state stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to establish a database connection.
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(#[source] sqlx::Error),

    /// Failed to run database migrations.
    #[error("migration failed: {0}")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A database query failed.
    #[error("query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// Database is busy (SQLITE_BUSY).
    #[error("database is busy, please retry")]
    BusyTimeout,

    /// The store is unavailable for a reason outside the database driver.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Classifies a query error, separating SQLITE_BUSY from other failures.
    pub(crate) fn query(e: sqlx::Error) -> Self {
        if is_busy_error(&e) {
            StoreError::BusyTimeout
        } else {
            StoreError::QueryFailed(e)
        }
    }
}

/// Check if a sqlx error is a SQLITE_BUSY error.
pub(crate) fn is_busy_error(e: &sqlx::Error) -> bool {
    match e {
        // SQLite BUSY error code is 5
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code == "5"),
        _ => false,
    }
}

/// Reasons an inbound slash-command request fails signature verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature or timestamp header is absent.
    #[error("missing signature headers")]
    MissingHeaders,

    /// The timestamp is not a number or is outside the accepted window.
    #[error("request timestamp is stale or malformed")]
    StaleTimestamp,

    /// The signature is not `v0=` followed by hex.
    #[error("malformed signature")]
    Malformed,

    /// The signature does not match the body.
    #[error("signature mismatch")]
    Mismatch,
}

/// Errors raised while loading configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A setting is present but could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// The setting name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A CSS selector used for devlog extraction did not parse.
    #[error("invalid selector '{0}'")]
    InvalidSelector(String),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}
