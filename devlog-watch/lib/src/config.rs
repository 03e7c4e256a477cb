//! Environment-driven configuration.
//!
//! [`WatchConfig::from_env`] reads the process environment; the binary calls
//! `dotenvy::dotenv()` first so a `.env` file works too. Tests use
//! [`WatchConfig::from_lookup`] with a map instead of touching the real
//! environment.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Default base URL for project pages and entry links.
pub const DEFAULT_PROJECT_BASE_URL: &str = "https://summer.hackclub.com";

/// Default Slack Web API base URL.
pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com";

/// Default SQLite connection string.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://devlog-watch.db";

/// Default origin that slash-command `response_url`s must point at.
pub const DEFAULT_SLACK_RESPONSE_ORIGIN: &str = "https://hooks.slack.com";

/// Default slash command prefix.
pub const DEFAULT_COMMAND_PREFIX: &str = "/devlog";

/// Fully resolved configuration for the watcher process.
#[derive(Clone)]
pub struct WatchConfig {
    /// Cookie sent with every project page request.
    pub cookie: String,
    /// Bot token used to post notifications.
    pub slack_bot_token: String,
    /// Time between scheduler passes.
    pub interval: Duration,
    /// Port for the slash command endpoint.
    pub port: u16,
    /// SQLite connection string.
    pub database_url: String,
    /// Base URL of project pages; entry slugs are appended to it for links.
    pub project_base_url: String,
    /// Slack Web API base URL.
    pub slack_api_base: String,
    /// Per-attempt fetch timeout.
    pub fetch_timeout: Duration,
    /// Per-send notification timeout.
    pub notify_timeout: Duration,
    /// Maximum number of projects checked concurrently within one pass.
    pub max_concurrent_fetches: usize,
    /// In-tick retries for rate-limited fetches.
    pub fetch_retries: u32,
    /// Cap on the number of ticks a failing project is skipped for.
    pub max_backoff_ticks: u32,
    /// Whether orphaned devlog state is pruned after each pass.
    pub prune_orphaned_state: bool,
    /// Slash command prefix, e.g. `/devlog` for `/devlog-subscribe`.
    pub command_prefix: String,
    /// Secret used to verify signed slash-command requests. Required by `serve`.
    pub slack_signing_secret: Option<String>,
    /// Only `response_url`s on this origin receive command replies.
    pub slack_response_origin: String,
}

impl fmt::Debug for WatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchConfig")
            .field("cookie", &"<redacted>")
            .field("slack_bot_token", &"<redacted>")
            .field("interval", &self.interval)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("project_base_url", &self.project_base_url)
            .field("slack_api_base", &self.slack_api_base)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("notify_timeout", &self.notify_timeout)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("fetch_retries", &self.fetch_retries)
            .field("max_backoff_ticks", &self.max_backoff_ticks)
            .field("prune_orphaned_state", &self.prune_orphaned_state)
            .field("command_prefix", &self.command_prefix)
            .field(
                "slack_signing_secret",
                &self.slack_signing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("slack_response_origin", &self.slack_response_origin)
            .finish()
    }
}

impl WatchConfig {
    /// Loads configuration from the process environment.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] if a required setting is missing or any
    /// setting fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] if a required setting is missing or any
    /// setting fails to parse.
    ///
    /// ## Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use devlog_watch_lib::WatchConfig;
    ///
    /// let env = HashMap::from([
    ///     ("SOM_COOKIE", "session=abc"),
    ///     ("SLACK_BOT_TOKEN", "xoxb-test"),
    ///     ("CHECK_INTERVAL_MINUTES", "5"),
    /// ]);
    /// let config = WatchConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
    /// assert_eq!(config.interval.as_secs(), 300);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cookie = get("SOM_COOKIE").ok_or(ConfigError::Missing("SOM_COOKIE"))?;
        let slack_bot_token =
            get("SLACK_BOT_TOKEN").ok_or(ConfigError::Missing("SLACK_BOT_TOKEN"))?;

        let interval = match get("CHECK_INTERVAL_MINUTES") {
            Some(raw) => parse_interval(&raw).map_err(|reason| ConfigError::Invalid {
                name: "CHECK_INTERVAL_MINUTES",
                reason,
            })?,
            None => Duration::from_secs(10 * 60),
        };

        let port = parse_number(get("PORT"), "PORT", 3000u16)?;
        let fetch_timeout_secs = parse_number(get("FETCH_TIMEOUT_SECS"), "FETCH_TIMEOUT_SECS", 20u64)?;
        let notify_timeout_secs =
            parse_number(get("NOTIFY_TIMEOUT_SECS"), "NOTIFY_TIMEOUT_SECS", 10u64)?;
        let max_concurrent_fetches =
            parse_number(get("MAX_CONCURRENT_FETCHES"), "MAX_CONCURRENT_FETCHES", 4usize)?;
        let fetch_retries = parse_number(get("FETCH_RETRIES"), "FETCH_RETRIES", 2u32)?;
        let max_backoff_ticks = parse_number(get("MAX_BACKOFF_TICKS"), "MAX_BACKOFF_TICKS", 8u32)?;

        if fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "FETCH_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if notify_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "NOTIFY_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_FETCHES",
                reason: "must be greater than zero".to_string(),
            });
        }

        let prune_orphaned_state = match get("PRUNE_ORPHANED_STATE") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "PRUNE_ORPHANED_STATE",
                reason: format!("expected true or false, got '{raw}'"),
            })?,
            None => true,
        };

        Ok(Self {
            cookie,
            slack_bot_token,
            interval,
            port,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            project_base_url: get("PROJECT_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_PROJECT_BASE_URL.to_string()),
            slack_api_base: get("SLACK_API_BASE")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SLACK_API_BASE.to_string()),
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            notify_timeout: Duration::from_secs(notify_timeout_secs),
            max_concurrent_fetches,
            fetch_retries,
            max_backoff_ticks,
            prune_orphaned_state,
            command_prefix: get("COMMAND_PREFIX")
                .unwrap_or_else(|| DEFAULT_COMMAND_PREFIX.to_string()),
            slack_signing_secret: get("SLACK_SIGNING_SECRET"),
            slack_response_origin: get("SLACK_RESPONSE_ORIGIN")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_SLACK_RESPONSE_ORIGIN.to_string()),
        })
    }
}

fn parse_number<T>(raw: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses a polling interval.
///
/// ## Supported Units
///
/// - `s` - seconds
/// - `m` - minutes (default if no unit specified)
/// - `h` - hours
/// - `d` - days
///
/// ## Errors
///
/// Returns an error string if the interval cannot be parsed or is zero.
///
/// ## Examples
///
/// ```
/// use std::time::Duration;
/// use devlog_watch_lib::parse_interval;
///
/// assert_eq!(parse_interval("15").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
/// ```
pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let normalized = value.trim().to_lowercase().replace(' ', "");

    if normalized.is_empty() {
        return Err("interval cannot be empty".to_string());
    }

    let split_index = normalized
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (amount, unit) = normalized.split_at(split_index);

    if amount.is_empty() {
        return Err("interval must start with a number".to_string());
    }

    let amount: u64 = amount
        .parse()
        .map_err(|_| "interval must be a number".to_string())?;

    if amount == 0 {
        return Err("interval must be greater than zero".to_string());
    }

    let seconds = match unit {
        "" | "m" => amount.checked_mul(60),
        "s" => Some(amount),
        "h" => amount.checked_mul(60 * 60),
        "d" => amount.checked_mul(24 * 60 * 60),
        _ => {
            return Err("interval units must be s, m, h, or d".to_string());
        }
    };

    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| "interval is too large".to_string())
}
