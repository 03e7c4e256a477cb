//! Devlog change detection and notification.
//!
//! This library watches project pages for new devlog entries and announces
//! each new entry to every chat channel subscribed to that project.
//!
//! ## Core Types
//!
//! - [`Scheduler`] - Periodic change detector; one pass per tick
//! - [`Entry`] - A devlog entry as seen on a project page
//! - [`ProjectOutcome`] / [`TickReport`] - What a pass did, per project
//!
//! ## Capabilities
//!
//! - [`EntryFetcher`] / [`DevlogPageFetcher`] - Project id to entries, newest first
//! - [`Notifier`] / [`SlackNotifier`] - Deliver a message to one target
//! - [`store::SubscriptionStore`] / [`store::DevlogStateStore`] - Persistence
//!
//! ## Command Surface
//!
//! - [`CommandService`] - Subscribe and unsubscribe, scoped to a channel
//! - [`server::router`] - Slack slash-command HTTP endpoint
//!
//! ## Configuration
//!
//! - [`WatchConfig`] - Environment-driven settings
//! - [`parse_interval`] - Parse intervals like "10", "30s" or "2h"

mod commands;
mod config;
mod error;
mod fetch;
mod notify;
mod retry;
mod scheduler;
pub mod server;
pub mod store;
mod types;

pub use commands::{Command, CommandReply, CommandService};
pub use config::{
    DEFAULT_COMMAND_PREFIX, DEFAULT_DATABASE_URL, DEFAULT_PROJECT_BASE_URL, DEFAULT_SLACK_API_BASE,
    DEFAULT_SLACK_RESPONSE_ORIGIN, WatchConfig, parse_interval,
};
pub use error::{ConfigError, DeliveryError, FetchError, SignatureError, StoreError};
pub use fetch::{DevlogExtractor, DevlogPageFetcher, EntryFetcher, FETCH_USER_AGENT, SelectorSet};
pub use notify::{Notifier, SlackNotifier, format_announcement};
pub use retry::{ProjectBackoff, RetryPolicy, fetch_with_retry, is_retriable};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use server::{EndpointSettings, verify_slack_signature};
pub use store::{MemoryStore, SqliteStore};
pub use types::{Entry, ProjectOutcome, SubscribeOutcome, TickReport};
