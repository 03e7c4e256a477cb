//! Subscribe and unsubscribe commands.
//!
//! [`CommandService`] is the only writer of subscriptions. It turns a
//! command's free text into a project id, updates the store, and returns a
//! [`CommandReply`] whose `Display` is the text shown to the user.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::store::SubscriptionStore;
use crate::types::SubscribeOutcome;

/// A recognized chat command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `<prefix>-subscribe <project id>`
    Subscribe,
    /// `<prefix>-unsubscribe <project id>`
    Unsubscribe,
}

impl Command {
    fn suffix(self) -> &'static str {
        match self {
            Command::Subscribe => "subscribe",
            Command::Unsubscribe => "unsubscribe",
        }
    }
}

/// Outcome of a command, rendered for the user by `Display`.
///
/// ```
/// use devlog_watch_lib::CommandReply;
///
/// let reply = CommandReply::NotSubscribed { project: "42".to_string() };
/// assert_eq!(reply.to_string(), "You weren't subscribed to project 42.");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// The command text carried no project id.
    MissingProject {
        /// Full command name used in the usage hint.
        command: String,
    },
    /// A new subscription was stored.
    Subscribed {
        /// The project now watched for this channel.
        project: String,
    },
    /// The channel was already subscribed; nothing changed.
    AlreadySubscribed {
        /// The project already watched for this channel.
        project: String,
    },
    /// The subscription was removed.
    Unsubscribed {
        /// The project no longer watched for this channel.
        project: String,
    },
    /// There was no subscription to remove.
    NotSubscribed {
        /// The project the channel asked to stop watching.
        project: String,
    },
    /// The store failed; details stay in the server log.
    Failed,
}

impl fmt::Display for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandReply::MissingProject { command } => {
                write!(f, "Please provide a project ID, e.g. `{command} 2054`.")
            }
            CommandReply::Subscribed { project } => write!(f, "✅ Subscribed to project {project}!"),
            CommandReply::AlreadySubscribed { project } => {
                write!(f, "You're already subscribed to project {project}.")
            }
            CommandReply::Unsubscribed { project } => {
                write!(f, "🗑️ Unsubscribed from project {project}.")
            }
            CommandReply::NotSubscribed { project } => {
                write!(f, "You weren't subscribed to project {project}.")
            }
            CommandReply::Failed => f.write_str(
                "Sorry, something went wrong while updating your subscription. Please try again later.",
            ),
        }
    }
}

/// Applies subscription commands to a [`SubscriptionStore`].
pub struct CommandService<S> {
    store: Arc<S>,
    prefix: String,
}

impl<S> Clone for CommandService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: SubscriptionStore> CommandService<S> {
    /// Creates a service answering `{prefix}-subscribe` and
    /// `{prefix}-unsubscribe`.
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Full name of `command`, e.g. `/devlog-subscribe`.
    pub fn command_name(&self, command: Command) -> String {
        format!("{}-{}", self.prefix, command.suffix())
    }

    /// Maps an incoming command name to a [`Command`].
    pub fn parse_command(&self, name: &str) -> Option<Command> {
        let suffix = name.trim().strip_prefix(self.prefix.as_str())?.strip_prefix('-')?;
        match suffix {
            "subscribe" => Some(Command::Subscribe),
            "unsubscribe" => Some(Command::Unsubscribe),
            _ => None,
        }
    }

    /// Runs `command` for `target` with the command's free text.
    pub async fn execute(&self, command: Command, target: &str, text: &str) -> CommandReply {
        match command {
            Command::Subscribe => self.subscribe(target, text).await,
            Command::Unsubscribe => self.unsubscribe(target, text).await,
        }
    }

    /// Subscribes `target` to the project named in `text`.
    #[instrument(skip(self), fields(project = tracing::field::Empty))]
    pub async fn subscribe(&self, target: &str, text: &str) -> CommandReply {
        let Some(project) = project_id(text) else {
            return CommandReply::MissingProject {
                command: self.command_name(Command::Subscribe),
            };
        };
        tracing::Span::current().record("project", project);

        match self.store.put(project, target).await {
            Ok(SubscribeOutcome::Added) => {
                info!("Subscription added");
                CommandReply::Subscribed {
                    project: project.to_string(),
                }
            }
            Ok(SubscribeOutcome::AlreadySubscribed) => CommandReply::AlreadySubscribed {
                project: project.to_string(),
            },
            Err(e) => {
                error!(error = %e, "Failed to add subscription");
                CommandReply::Failed
            }
        }
    }

    /// Removes the subscription of `target` to the project named in `text`.
    #[instrument(skip(self), fields(project = tracing::field::Empty))]
    pub async fn unsubscribe(&self, target: &str, text: &str) -> CommandReply {
        let Some(project) = project_id(text) else {
            return CommandReply::MissingProject {
                command: self.command_name(Command::Unsubscribe),
            };
        };
        tracing::Span::current().record("project", project);

        match self.store.remove(project, target).await {
            Ok(true) => {
                info!("Subscription removed");
                CommandReply::Unsubscribed {
                    project: project.to_string(),
                }
            }
            Ok(false) => CommandReply::NotSubscribed {
                project: project.to_string(),
            },
            Err(e) => {
                error!(error = %e, "Failed to remove subscription");
                CommandReply::Failed
            }
        }
    }
}

fn project_id(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
