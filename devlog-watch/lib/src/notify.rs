//! Notification delivery.
//!
//! The scheduler only depends on [`Notifier`]. [`SlackNotifier`] posts
//! messages through the Slack Web API `chat.postMessage` method.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, instrument};

use crate::config::WatchConfig;
use crate::error::{ConfigError, DeliveryError};
use crate::types::Entry;

/// Capability that delivers one message to one target.
pub trait Notifier: Send + Sync {
    /// Sends `message` to `target`.
    ///
    /// ## Errors
    ///
    /// Returns a [`DeliveryError`] if the message was not accepted.
    fn send(&self, target: &str, message: &str)
    -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Renders the announcement posted when a project publishes a new entry.
///
/// ## Examples
///
/// ```
/// use devlog_watch_lib::{Entry, format_announcement};
///
/// let entry = Entry::new("/projects/42/devlogs/7", "Day 7", Some("2024-06-07".to_string()));
/// assert_eq!(
///     format_announcement("https://summer.hackclub.com", "42", &entry),
///     "📢 New devlog on project *42*: <https://summer.hackclub.com/projects/42/devlogs/7|Day 7> (2024-06-07)"
/// );
/// ```
///
/// Scraped text is escaped for Slack's message syntax, so a title containing
/// `<`, `>` or `&` cannot end the link early.
pub fn format_announcement(base_url: &str, project: &str, entry: &Entry) -> String {
    let published = entry.published_at.as_deref().unwrap_or("unknown date");
    format!(
        "📢 New devlog on project *{}*: <{}{}|{}> ({})",
        escape_text(project),
        escape_url(base_url.trim_end_matches('/')),
        escape_url(&entry.slug),
        escape_text(&entry.title),
        escape_text(published)
    )
}

/// Escapes the three characters Slack treats as control characters in text.
fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escapes a link target. `|` separates target from label, so it is
/// percent-encoded along with the angle brackets.
fn escape_url(url: &str) -> String {
    url.replace('&', "&amp;")
        .replace('|', "%7C")
        .replace('<', "%3C")
        .replace('>', "%3E")
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts notifications to Slack channels.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: Client,
    api_base: String,
    token: String,
    timeout: Duration,
}

impl SlackNotifier {
    /// Creates a notifier that authenticates with `token`.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        })
    }

    /// Creates a notifier from the process configuration.
    ///
    /// ## Errors
    ///
    /// Returns [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn from_config(config: &WatchConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.slack_api_base.clone(),
            config.slack_bot_token.clone(),
            config.notify_timeout,
        )
    }
}

impl Notifier for SlackNotifier {
    #[instrument(
        name = "post_message",
        skip(self, message),
        fields(target = %target, http.status_code = tracing::field::Empty)
    )]
    async fn send(&self, target: &str, message: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/api/chat.postMessage", self.api_base);
        let timeout = self.timeout;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                DeliveryError::Timeout(timeout)
            } else {
                DeliveryError::Http(e)
            }
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&PostMessage {
                channel: target,
                text: message,
            })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        Span::current().record("http.status_code", status.as_u16());

        if status.as_u16() == 429 {
            return Err(DeliveryError::RateLimited);
        }
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }

        let body: SlackResponse = response.json().await.map_err(map_err)?;
        if !body.ok {
            return Err(DeliveryError::Rejected(
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        debug!("Notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier_for(server: &MockServer) -> SlackNotifier {
        SlackNotifier::new(server.uri(), "xoxb-test", Duration::from_secs(2)).expect("notifier")
    }

    #[test]
    fn announcement_without_date_says_so() {
        let entry = Entry::new("/d/1", "First", None);
        assert_eq!(
            format_announcement("https://example.com/", "9", &entry),
            "📢 New devlog on project *9*: <https://example.com/d/1|First> (unknown date)"
        );
    }

    #[test]
    fn announcement_escapes_slack_control_characters() {
        let entry = Entry::new("/d/1?a=1&b=<2>|x", "A|B > C & D", Some("2024-01-01".to_string()));
        let message = format_announcement("https://x.test", "42", &entry);

        assert_eq!(
            message,
            "📢 New devlog on project *42*: \
             <https://x.test/d/1?a=1&amp;b=%3C2%3E%7Cx|A|B &gt; C &amp; D> (2024-01-01)"
        );
        // Exactly one link: one opening and one closing bracket.
        assert_eq!(message.matches('<').count(), 1);
        assert_eq!(message.matches('>').count(), 1);

        let link = &message[message.find('<').unwrap() + 1..message.find('>').unwrap()];
        let (target, label) = link.split_once('|').unwrap();
        assert_eq!(target, "https://x.test/d/1?a=1&amp;b=%3C2%3E%7Cx");
        assert_eq!(label, "A|B &gt; C &amp; D");
    }

    #[tokio::test]
    async fn send_posts_channel_and_text_with_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat.postMessage"))
            .and(header("Authorization", "Bearer xoxb-test"))
            .and(body_json(serde_json::json!({"channel": "C1", "text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        notifier_for(&server).send("C1", "hello").await.expect("delivered");
    }

    #[tokio::test]
    async fn api_rejection_is_a_delivery_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;

        let err = notifier_for(&server).send("C404", "hello").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(ref e) if e == "channel_not_found"));
    }

    #[tokio::test]
    async fn rate_limit_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat.postMessage"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = notifier_for(&server).send("C1", "hello").await.unwrap_err();
        assert!(matches!(err, DeliveryError::RateLimited));
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat.postMessage"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = notifier_for(&server).send("C1", "hello").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status { status: 500 }));
    }

    #[tokio::test]
    async fn slow_api_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let notifier =
            SlackNotifier::new(server.uri(), "xoxb-test", Duration::from_millis(200)).expect("notifier");
        let err = notifier.send("C1", "hello").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout(_)));
    }
}
