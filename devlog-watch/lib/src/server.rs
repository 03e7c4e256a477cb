//! HTTP endpoint for Slack slash commands.
//!
//! Routes:
//!
//! - `GET /health` - liveness check
//! - `POST /slack/commands` - slash-command payloads (form encoded)
//!
//! Command requests must carry a valid `X-Slack-Signature` for their
//! `X-Slack-Request-Timestamp`; anything else is answered with `401` before
//! the form is parsed. Known commands are acknowledged with an empty `200`
//! right away; the reply is posted to the payload's `response_url` as an
//! ephemeral message once the store has been updated. Without a
//! `response_url` the reply is returned inline instead. A `response_url`
//! outside the configured Slack origin is refused with `400`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Form, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::commands::{Command, CommandService};
use crate::config::WatchConfig;
use crate::error::{ConfigError, DeliveryError, SignatureError};
use crate::store::SubscriptionStore;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request signature.
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

/// Header carrying the signing timestamp (unix seconds).
pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Requests signed further than this from the local clock are rejected.
pub const MAX_REQUEST_AGE_SECS: u64 = 5 * 60;

const MAX_COMMAND_BODY_BYTES: usize = 64 * 1024;

/// A slash-command payload as posted by Slack.
#[derive(Debug, Clone, Deserialize)]
pub struct SlashCommand {
    /// The invoked command, e.g. `/devlog-subscribe`.
    pub command: String,
    /// Everything typed after the command; the project id for our commands.
    #[serde(default)]
    pub text: String,
    /// Channel the command was issued in.
    pub channel_id: String,
    /// Where to post the delayed reply. Empty means reply inline.
    #[serde(default)]
    pub response_url: String,
}

#[derive(Debug, Serialize)]
struct DelayedReply<'a> {
    response_type: &'static str,
    text: &'a str,
}

/// Signing secret and reply origin for the command endpoint.
#[derive(Clone)]
pub struct EndpointSettings {
    signing_secret: Arc<[u8]>,
    response_origin: Url,
}

impl EndpointSettings {
    /// ## Errors
    ///
    /// Returns `ConfigError::Invalid` if `response_origin` is not an
    /// absolute `http(s)` URL.
    pub fn new(signing_secret: impl Into<String>, response_origin: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            name: "SLACK_RESPONSE_ORIGIN",
            reason,
        };

        let response_origin = Url::parse(response_origin).map_err(|e| invalid(e.to_string()))?;
        if !matches!(response_origin.scheme(), "http" | "https") || !response_origin.origin().is_tuple() {
            return Err(invalid(format!("'{response_origin}' is not an http(s) origin")));
        }

        let signing_secret: String = signing_secret.into();
        Ok(Self {
            signing_secret: Arc::from(signing_secret.into_bytes()),
            response_origin,
        })
    }

    /// Reads the endpoint settings from the watcher configuration.
    ///
    /// ## Errors
    ///
    /// Returns `ConfigError::Missing` without `SLACK_SIGNING_SECRET`, or
    /// `ConfigError::Invalid` for a bad `SLACK_RESPONSE_ORIGIN`.
    pub fn from_config(config: &WatchConfig) -> Result<Self, ConfigError> {
        let secret = config
            .slack_signing_secret
            .clone()
            .ok_or(ConfigError::Missing("SLACK_SIGNING_SECRET"))?;
        Self::new(secret, &config.slack_response_origin)
    }

    fn allows_response_url(&self, response_url: &str) -> bool {
        Url::parse(response_url).is_ok_and(|url| url.origin() == self.response_origin.origin())
    }
}

/// Checks a Slack request signature (`v0=<hex hmac-sha256>`) over
/// `v0:{timestamp}:{body}`.
///
/// `now` is the current unix time in seconds; timestamps more than
/// [`MAX_REQUEST_AGE_SECS`] away from it are rejected.
///
/// ## Errors
///
/// Returns the [`SignatureError`] describing why the request is not trusted.
pub fn verify_slack_signature(
    secret: &[u8],
    timestamp: &str,
    signature: &str,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let signed_at: i64 = timestamp.parse().map_err(|_| SignatureError::StaleTimestamp)?;
    if now.abs_diff(signed_at) > MAX_REQUEST_AGE_SECS {
        return Err(SignatureError::StaleTimestamp);
    }

    let expected = signature
        .strip_prefix("v0=")
        .and_then(|digest| hex::decode(digest).ok())
        .ok_or(SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::Mismatch)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

struct AppState<S> {
    commands: CommandService<S>,
    http: Client,
    endpoint: EndpointSettings,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Builds an HTTP client for delayed replies.
///
/// ## Errors
///
/// Returns `ConfigError::HttpClient` if the client cannot be built.
pub fn reply_client(timeout: Duration) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ConfigError::HttpClient)
}

/// Builds the command router.
pub fn router<S>(commands: CommandService<S>, http: Client, endpoint: EndpointSettings) -> Router
where
    S: SubscriptionStore + 'static,
{
    let slash_commands = Router::new()
        .route("/slack/commands", post(slash_command::<S>))
        .route_layer(middleware::from_fn_with_state(
            endpoint.clone(),
            verify_signature,
        ))
        .with_state(AppState {
            commands,
            http,
            endpoint,
        });

    Router::new().route("/health", get(health)).merge(slash_commands)
}

/// Serves `app` on `listener` until `shutdown` resolves.
///
/// ## Errors
///
/// Returns an I/O error if the listener fails.
pub async fn serve<Sd>(listener: TcpListener, app: Router, shutdown: Sd) -> std::io::Result<()>
where
    Sd: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "Command endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Command endpoint stopped");
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn verify_signature(
    State(endpoint): State<EndpointSettings>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, MAX_COMMAND_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Unreadable slash command body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let verified = match (
        header_str(&parts.headers, TIMESTAMP_HEADER),
        header_str(&parts.headers, SIGNATURE_HEADER),
    ) {
        (Some(timestamp), Some(signature)) => verify_slack_signature(
            &endpoint.signing_secret,
            timestamp,
            signature,
            &body,
            chrono::Utc::now().timestamp(),
        ),
        _ => Err(SignatureError::MissingHeaders),
    };

    if let Err(e) = verified {
        warn!(reason = %e, "Rejected unsigned slash command");
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }

    next.run(Request::from_parts(parts, Body::from(body))).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn slash_command<S>(
    State(state): State<AppState<S>>,
    Form(payload): Form<SlashCommand>,
) -> Response
where
    S: SubscriptionStore + 'static,
{
    debug!(command = %payload.command, channel = %payload.channel_id, "Slash command received");

    let Some(command) = state.commands.parse_command(&payload.command) else {
        return (
            StatusCode::OK,
            format!(
                "Unknown command `{}`. Try `{} <project id>`.",
                payload.command.trim(),
                state.commands.command_name(Command::Subscribe)
            ),
        )
            .into_response();
    };

    if payload.response_url.is_empty() {
        let reply = state
            .commands
            .execute(command, &payload.channel_id, &payload.text)
            .await;
        return (StatusCode::OK, reply.to_string()).into_response();
    }

    if !state.endpoint.allows_response_url(&payload.response_url) {
        warn!(
            channel = %payload.channel_id,
            response_url = %payload.response_url,
            "Refusing reply to foreign response_url"
        );
        return (StatusCode::BAD_REQUEST, "response_url is not a Slack address").into_response();
    }

    tokio::spawn(async move {
        let reply = state
            .commands
            .execute(command, &payload.channel_id, &payload.text)
            .await;

        if let Err(e) = post_reply(&state.http, &payload.response_url, &reply.to_string()).await {
            warn!(channel = %payload.channel_id, error = %e, "Failed to post command reply");
        }
    });

    StatusCode::OK.into_response()
}

async fn post_reply(http: &Client, response_url: &str, text: &str) -> Result<(), DeliveryError> {
    let response = http
        .post(response_url)
        .json(&DelayedReply {
            response_type: "ephemeral",
            text,
        })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DeliveryError::Status {
            status: status.as_u16(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::DEFAULT_SLACK_RESPONSE_ORIGIN;
    use crate::store::MemoryStore;

    const SECRET: &str = "test-signing-secret";

    fn app_replying_to(store: &Arc<MemoryStore>, origin: &str) -> Router {
        let commands = CommandService::new(store.clone(), "/devlog");
        router(
            commands,
            reply_client(Duration::from_secs(5)).expect("client"),
            EndpointSettings::new(SECRET, origin).expect("endpoint"),
        )
    }

    fn app(store: &Arc<MemoryStore>) -> Router {
        app_replying_to(store, DEFAULT_SLACK_RESPONSE_ORIGIN)
    }

    fn sign(secret: &str, timestamp: i64, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:{body}").as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn request_signed_with(secret: &str, timestamp: i64, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/slack/commands")
            .header("content-type", "application/x-www-form-urlencoded")
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, sign(secret, timestamp, &body))
            .body(Body::from(body))
            .expect("request")
    }

    fn command_request(body: String) -> Request<Body> {
        request_signed_with(SECRET, chrono::Utc::now().timestamp(), body)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    // Example request published in Slack's request-signing guide.
    const SLACK_GUIDE_BODY: &str = "token=xyzz0WbapA4vBCDEFasx0q6G&team_id=T1DC2JH3J&team_domain=testteamnow&channel_id=G8PSS9T3V&channel_name=foobar&user_id=U2CERLKJA&user_name=roadrunner&command=%2Fwebhook-collect&text=&response_url=https%3A%2F%2Fhooks.slack.com%2Fcommands%2FT1DC2JH3J%2F397700885554%2F96rGlfmibIGlgcZRskXaIFfN&trigger_id=398738663015.47445629121.803a0bc887a14d10d2c447fce8b6703c";
    const SLACK_GUIDE_SIGNATURE: &str =
        "v0=a2114d57b48eac39b9ad189dd8316235a7b4a8d21a10bd27519666489c69b503";

    #[test]
    fn verifies_slack_guide_example() {
        let secret = b"8f742231b10e8888abcd99yyyzzz85a5";
        let now = 1_531_420_618 + 10;

        assert_eq!(
            verify_slack_signature(secret, "1531420618", SLACK_GUIDE_SIGNATURE, SLACK_GUIDE_BODY.as_bytes(), now),
            Ok(())
        );
        assert_eq!(
            verify_slack_signature(
                secret,
                "1531420618",
                SLACK_GUIDE_SIGNATURE,
                SLACK_GUIDE_BODY.replace("foobar", "other").as_bytes(),
                now
            ),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_slack_signature(secret, "1531420618", SLACK_GUIDE_SIGNATURE, SLACK_GUIDE_BODY.as_bytes(), now + 3600),
            Err(SignatureError::StaleTimestamp)
        );
        assert_eq!(
            verify_slack_signature(secret, "1531420618", "a2114d57", SLACK_GUIDE_BODY.as_bytes(), now),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_slack_signature(secret, "soon", SLACK_GUIDE_SIGNATURE, SLACK_GUIDE_BODY.as_bytes(), now),
            Err(SignatureError::StaleTimestamp)
        );
    }

    #[test]
    fn endpoint_settings_need_an_http_origin() {
        assert!(EndpointSettings::new(SECRET, DEFAULT_SLACK_RESPONSE_ORIGIN).is_ok());
        assert!(EndpointSettings::new(SECRET, "hooks.slack.com").is_err());
        assert!(EndpointSettings::new(SECRET, "file:///tmp/hooks").is_err());

        let endpoint = EndpointSettings::new(SECRET, DEFAULT_SLACK_RESPONSE_ORIGIN).unwrap();
        assert!(endpoint.allows_response_url("https://hooks.slack.com/commands/T1/2/abc"));
        assert!(!endpoint.allows_response_url("http://hooks.slack.com/commands/T1/2/abc"));
        assert!(!endpoint.allows_response_url("https://hooks.slack.com.evil.test/x"));
        assert!(!endpoint.allows_response_url("http://169.254.169.254/latest/meta-data"));
        assert!(!endpoint.allows_response_url("not a url"));
    }

    #[test]
    fn endpoint_settings_require_signing_secret() {
        let env = std::collections::HashMap::from([
            ("SOM_COOKIE", "session=abc"),
            ("SLACK_BOT_TOKEN", "xoxb-1"),
        ]);
        let config = WatchConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert!(matches!(
            EndpointSettings::from_config(&config),
            Err(ConfigError::Missing("SLACK_SIGNING_SECRET"))
        ));
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let store = Arc::new(MemoryStore::new());
        let response = app(&store)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn subscribe_acknowledges_then_replies_to_response_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/reply"))
            .and(body_json(json!({
                "response_type": "ephemeral",
                "text": "✅ Subscribed to project 42!"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let body = format!(
            "command=/devlog-subscribe&text=42&channel_id=C1&response_url={}/reply",
            server.uri()
        );
        let response = app_replying_to(&store, &server.uri())
            .oneshot(command_request(body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.is_empty());

        for _ in 0..100 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(store.subscribers_of("42").await.unwrap().contains("C1"));
    }

    #[tokio::test]
    async fn reply_is_inline_without_response_url() {
        let store = Arc::new(MemoryStore::new());
        store.put("42", "C1").await.unwrap();

        let response = app(&store)
            .oneshot(command_request(
                "command=/devlog-unsubscribe&text=+42+&channel_id=C1".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "🗑️ Unsubscribed from project 42.");
        assert!(store.distinct_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_explained() {
        let store = Arc::new(MemoryStore::new());
        let response = app(&store)
            .oneshot(command_request(
                "command=/devlog-list&text=&channel_id=C1".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("Unknown command `/devlog-list`"));
        assert!(text.contains("/devlog-subscribe"));
    }

    #[tokio::test]
    async fn payload_without_channel_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let response = app(&store)
            .oneshot(command_request("command=/devlog-subscribe&text=42".to_string()))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert!(store.distinct_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forged_or_unsigned_commands_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let body = "command=/devlog-subscribe&text=42&channel_id=C1".to_string();

        let forged = request_signed_with("someone-else", chrono::Utc::now().timestamp(), body.clone());
        let response = app(&store).oneshot(forged).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let unsigned = Request::builder()
            .method("POST")
            .uri("/slack/commands")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();
        let response = app(&store).oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert!(store.distinct_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_command_with_old_timestamp_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let signed_at = chrono::Utc::now().timestamp() - 10 * 60;
        let request = request_signed_with(
            SECRET,
            signed_at,
            "command=/devlog-subscribe&text=42&channel_id=C1".to_string(),
        );

        let response = app(&store).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.distinct_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_response_url_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let body = format!(
            "command=/devlog-subscribe&text=42&channel_id=C1&response_url={}/internal",
            server.uri()
        );
        let response = app(&store).oneshot(command_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.distinct_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(serve(listener, app(&store), async move {
            let _ = stop_rx.await;
        }));

        let body = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
