//! End-to-end passes over SQLite, a mocked project host, and a mocked chat API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use devlog_watch_lib::store::{DevlogStateStore, SubscriptionStore};
use devlog_watch_lib::{
    DevlogPageFetcher, ProjectOutcome, RetryPolicy, Scheduler, SchedulerConfig, SelectorSet,
    SlackNotifier, SqliteStore,
};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn project_page(entries: &[(&str, &str, &str)]) -> String {
    let cards: String = entries
        .iter()
        .map(|(slug, title, date)| {
            format!(
                r#"<div class="devlog-card">
                     <a class="devlog-link" href="{slug}"><h3>{title}</h3></a>
                     <time datetime="{date}">{date}</time>
                   </div>"#
            )
        })
        .collect();
    format!("<html><body><main>{cards}</main></body></html>")
}

async fn mount_page(server: &MockServer, project: &str, html: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(format!("/projects/{project}")))
        .and(header("cookie", "_session=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .mount(server)
        .await;
}

async fn slack_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat.postMessage"))
        .and(header("authorization", "Bearer xoxb-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;
    server
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        interval: Duration::from_secs(60),
        link_base_url: "https://summer.hackclub.com".to_string(),
        max_concurrency: 2,
        notify_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 0,
            attempt_timeout: Duration::from_secs(5),
            ..RetryPolicy::default()
        },
        max_backoff_ticks: 1,
        prune_orphans: true,
    }
}

async fn posted_messages(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).expect("json body"))
        .collect()
}

#[tokio::test]
async fn baseline_then_change_announces_to_every_subscriber() {
    let pages = MockServer::start().await;
    let slack = slack_server().await;
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    store.put("42", "C1").await.unwrap();
    store.put("42", "C2").await.unwrap();

    let scheduler = Scheduler::new(
        DevlogPageFetcher::new(pages.uri(), "_session=abc", Duration::from_secs(5), &SelectorSet::default())
            .expect("fetcher"),
        SlackNotifier::new(slack.uri(), "xoxb-test", Duration::from_secs(5)).expect("notifier"),
        store.clone(),
        store.clone(),
        config(),
    );

    mount_page(&pages, "42", project_page(&[("/a", "Day 1", "2024-01-01")])).await;
    let report = scheduler.run_tick().await;

    assert_eq!(
        report.projects["42"],
        ProjectOutcome::Baseline {
            slug: "/a".to_string()
        }
    );
    assert_eq!(store.get("42").await.unwrap().as_deref(), Some("/a"));
    assert!(posted_messages(&slack).await.is_empty());

    mount_page(
        &pages,
        "42",
        project_page(&[("/b", "Day 2", "2024-01-02"), ("/a", "Day 1", "2024-01-01")]),
    )
    .await;
    let report = scheduler.run_tick().await;

    assert_eq!(report.notifications_sent(), 2);
    assert_eq!(store.get("42").await.unwrap().as_deref(), Some("/b"));

    let messages = posted_messages(&slack).await;
    let channels: BTreeSet<&str> = messages
        .iter()
        .filter_map(|m| m["channel"].as_str())
        .collect();
    assert_eq!(channels, BTreeSet::from(["C1", "C2"]));
    for message in &messages {
        assert_eq!(
            message["text"],
            "📢 New devlog on project *42*: <https://summer.hackclub.com/b|Day 2> (2024-01-02)"
        );
    }

    // Same head again: nothing new is sent.
    let report = scheduler.run_tick().await;
    assert_eq!(report.projects["42"], ProjectOutcome::Unchanged);
    assert_eq!(posted_messages(&slack).await.len(), 2);
}

#[tokio::test]
async fn failing_page_does_not_block_other_projects() {
    let pages = MockServer::start().await;
    let slack = slack_server().await;
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    store.put("bad", "C1").await.unwrap();
    store.put("good", "C2").await.unwrap();
    store.compare_and_set("good", None, "/g1").await.unwrap();

    Mock::given(method("GET"))
        .and(path("/projects/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&pages)
        .await;
    Mock::given(method("GET"))
        .and(path("/projects/good"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(project_page(&[("/g2", "Fresh", "2024-02-02")])),
        )
        .mount(&pages)
        .await;

    let scheduler = Scheduler::new(
        DevlogPageFetcher::new(pages.uri(), "_session=abc", Duration::from_secs(5), &SelectorSet::default())
            .expect("fetcher"),
        SlackNotifier::new(slack.uri(), "xoxb-test", Duration::from_secs(5)).expect("notifier"),
        store.clone(),
        store.clone(),
        config(),
    );

    let report = scheduler.run_tick().await;

    assert_eq!(report.fetch_failures(), 1);
    assert!(report.projects["bad"].is_fetch_failure());
    assert_eq!(store.get("bad").await.unwrap(), None);
    assert_eq!(store.get("good").await.unwrap().as_deref(), Some("/g2"));

    let messages = posted_messages(&slack).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["channel"], "C2");
}

#[tokio::test]
async fn unsubscribed_project_state_is_pruned() {
    let pages = MockServer::start().await;
    let slack = slack_server().await;
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    store.compare_and_set("gone", None, "/old").await.unwrap();

    let scheduler = Scheduler::new(
        DevlogPageFetcher::new(pages.uri(), "_session=abc", Duration::from_secs(5), &SelectorSet::default())
            .expect("fetcher"),
        SlackNotifier::new(slack.uri(), "xoxb-test", Duration::from_secs(5)).expect("notifier"),
        store.clone(),
        store.clone(),
        config(),
    );

    let report = scheduler.run_tick().await;

    assert!(report.projects.is_empty());
    assert_eq!(report.pruned, 1);
    assert_eq!(store.get("gone").await.unwrap(), None);
    assert!(pages.received_requests().await.unwrap_or_default().is_empty());
}
