//! Change-detection scheduler.
//!
//! The [`Scheduler`] owns the fetcher, the notifier and handles to both
//! stores. Each pass walks every project that has at least one subscriber
//! and runs an independent check per project:
//!
//! 1. Fetch the project's entries (timeout, in-pass retry on rate limiting)
//! 2. Compare the newest slug with the stored one
//! 3. Compare-and-set the new slug *before* announcing anything
//! 4. Read the subscribers and send one notification per target
//!
//! A failure in one project never aborts the pass, and a failed state write
//! never leads to a notification.
//!
//! ## Overlapping passes
//!
//! Only one pass runs at a time. [`Scheduler::run_tick`] returns a
//! [`TickReport::skipped`] report without touching anything when a previous
//! pass is still in flight, and the periodic loop skips missed ticks instead
//! of bursting to catch up.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use devlog_watch_lib::{
//!     DevlogPageFetcher, Scheduler, SchedulerConfig, SlackNotifier, SqliteStore, WatchConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WatchConfig::from_env()?;
//! let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
//! let scheduler = Arc::new(Scheduler::new(
//!     DevlogPageFetcher::from_config(&config)?,
//!     SlackNotifier::from_config(&config)?,
//!     store.clone(),
//!     store,
//!     SchedulerConfig::from_watch_config(&config),
//! ));
//!
//! let handle = scheduler.spawn();
//! // ...
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Span, debug, error, info, instrument, warn};

use crate::config::{DEFAULT_PROJECT_BASE_URL, WatchConfig};
use crate::fetch::EntryFetcher;
use crate::notify::{Notifier, format_announcement};
use crate::retry::{ProjectBackoff, RetryPolicy, fetch_with_retry};
use crate::store::{DevlogStateStore, SubscriptionStore};
use crate::types::{Entry, ProjectOutcome, TickReport};

/// Tuning knobs for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Base URL that entry slugs are appended to in announcements.
    pub link_base_url: String,
    /// Maximum number of projects checked concurrently.
    pub max_concurrency: usize,
    /// Timeout for each notification send.
    pub notify_timeout: Duration,
    /// In-pass fetch retry and timeout policy.
    pub retry: RetryPolicy,
    /// Cap on the number of ticks a failing project sits out.
    pub max_backoff_ticks: u32,
    /// Whether orphaned devlog state is deleted after each pass.
    pub prune_orphans: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            link_base_url: DEFAULT_PROJECT_BASE_URL.to_string(),
            max_concurrency: 4,
            notify_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_backoff_ticks: 8,
            prune_orphans: true,
        }
    }
}

impl SchedulerConfig {
    /// Derives scheduler settings from the process configuration.
    pub fn from_watch_config(config: &WatchConfig) -> Self {
        Self {
            interval: config.interval,
            link_base_url: config.project_base_url.clone(),
            max_concurrency: config.max_concurrent_fetches,
            notify_timeout: config.notify_timeout,
            retry: RetryPolicy {
                max_retries: config.fetch_retries,
                attempt_timeout: config.fetch_timeout,
                ..RetryPolicy::default()
            },
            max_backoff_ticks: config.max_backoff_ticks,
            prune_orphans: config.prune_orphaned_state,
        }
    }
}

/// Periodic change detector and notification dispatcher.
pub struct Scheduler<F, N, S, D> {
    fetcher: F,
    notifier: N,
    subscriptions: Arc<S>,
    states: Arc<D>,
    config: SchedulerConfig,
    pass_lock: tokio::sync::Mutex<()>,
    tick: AtomicU64,
    backoff: Mutex<ProjectBackoff>,
}

impl<F, N, S, D> Scheduler<F, N, S, D>
where
    F: EntryFetcher,
    N: Notifier,
    S: SubscriptionStore,
    D: DevlogStateStore,
{
    /// Creates a scheduler. Nothing runs until [`run`](Self::run),
    /// [`spawn`](Self::spawn) or [`run_tick`](Self::run_tick) is called.
    pub fn new(
        fetcher: F,
        notifier: N,
        subscriptions: Arc<S>,
        states: Arc<D>,
        config: SchedulerConfig,
    ) -> Self {
        let backoff = ProjectBackoff::new(config.max_backoff_ticks);
        Self {
            fetcher,
            notifier,
            subscriptions,
            states,
            config,
            pass_lock: tokio::sync::Mutex::new(()),
            tick: AtomicU64::new(0),
            backoff: Mutex::new(backoff),
        }
    }

    /// Number of passes started so far.
    pub fn passes_started(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    fn backoff(&self) -> MutexGuard<'_, ProjectBackoff> {
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs one full pass over every watched project.
    ///
    /// Returns a skipped report if another pass is still running.
    #[instrument(name = "devlog_pass", skip(self), fields(tick = tracing::field::Empty))]
    pub async fn run_tick(&self) -> TickReport {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            warn!("Previous pass still running, skipping this tick");
            return TickReport::skipped();
        };

        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        Span::current().record("tick", tick);
        let mut report = TickReport::new();

        let projects = match self.subscriptions.distinct_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                error!(error = %e, "Failed to list watched projects");
                report.store_error = Some(e.to_string());
                return report;
            }
        };

        debug!(projects = projects.len(), "Starting pass");

        let checks: Vec<_> = projects
            .iter()
            .map(|project| self.check_labelled(project.clone(), tick))
            .collect();

        let outcomes: Vec<(String, ProjectOutcome)> = stream::iter(checks)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        report.projects.extend(outcomes);

        self.backoff().retain_projects(&projects);

        if self.config.prune_orphans {
            report.pruned = self.prune_orphans(&projects).await;
        }

        info!(
            projects = report.projects.len(),
            changes = report.changes(),
            notifications = report.notifications_sent(),
            fetch_failures = report.fetch_failures(),
            pruned = report.pruned,
            "Pass completed"
        );

        report
    }

    async fn prune_orphans(&self, active: &BTreeSet<String>) -> u64 {
        match self.states.prune_orphans(active).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Pruned devlog state of unwatched projects");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune orphaned devlog state");
                0
            }
        }
    }

    async fn check_labelled(&self, project: String, tick: u64) -> (String, ProjectOutcome) {
        let outcome = self.check_project(&project, tick).await;
        (project, outcome)
    }

    /// Runs the per-project check for `project` as part of pass `tick`,
    /// honouring and updating the failure backoff.
    pub async fn check_project(&self, project: &str, tick: u64) -> ProjectOutcome {
        let skip = self.backoff().should_skip(project, tick);
        if skip {
            debug!(project, "Project is backing off after repeated failures");
            return ProjectOutcome::BackedOff;
        }

        let outcome = self.detect_and_notify(project).await;

        let mut backoff = self.backoff();
        if outcome.is_fetch_failure() {
            backoff.record_failure(project, tick);
        } else {
            backoff.record_success(project);
        }

        outcome
    }

    #[instrument(name = "check_project", skip(self), fields(project = %project))]
    async fn detect_and_notify(&self, project: &str) -> ProjectOutcome {
        let fetched = fetch_with_retry(|| self.fetcher.fetch(project), &self.config.retry, project).await;

        let entries = match fetched {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Fetch failed, skipping project this tick");
                return ProjectOutcome::FetchFailed {
                    error: e.to_string(),
                };
            }
        };

        let Some(latest) = entries.into_iter().next() else {
            debug!("Page has no devlog entries");
            return ProjectOutcome::Empty;
        };

        let stored = match self.states.get(project).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to read devlog state");
                return ProjectOutcome::StoreFailed {
                    error: e.to_string(),
                };
            }
        };

        let previous = match stored.as_deref() {
            None => return self.record_baseline(project, latest).await,
            Some(previous) if previous == latest.slug => {
                debug!(slug = %latest.slug, "No new devlog");
                return ProjectOutcome::Unchanged;
            }
            Some(previous) => previous,
        };

        match self
            .states
            .compare_and_set(project, Some(previous), &latest.slug)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(slug = %latest.slug, "Devlog state advanced concurrently, not announcing");
                return ProjectOutcome::Conflict;
            }
            Err(e) => {
                error!(error = %e, "Failed to store new devlog slug, not announcing");
                return ProjectOutcome::StoreFailed {
                    error: e.to_string(),
                };
            }
        }

        info!(previous = %previous, slug = %latest.slug, "New devlog detected");
        self.announce(project, &latest).await
    }

    async fn record_baseline(&self, project: &str, latest: Entry) -> ProjectOutcome {
        match self.states.compare_and_set(project, None, &latest.slug).await {
            Ok(true) => {
                info!(slug = %latest.slug, "Recorded baseline devlog");
                ProjectOutcome::Baseline { slug: latest.slug }
            }
            Ok(false) => {
                debug!("Baseline recorded concurrently");
                ProjectOutcome::Conflict
            }
            Err(e) => {
                error!(error = %e, "Failed to store baseline devlog slug");
                ProjectOutcome::StoreFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn announce(&self, project: &str, latest: &Entry) -> ProjectOutcome {
        let targets = match self.subscriptions.subscribers_of(project).await {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "Failed to read subscribers, announcement lost");
                return ProjectOutcome::StoreFailed {
                    error: e.to_string(),
                };
            }
        };

        let message = format_announcement(&self.config.link_base_url, project, latest);
        let mut delivered = 0;
        let mut failed = 0;

        for target in &targets {
            match tokio::time::timeout(self.config.notify_timeout, self.notifier.send(target, &message))
                .await
            {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(target = %target, error = %e, "Notification delivery failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(
                        target = %target,
                        timeout_ms = self.config.notify_timeout.as_millis() as u64,
                        "Notification delivery timed out"
                    );
                }
            }
        }

        ProjectOutcome::Changed {
            slug: latest.slug.clone(),
            delivered,
            failed,
        }
    }

    /// Runs passes every `interval` until `shutdown` resolves.
    ///
    /// The first pass starts one interval after the call. A pass in progress
    /// is always allowed to finish.
    pub async fn run<Sd>(&self, shutdown: Sd)
    where
        Sd: Future<Output = ()>,
    {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Starts [`run`](Self::run) on the tokio runtime.
    ///
    /// The scheduler stops when [`SchedulerHandle::stop`] is called or the
    /// handle is dropped.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle
    where
        F: 'static,
        N: 'static,
        S: 'static,
        D: 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            self.run(async move {
                let _ = stop_rx.await;
            })
            .await;
        });

        SchedulerHandle { stop_tx, task }
    }
}

/// Handle to a scheduler started with [`Scheduler::spawn`].
#[derive(Debug)]
pub struct SchedulerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the scheduler to stop and waits for the current pass to end.
    ///
    /// ## Errors
    ///
    /// Returns a [`JoinError`] if the scheduler task panicked.
    pub async fn stop(self) -> Result<(), JoinError> {
        let _ = self.stop_tx.send(());
        self.task.await
    }
}
