//! devlog-watch - announce new project devlogs to subscribed Slack channels

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use devlog_watch_lib::{
    CommandService, ConfigError, DevlogPageFetcher, EndpointSettings, ProjectOutcome, Scheduler,
    SchedulerConfig, SlackNotifier, SqliteStore, StoreError, TickReport, WatchConfig, server,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "devlog-watch", version)]
#[command(about = "Watch project pages for new devlogs and announce them in Slack", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    log_verbosity: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the slash-command endpoint until Ctrl-C
    Serve {
        /// Listen port (overrides $PORT)
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Run a single pass over every watched project and print the outcome
    Check {
        /// Print the pass report as JSON
        #[arg(long)]
        report_json: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("command endpoint failed: {0}")]
    Server(#[source] std::io::Error),

    #[error("scheduler task failed: {0}")]
    Scheduler(#[from] tokio::task::JoinError),

    #[error("failed to render report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("pass failed: {0}")]
    PassFailed(String),
}

type WatchScheduler = Scheduler<DevlogPageFetcher, SlackNotifier, SqliteStore, SqliteStore>;

/// Initialize tracing subscriber based on verbosity and output format
fn init_tracing(verbose: u8, json: bool) {
    // RUST_LOG wins over -v flags
    let base_filter = match std::env::var("RUST_LOG") {
        Ok(filter) => filter,
        Err(_) => match verbose {
            // Default: pass summaries and failures
            0 => "warn,devlog_watch_lib=info,devlog_watch=info".to_string(),
            1 => "info,devlog_watch_lib=debug,devlog_watch=debug".to_string(),
            2 => "info,devlog_watch_lib=trace,devlog_watch=trace".to_string(),
            _ => "debug,devlog_watch_lib=trace,devlog_watch=trace".to_string(),
        },
    };

    let filter = EnvFilter::try_new(&base_filter).unwrap_or_else(|_| EnvFilter::new("warn"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_file(verbose >= 3)
                    .with_line_number(verbose >= 3)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .init();
    }
}

fn build_scheduler(config: &WatchConfig, store: &Arc<SqliteStore>) -> Result<WatchScheduler, CliError> {
    Ok(Scheduler::new(
        DevlogPageFetcher::from_config(config)?,
        SlackNotifier::from_config(config)?,
        Arc::clone(store),
        Arc::clone(store),
        SchedulerConfig::from_watch_config(config),
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn serve(config: WatchConfig, port: Option<u16>) -> Result<(), CliError> {
    let endpoint = EndpointSettings::from_config(&config)?;
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let scheduler = Arc::new(build_scheduler(&config, &store)?);

    let commands = CommandService::new(Arc::clone(&store), config.command_prefix.clone());
    let app = server::router(
        commands,
        server::reply_client(config.notify_timeout)?,
        endpoint,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(config.port)));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| CliError::Bind { addr, source })?;

    info!(?config, "Starting devlog-watch");
    let handle = scheduler.spawn();

    let served = server::serve(listener, app, shutdown_signal()).await;

    handle.stop().await?;
    store.close().await;
    served.map_err(CliError::Server)
}

async fn check(config: WatchConfig, report_json: bool) -> Result<(), CliError> {
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let scheduler = build_scheduler(&config, &store)?;

    let report = scheduler.run_tick().await;
    store.close().await;

    if report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.store_error {
        Some(error) => Err(CliError::PassFailed(error)),
        None => Ok(()),
    }
}

fn describe(outcome: &ProjectOutcome) -> String {
    match outcome {
        ProjectOutcome::Baseline { slug } => format!("baseline recorded ({slug})"),
        ProjectOutcome::Unchanged => "no new devlog".to_string(),
        ProjectOutcome::Changed {
            slug,
            delivered,
            failed,
        } => format!("new devlog {slug}, notified {delivered}, failed {failed}"),
        ProjectOutcome::Empty => "no devlogs on page".to_string(),
        ProjectOutcome::BackedOff => "backing off".to_string(),
        ProjectOutcome::FetchFailed { error } => format!("fetch failed: {error}"),
        ProjectOutcome::StoreFailed { error } => format!("store failed: {error}"),
        ProjectOutcome::Conflict => "updated concurrently, skipped".to_string(),
    }
}

fn print_report(report: &TickReport) {
    if let Some(error) = &report.store_error {
        println!("Pass failed, no projects were checked: {error}");
        return;
    }

    if report.projects.is_empty() {
        println!("No watched projects.");
    }

    for (project, outcome) in &report.projects {
        println!("{project}: {}", describe(outcome));
    }

    println!(
        "{} change(s), {} notification(s) sent, {} fetch failure(s), {} orphaned record(s) pruned",
        report.changes(),
        report.notifications_sent(),
        report.fetch_failures(),
        report.pruned
    );
}

async fn run(command: Commands) -> Result<(), CliError> {
    let config = WatchConfig::from_env()?;

    match command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Check { report_json } => check(config, report_json).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_verbosity, cli.json);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "devlog-watch failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
