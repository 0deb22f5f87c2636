use analysis_sync_lib::commands::{analysis, health, quotes};
use analysis_sync_lib::config::OrchestratorArgs;
use analysis_sync_lib::error::AppError;
use analysis_sync_lib::jobs::JobRequest;
use analysis_sync_lib::state::AppState;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
/// Submit analysis jobs and keep quote data in sync against the analysis backend
struct Cli {
    /// Backend base URL. Falls back to ANALYSIS_API_BASE_URL.
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    /// Websocket URL for push quote updates.
    #[arg(long, value_name = "URL", global = true)]
    push_url: Option<String>,

    /// Directory holding the response cache database.
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    data_dir: PathBuf,

    /// Poll attempts before an analysis is abandoned.
    #[arg(long, value_name = "COUNT", global = true)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit an analysis and follow it to completion
    Analyze {
        /// Subject symbol, e.g. AAPL
        subject: String,

        /// Extra job flag as NAME=VALUE; VALUE is parsed as JSON when possible
        #[arg(long = "flag", value_name = "NAME=VALUE", value_parser = parse_flag)]
        flags: Vec<(String, Value)>,

        /// Acknowledge the analysis once it finishes
        #[arg(long)]
        ack: bool,
    },
    /// Track quotes and print the synchronized view
    Watch {
        /// Entity ids to track
        #[arg(required = true)]
        ids: Vec<String>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long, value_name = "SECONDS")]
        duration: Option<u64>,

        /// Refresh interval in milliseconds
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
    },
    /// Report runtime and cache health
    Health,
    /// Remove every cached response
    ClearCache,
}

fn parse_flag(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("flag name must not be empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "analysis_sync=info,analysis_sync_lib=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let interval_ms = match &cli.command {
        Command::Watch { interval_ms, .. } => *interval_ms,
        _ => None,
    };
    let args = OrchestratorArgs {
        base_url: cli.base_url,
        push_url: cli.push_url,
        poll_max_attempts: cli.max_attempts,
        sync_interval_ms: interval_ms,
        ..OrchestratorArgs::default()
    };
    let state = analysis_sync_lib::bootstrap(&cli.data_dir, args).await?;

    match cli.command {
        Command::Analyze {
            subject,
            flags,
            ack,
        } => run_analysis(&state, subject, flags, ack).await,
        Command::Watch { ids, duration, .. } => run_watch(&state, &ids, duration).await,
        Command::Health => print_json(&health::health(&state).await),
        Command::ClearCache => {
            let removed = state.gateway.cache().clear_namespace().await?;
            info!(removed, "cache cleared");
            Ok(())
        }
    }
}

async fn run_analysis(
    state: &AppState,
    subject: String,
    flags: Vec<(String, Value)>,
    ack: bool,
) -> Result<(), AppError> {
    let request = flags
        .into_iter()
        .fold(JobRequest::new(subject), |request, (name, value)| {
            request.with_flag(&name, value)
        });
    let session = analysis::start_analysis(state, request).await?;
    info!(subject = %session.subject, job_id = %session.job_id, "analysis started");

    if let Some(mut updates) = analysis::subscribe_analysis(state, &session.subject) {
        let progress = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = updates.borrow_and_update().clone();
                info!(
                    attempt = snapshot.attempts,
                    percentage = snapshot.status.progress.percentage,
                    workers = snapshot.timeline.len(),
                    next_ms = snapshot.next_interval_ms,
                    "{}",
                    snapshot.status.progress.message
                );
                if snapshot.state.is_terminal() {
                    break;
                }
            }
        });

        let interrupted = tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = progress => false,
        };
        if interrupted {
            analysis::cancel_analysis(state, &session.subject);
        }
    }

    let outcome = analysis::wait_for_analysis(state, &session.subject).await;
    if ack && !matches!(outcome, Err(AppError::Cancelled | AppError::PollTimeout { .. })) {
        analysis::acknowledge_analysis(state, &session.subject).await?;
    }
    print_json(&outcome?)
}

async fn run_watch(state: &AppState, ids: &[String], duration: Option<u64>) -> Result<(), AppError> {
    let session = quotes::start_quote_sync(state, ids).await?;
    info!(tracked = ?session.tracked, interval_ms = session.interval_ms, "watching quotes");

    let deadline = async {
        match duration {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(Duration::from_millis(session.interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            _ = ticker.tick() => print_json(&quotes::quote_snapshot(state).await)?,
        }
    }

    quotes::stop_quote_sync(state).await;
    Ok(())
}
