//! Adaptive status polling for a submitted job.
//!
//! A poll loop waits on its backoff interval, fetches status, merges progress
//! and stops on a terminal state, on cancellation, or once the attempt budget
//! is spent. Ticks are strictly sequential. Transport errors never end the
//! loop on their own.

use super::progress::{self, Timeline};
use super::types::{result_path, status_path, JobHandle, JobState, JobStatus};
use crate::cache::now_unix_ms;
use crate::error::AppError;
use crate::gateway::{CachePolicy, RequestGateway};
use crate::normalize::{normalize, NormalizeContext, NormalizedResult};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_MAX_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 180;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_POLL_INITIAL_INTERVAL,
            max_interval: DEFAULT_POLL_MAX_INTERVAL,
            multiplier: DEFAULT_POLL_MULTIPLIER,
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }
}

/// Geometric backoff capped at `max_interval`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(settings: &PollerSettings) -> Self {
        let initial = settings.initial_interval.min(settings.max_interval);
        Self {
            initial,
            max: settings.max_interval,
            multiplier: settings.multiplier.max(1.0),
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grows the interval after a non-terminal tick.
    pub fn advance(&mut self) -> Duration {
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Interval scheduled after `ticks` non-terminal ticks.
    pub fn interval_after(settings: &PollerSettings, ticks: u32) -> Duration {
        let mut backoff = Self::new(settings);
        for _ in 0..ticks {
            if backoff.current == backoff.max {
                break;
            }
            backoff.advance();
        }
        backoff.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Initializing,
    Polling,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initializing | Self::Polling)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    pub job_id: String,
    pub state: PollState,
    pub status: JobStatus,
    pub timeline: Timeline,
    pub attempts: u32,
    pub next_interval_ms: u64,
    pub last_error: Option<String>,
    pub result: Option<NormalizedResult>,
}

impl PollSnapshot {
    pub fn initializing(job: &JobHandle) -> Self {
        Self {
            job_id: job.id.clone(),
            state: PollState::Initializing,
            status: JobStatus::default(),
            timeline: Timeline::default(),
            attempts: 0,
            next_interval_ms: 0,
            last_error: None,
            result: None,
        }
    }

    /// The outcome a terminal snapshot describes, `None` while polling.
    pub fn outcome(&self) -> Option<PollOutcome> {
        match self.state {
            PollState::Initializing | PollState::Polling => None,
            PollState::Completed => self
                .result
                .clone()
                .map(|result| PollOutcome::Completed(Box::new(result))),
            PollState::Failed => Some(PollOutcome::Failed {
                message: self
                    .status
                    .error
                    .clone()
                    .unwrap_or_else(|| "job failed without a reason".to_string()),
            }),
            PollState::TimedOut => Some(PollOutcome::TimedOut {
                attempts: self.attempts,
            }),
            PollState::Cancelled => Some(PollOutcome::Cancelled),
        }
    }
}

/// Waits until `snapshots` carries a terminal state, or its loop is gone.
pub async fn wait_for_terminal(snapshots: &mut watch::Receiver<PollSnapshot>) -> PollSnapshot {
    loop {
        {
            let current = snapshots.borrow_and_update();
            if current.state.is_terminal() {
                return current.clone();
            }
        }
        if snapshots.changed().await.is_err() {
            return snapshots.borrow().clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(Box<NormalizedResult>),
    Failed { message: String },
    TimedOut { attempts: u32 },
    Cancelled,
}

impl PollOutcome {
    pub fn state(&self) -> PollState {
        match self {
            Self::Completed(_) => PollState::Completed,
            Self::Failed { .. } => PollState::Failed,
            Self::TimedOut { .. } => PollState::TimedOut,
            Self::Cancelled => PollState::Cancelled,
        }
    }

    pub fn into_result(self) -> Result<NormalizedResult, AppError> {
        match self {
            Self::Completed(result) => Ok(*result),
            Self::Failed { message } => Err(AppError::JobFailed(message)),
            Self::TimedOut { attempts } => Err(AppError::PollTimeout { attempts }),
            Self::Cancelled => Err(AppError::Cancelled),
        }
    }
}

/// Owns one job's poll loop once started.
pub struct PollerHandle {
    job: JobHandle,
    cancel: CancellationToken,
    snapshots: watch::Receiver<PollSnapshot>,
    join_handle: JoinHandle<PollOutcome>,
}

impl PollerHandle {
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// Stops scheduling ticks. A request already in flight completes but its
    /// response is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.snapshots.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub async fn wait(self) -> PollOutcome {
        match self.join_handle.await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(job_id = %self.job.id, %error, "poll task ended abnormally");
                PollOutcome::Cancelled
            }
        }
    }
}

#[derive(Clone)]
pub struct AdaptivePoller {
    gateway: RequestGateway,
    settings: PollerSettings,
}

impl AdaptivePoller {
    pub fn new(gateway: RequestGateway, settings: PollerSettings) -> Self {
        Self { gateway, settings }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub fn start(&self, job: JobHandle, context: NormalizeContext) -> PollerHandle {
        self.start_with(job, context, ())
    }

    /// Spawns the poll loop. `held` lives exactly as long as the loop, which
    /// lets callers tie an in-flight claim to it.
    pub fn start_with<H>(&self, job: JobHandle, context: NormalizeContext, held: H) -> PollerHandle
    where
        H: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshots) = watch::channel(PollSnapshot::initializing(&job));

        let poller = self.clone();
        let task_job = job.clone();
        let task_cancel = cancel.clone();
        let join_handle = tokio::spawn(async move {
            let outcome = poller
                .run(&task_job, &context, &task_cancel, &snapshot_tx)
                .await;
            drop(held);
            outcome
        });

        PollerHandle {
            job,
            cancel,
            snapshots,
            join_handle,
        }
    }

    pub async fn run(
        &self,
        job: &JobHandle,
        context: &NormalizeContext,
        cancel: &CancellationToken,
        snapshot_tx: &watch::Sender<PollSnapshot>,
    ) -> PollOutcome {
        let status_endpoint = status_path(&job.id);
        let mut backoff = Backoff::new(&self.settings);
        let mut snapshot = PollSnapshot {
            state: PollState::Polling,
            next_interval_ms: duration_ms(backoff.current()),
            ..PollSnapshot::initializing(job)
        };
        snapshot_tx.send_replace(snapshot.clone());
        debug!(job_id = %job.id, "polling started");

        let outcome = loop {
            if snapshot.attempts >= self.settings.max_attempts {
                warn!(job_id = %job.id, attempts = snapshot.attempts, "poll attempt budget exhausted");
                break PollOutcome::TimedOut {
                    attempts: snapshot.attempts,
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => break PollOutcome::Cancelled,
                _ = tokio::time::sleep(backoff.current()) => {}
            }

            snapshot.attempts += 1;
            let response = self.gateway.call(&status_endpoint, &[], CachePolicy::Live).await;
            if cancel.is_cancelled() {
                break PollOutcome::Cancelled;
            }

            match response {
                Ok(payload) => {
                    snapshot.last_error = None;
                    let fresh = JobStatus::from_payload(&payload);
                    let reported_state = fresh.state;
                    snapshot.status.apply(fresh);
                    snapshot.timeline = progress::merge(&snapshot.timeline, &payload, now_unix_ms());

                    match reported_state {
                        JobState::Completed => match self.fetch_result(job, context).await {
                            _ if cancel.is_cancelled() => break PollOutcome::Cancelled,
                            Ok(result) => break PollOutcome::Completed(Box::new(result)),
                            Err(error) => {
                                warn!(job_id = %job.id, %error, "result fetch failed, retrying");
                                snapshot.last_error = Some(error.to_string());
                            }
                        },
                        JobState::Failed => {
                            let message = snapshot
                                .status
                                .error
                                .clone()
                                .unwrap_or_else(|| "job failed without a reason".to_string());
                            break PollOutcome::Failed { message };
                        }
                        JobState::Pending | JobState::Running => {}
                    }
                }
                Err(error) => {
                    if error.is_transient() {
                        debug!(job_id = %job.id, attempt = snapshot.attempts, %error, "transient poll failure");
                    } else {
                        warn!(job_id = %job.id, attempt = snapshot.attempts, %error, "poll failure");
                    }
                    snapshot.last_error = Some(error.to_string());
                }
            }

            if cancel.is_cancelled() {
                break PollOutcome::Cancelled;
            }

            backoff.advance();
            snapshot.next_interval_ms = duration_ms(backoff.current());
            snapshot_tx.send_replace(snapshot.clone());
        };

        snapshot.state = outcome.state();
        snapshot.next_interval_ms = 0;
        match &outcome {
            PollOutcome::Completed(result) => snapshot.result = Some((**result).clone()),
            PollOutcome::Failed { message } => {
                snapshot.status.state = JobState::Failed;
                snapshot.status.error = Some(message.clone());
            }
            PollOutcome::TimedOut { .. } | PollOutcome::Cancelled => {}
        }
        snapshot_tx.send_replace(snapshot);
        info!(job_id = %job.id, state = ?outcome.state(), "polling finished");

        outcome
    }

    async fn fetch_result(
        &self,
        job: &JobHandle,
        context: &NormalizeContext,
    ) -> Result<NormalizedResult, AppError> {
        let payload = self
            .gateway
            .call(&result_path(&job.id), &[], CachePolicy::ReadMostly)
            .await?;
        Ok(normalize(&payload, context))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
