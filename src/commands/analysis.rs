use crate::error::AppError;
use crate::gateway::ApiRequest;
use crate::jobs::poller::wait_for_terminal;
use crate::jobs::types::ack_path;
use crate::jobs::{JobRequest, PollSnapshot, PollState};
use crate::normalize::{NormalizeContext, NormalizedResult};
use crate::optimistic::OptimisticUpdate;
use crate::state::{AnalysisSession, AppState};
use crate::sync::QuoteSynchronizer;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSessionView {
    pub subject: String,
    pub job_id: String,
    pub submitted_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStatusView {
    pub subject: String,
    pub job_id: String,
    pub acknowledged: bool,
    pub snapshot: PollSnapshot,
}

/// Submits an analysis and starts polling it.
///
/// At most one analysis per subject is in flight; the claim is released when
/// its poll loop ends.
pub async fn start_analysis(
    state: &AppState,
    request: JobRequest,
) -> Result<AnalysisSessionView, AppError> {
    let request = request.normalize()?;
    let key = request.logical_key();
    let claim = state.inflight.try_acquire(&key).ok_or_else(|| {
        AppError::InvalidArgument(format!("analysis already in flight for {key}"))
    })?;

    let job = state.submitter.submit(&request).await?;
    let context = NormalizeContext {
        subject: request.subject.clone(),
        current_price: quoted_price(&state.quotes, &key),
    };
    let poller = state.poller.start_with(job.clone(), context, claim);

    let view = AnalysisSessionView {
        subject: key.clone(),
        job_id: job.id,
        submitted_at_ms: job.submitted_at_ms,
    };
    let replaced = state.analyses.lock().insert(
        key.clone(),
        AnalysisSession {
            subject: key,
            poller,
            acknowledged: Arc::new(RwLock::new(false)),
        },
    );
    if let Some(previous) = replaced {
        previous.poller.cancel();
    }

    Ok(view)
}

/// Stops polling for `subject`. Returns whether a running loop was cancelled.
pub fn cancel_analysis(state: &AppState, subject: &str) -> bool {
    let key = subject_key(subject);
    let analyses = state.analyses.lock();
    let Some(session) = analyses.get(&key) else {
        return false;
    };
    if session.poller.is_cancelled() || session.poller.snapshot().state.is_terminal() {
        return false;
    }

    session.poller.cancel();
    info!(subject = %key, job_id = %session.poller.job().id, "analysis cancelled");
    true
}

pub fn analysis_status(state: &AppState, subject: &str) -> Option<AnalysisStatusView> {
    let key = subject_key(subject);
    let analyses = state.analyses.lock();
    analyses.get(&key).map(|session| AnalysisStatusView {
        subject: session.subject.clone(),
        job_id: session.poller.job().id.clone(),
        acknowledged: *session.acknowledged.read(),
        snapshot: session.poller.snapshot(),
    })
}

/// Live progress for `subject`, if an analysis was started for it.
pub fn subscribe_analysis(
    state: &AppState,
    subject: &str,
) -> Option<watch::Receiver<PollSnapshot>> {
    let key = subject_key(subject);
    state
        .analyses
        .lock()
        .get(&key)
        .map(|session| session.poller.subscribe())
}

/// Waits for the analysis of `subject` to reach a terminal state.
pub async fn wait_for_analysis(
    state: &AppState,
    subject: &str,
) -> Result<NormalizedResult, AppError> {
    let key = subject_key(subject);
    let mut updates = {
        let analyses = state.analyses.lock();
        let session = analyses
            .get(&key)
            .ok_or_else(|| AppError::InvalidArgument(format!("no analysis for {key}")))?;
        session.poller.subscribe()
    };

    let terminal = wait_for_terminal(&mut updates).await;
    match terminal.outcome() {
        Some(outcome) => outcome.into_result(),
        None => Err(AppError::Cancelled),
    }
}

/// Marks a finished analysis as seen, locally first, then on the backend.
/// The local flag is restored if the backend call fails.
pub async fn acknowledge_analysis(state: &AppState, subject: &str) -> Result<bool, AppError> {
    let key = subject_key(subject);
    let (flag, job_id) = {
        let analyses = state.analyses.lock();
        let session = analyses
            .get(&key)
            .ok_or_else(|| AppError::InvalidArgument(format!("no analysis for {key}")))?;
        let snapshot_state = session.poller.snapshot().state;
        if !matches!(snapshot_state, PollState::Completed | PollState::Failed) {
            return Err(AppError::InvalidArgument(format!(
                "analysis for {key} has not finished"
            )));
        }
        (
            Arc::clone(&session.acknowledged),
            session.poller.job().id.clone(),
        )
    };

    if *flag.read() {
        return Ok(false);
    }

    let gateway = state.gateway.clone();
    OptimisticUpdate::apply(&*flag, |acknowledged| *acknowledged = true, async move {
        gateway
            .call_uncached(ApiRequest::post(ack_path(&job_id), json!({})))
            .await
            .map(|_| ())
    })
    .await?;

    Ok(true)
}

fn subject_key(subject: &str) -> String {
    JobRequest::new(subject).logical_key()
}

/// Latest synchronized price for `subject`, if it is being tracked.
fn quoted_price(quotes: &QuoteSynchronizer, subject: &str) -> Option<f64> {
    let entry = quotes.get(subject)?;
    let price = match &entry.value {
        Value::Object(fields) => ["price", "current_price", "last"]
            .iter()
            .find_map(|field| fields.get(*field).and_then(Value::as_f64)),
        other => other.as_f64(),
    }?;
    (price.is_finite() && price > 0.0).then_some(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorArgs;
    use crate::db::initialize_memory_pool;
    use crate::gateway::testing::{ScriptedReply, ScriptedTransport};
    use crate::jobs::types::{result_path, status_path, JOBS_PATH};
    use crate::normalize::Figure;
    use crate::sync::PushUpdate;

    async fn app_state(transport: Arc<ScriptedTransport>, poll_interval_ms: u64) -> AppState {
        let pool = initialize_memory_pool()
            .await
            .expect("memory pool should initialize");
        let config = OrchestratorArgs {
            poll_initial_interval_ms: Some(poll_interval_ms),
            poll_max_interval_ms: Some(poll_interval_ms),
            rate_limit_default_wait_ms: Some(100),
            ..OrchestratorArgs::default()
        }
        .normalize_with_env(None)
        .expect("test config should be valid");
        AppState::with_transport(pool, config, transport)
    }

    #[tokio::test]
    async fn rejects_second_analysis_for_same_subject() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-1"})));
        transport.always(&status_path("job-1"), ScriptedReply::ok(json!({"status": "running"})));
        let state = app_state(Arc::clone(&transport), 60_000).await;

        start_analysis(&state, JobRequest::new("aapl"))
            .await
            .expect("first submission should start");
        let error = start_analysis(&state, JobRequest::new(" AAPL "))
            .await
            .expect_err("duplicate should be rejected");

        assert_eq!(
            error.to_string(),
            AppError::InvalidArgument("analysis already in flight for AAPL".to_string())
                .to_string()
        );
        assert_eq!(transport.calls_to(JOBS_PATH), 1);
        assert!(cancel_analysis(&state, "aapl"));
    }

    #[tokio::test]
    async fn failed_submission_releases_claim() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(JOBS_PATH, ScriptedReply::Json(500, json!({"detail": "boom"})));
        transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-2"})));
        transport.always(&status_path("job-2"), ScriptedReply::ok(json!({"status": "running"})));
        let state = app_state(Arc::clone(&transport), 60_000).await;

        let error = start_analysis(&state, JobRequest::new("MSFT"))
            .await
            .expect_err("server error should fail submission");
        assert!(matches!(error, AppError::Submission(_)));
        assert!(!state.inflight.contains("MSFT"));

        start_analysis(&state, JobRequest::new("MSFT"))
            .await
            .expect("retry should be accepted");
        cancel_analysis(&state, "MSFT");
    }

    #[tokio::test]
    async fn completed_analysis_releases_claim_and_exposes_result() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-3"})));
        transport.push(&status_path("job-3"), ScriptedReply::ok(json!({"status": "completed"})));
        transport.push(&result_path("job-3"), ScriptedReply::ok(json!({"action": "buy"})));
        let state = app_state(Arc::clone(&transport), 10).await;
        state.quotes.track(["NVDA"]);
        state.quotes.apply_push(PushUpdate {
            id: "NVDA".to_string(),
            value: json!({"price": 50.0}),
        });

        start_analysis(&state, JobRequest::new("nvda"))
            .await
            .expect("submission should start");
        let result = wait_for_analysis(&state, "NVDA")
            .await
            .expect("analysis should complete");

        assert_eq!(result.action, "BUY");
        assert_eq!(result.current_price, Figure::Reported(50.0));
        assert_eq!(result.target_price, Figure::Estimated(55.0));
        let status = analysis_status(&state, "nvda").expect("status should exist");
        assert_eq!(status.snapshot.state, PollState::Completed);
        assert!(!cancel_analysis(&state, "NVDA"));

        tokio::task::yield_now().await;
        let mut released = false;
        for _ in 0..50 {
            if !state.inflight.contains("NVDA") {
                released = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert!(released);
    }

    #[tokio::test]
    async fn acknowledgement_rolls_back_on_backend_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-4"})));
        transport.push(
            &status_path("job-4"),
            ScriptedReply::ok(json!({"status": "failed", "error": "no data"})),
        );
        transport.push(&ack_path("job-4"), ScriptedReply::Unreachable);
        transport.push(&ack_path("job-4"), ScriptedReply::ok(json!({})));
        let state = app_state(Arc::clone(&transport), 10).await;

        start_analysis(&state, JobRequest::new("TSLA"))
            .await
            .expect("submission should start");
        let error = wait_for_analysis(&state, "TSLA")
            .await
            .expect_err("job should fail");
        assert!(matches!(error, AppError::JobFailed(ref message) if message == "no data"));

        assert!(acknowledge_analysis(&state, "TSLA").await.is_err());
        assert!(!analysis_status(&state, "TSLA").expect("status").acknowledged);

        assert!(acknowledge_analysis(&state, "TSLA").await.expect("ack should succeed"));
        assert!(analysis_status(&state, "TSLA").expect("status").acknowledged);
        assert!(!acknowledge_analysis(&state, "TSLA").await.expect("repeat ack is a no-op"));
    }

    #[tokio::test]
    async fn unknown_subject_has_no_status() {
        let state = app_state(Arc::new(ScriptedTransport::new()), 10).await;
        assert!(analysis_status(&state, "IBM").is_none());
        assert!(subscribe_analysis(&state, "IBM").is_none());
        assert!(!cancel_analysis(&state, "IBM"));
        assert!(wait_for_analysis(&state, "IBM").await.is_err());
    }
}
