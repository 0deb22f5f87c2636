use analysis_sync_lib::commands::analysis;
use analysis_sync_lib::config::OrchestratorArgs;
use analysis_sync_lib::db::initialize_memory_pool;
use analysis_sync_lib::error::AppError;
use analysis_sync_lib::gateway::testing::{ScriptedReply, ScriptedTransport};
use analysis_sync_lib::jobs::types::{result_path, status_path, JOBS_PATH};
use analysis_sync_lib::jobs::{JobRequest, PollState, WorkerState};
use analysis_sync_lib::normalize::Figure;
use analysis_sync_lib::state::AppState;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn app_state(transport: Arc<ScriptedTransport>, max_attempts: u32) -> AppState {
    let pool = initialize_memory_pool()
        .await
        .expect("memory pool should initialize");
    let config = OrchestratorArgs {
        base_url: Some("http://backend.test".to_string()),
        poll_initial_interval_ms: Some(10),
        poll_max_interval_ms: Some(20),
        poll_max_attempts: Some(max_attempts),
        rate_limit_default_wait_ms: Some(100),
        ..OrchestratorArgs::default()
    }
    .normalize_with_env(None)
    .expect("test config should be valid");
    AppState::with_transport(pool, config, transport)
}

#[tokio::test]
async fn submit_poll_and_normalize_keeps_progress_monotonic() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-42"})));
    let status = status_path("job-42");
    transport.push(
        &status,
        ScriptedReply::ok(json!({
            "status": "running",
            "progress": {"percentage": 40, "message": "fundamentals", "active_workers": ["fundamental"]}
        })),
    );
    transport.push(
        &status,
        ScriptedReply::ok(json!({
            "status": "running",
            "progress": {"percentage": 30, "completed_agents": ["fundamental"]},
            "agent_executions": [{"agent_name": "news", "status": "running", "progress": 20}]
        })),
    );
    transport.push(&status, ScriptedReply::ok(json!({"status": "completed"})));
    transport.push(
        &result_path("job-42"),
        ScriptedReply::ok(json!({
            "result": {
                "recommendation": {"action": "Strong Buy", "confidence": 72},
                "current_price": 100,
                "summary": "Solid quarter"
            }
        })),
    );
    let state = app_state(Arc::clone(&transport), 20).await;

    let session = analysis::start_analysis(&state, JobRequest::new("aapl"))
        .await
        .expect("analysis should start");
    assert_eq!(session.job_id, "job-42");

    let result = analysis::wait_for_analysis(&state, "AAPL")
        .await
        .expect("analysis should complete");

    assert_eq!(result.action, "BUY");
    assert_eq!(result.current_price, Figure::Reported(100.0));
    assert_eq!(result.target_price, Figure::Estimated(110.0));
    assert!(result.target_price.is_estimate());
    assert_eq!(result.summary, "Solid quarter");

    let status_view = analysis::analysis_status(&state, "AAPL").expect("status should exist");
    let snapshot = status_view.snapshot;
    assert_eq!(snapshot.state, PollState::Completed);
    assert_eq!(snapshot.status.progress.percentage, 40.0);
    assert_eq!(snapshot.attempts, 3);
    assert!(snapshot
        .status
        .progress
        .completed_workers
        .contains("fundamental"));
    let names: Vec<&str> = snapshot
        .timeline
        .events()
        .iter()
        .map(|event| event.worker_name.as_str())
        .collect();
    assert_eq!(names, vec!["fundamental", "news"]);
    assert_eq!(
        snapshot.timeline.get("fundamental").map(|event| event.state),
        Some(WorkerState::Completed)
    );
    assert_eq!(transport.calls_to(&status), 3);
    assert_eq!(transport.calls_to(JOBS_PATH), 1);
}

#[tokio::test]
async fn exhausted_attempt_budget_reports_timeout_once() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-7"})));
    transport.always(
        &status_path("job-7"),
        ScriptedReply::ok(json!({"status": "running", "progress": {"percentage": 5}})),
    );
    let state = app_state(Arc::clone(&transport), 4).await;

    analysis::start_analysis(&state, JobRequest::new("MSFT"))
        .await
        .expect("analysis should start");
    let error = analysis::wait_for_analysis(&state, "MSFT")
        .await
        .expect_err("analysis should time out");

    assert!(matches!(error, AppError::PollTimeout { attempts: 4 }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls_to(&status_path("job-7")), 4);
}

#[tokio::test]
async fn rate_limited_status_polls_are_retried_on_schedule() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-9"})));
    let status = status_path("job-9");
    for _ in 0..3 {
        transport.push(&status, ScriptedReply::RateLimited(Some(Duration::from_millis(1))));
    }
    transport.push(&status, ScriptedReply::ok(json!({"status": "failed", "error": "upstream quota exhausted"})));
    let state = app_state(Arc::clone(&transport), 20).await;

    analysis::start_analysis(&state, JobRequest::new("TSLA"))
        .await
        .expect("analysis should start");
    let error = analysis::wait_for_analysis(&state, "TSLA")
        .await
        .expect_err("backend failure should surface");

    match error {
        AppError::JobFailed(message) => assert_eq!(message, "upstream quota exhausted"),
        other => panic!("expected job failure, got {other:?}"),
    }
    assert_eq!(transport.calls_to(&status), 4);
}
