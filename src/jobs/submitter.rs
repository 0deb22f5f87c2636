use super::types::{JobHandle, JobRequest, JOBS_PATH};
use crate::cache::now_unix_ms;
use crate::error::AppError;
use crate::gateway::{ApiRequest, RequestGateway};
use serde_json::Value;
use tracing::info;

/// Issues exactly one `POST /jobs` per call.
///
/// Duplicate suppression is the caller's job (see [`super::inflight`]).
#[derive(Clone)]
pub struct JobSubmitter {
    gateway: RequestGateway,
}

impl JobSubmitter {
    pub fn new(gateway: RequestGateway) -> Self {
        Self { gateway }
    }

    pub async fn submit(&self, request: &JobRequest) -> Result<JobHandle, AppError> {
        let body = serde_json::to_value(request)?;
        let response = self
            .gateway
            .call_uncached(ApiRequest::post(JOBS_PATH, body))
            .await
            .map_err(|error| AppError::Submission(error.to_string()))?;

        let id = extract_job_id(&response).ok_or_else(|| {
            AppError::Submission("response did not include a job identifier".to_string())
        })?;

        info!(job_id = %id, subject = %request.subject, "analysis job submitted");
        Ok(JobHandle {
            id,
            submitted_at_ms: now_unix_ms(),
        })
    }
}

fn extract_job_id(response: &Value) -> Option<String> {
    ["job_id", "jobId", "id"].iter().find_map(|field| {
        match response.get(*field)? {
            Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::db::initialize_memory_pool;
    use crate::gateway::testing::{ScriptedReply, ScriptedTransport};
    use crate::gateway::{GatewaySettings, Method};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn submitter(transport: Arc<ScriptedTransport>) -> JobSubmitter {
        let pool = initialize_memory_pool()
            .await
            .expect("memory pool should initialize");
        let settings = GatewaySettings {
            rate_limit_default_wait: Duration::from_millis(1),
            ..GatewaySettings::default()
        };
        JobSubmitter::new(RequestGateway::new(
            transport,
            CacheStore::new(pool),
            settings,
        ))
    }

    #[tokio::test]
    async fn returns_handle_from_job_id() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(JOBS_PATH, ScriptedReply::ok(json!({"job_id": "job-123"})));
        let submitter = submitter(Arc::clone(&transport)).await;

        let request = JobRequest::new("AAPL").with_flag("include_news", json!(true));
        let handle = submitter.submit(&request).await.expect("submit should succeed");

        assert_eq!(handle.id, "job-123");
        assert!(handle.submitted_at_ms > 0);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(
            requests[0].body,
            Some(json!({"subject": "AAPL", "include_news": true}))
        );
    }

    #[tokio::test]
    async fn missing_job_id_is_a_submission_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(JOBS_PATH, ScriptedReply::ok(json!({"status": "queued"})));
        let submitter = submitter(Arc::clone(&transport)).await;

        let result = submitter.submit(&JobRequest::new("AAPL")).await;
        assert!(matches!(result, Err(AppError::Submission(_))));
    }

    #[tokio::test]
    async fn gateway_failure_is_a_submission_error_without_retry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(JOBS_PATH, ScriptedReply::Json(503, json!({"detail": "queue full"})));
        let submitter = submitter(Arc::clone(&transport)).await;

        match submitter.submit(&JobRequest::new("AAPL")).await {
            Err(AppError::Submission(message)) => assert!(message.contains("queue full")),
            other => panic!("expected submission error, got {other:?}"),
        }
        assert_eq!(transport.calls_to(JOBS_PATH), 1);
    }

    #[test]
    fn extracts_alternate_id_fields() {
        assert_eq!(extract_job_id(&json!({"jobId": "a"})).as_deref(), Some("a"));
        assert_eq!(extract_job_id(&json!({"id": 42})).as_deref(), Some("42"));
        assert_eq!(extract_job_id(&json!({"job_id": "  "})), None);
    }
}
