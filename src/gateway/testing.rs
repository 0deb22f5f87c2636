//! Scripted in-memory transport for exercising the gateway and its callers.

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::AppError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Json(u16, Value),
    RateLimited(Option<Duration>),
    Unreachable,
    /// Waits before answering with the inner reply.
    Delayed(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    pub fn ok(body: Value) -> Self {
        Self::Json(200, body)
    }

    pub fn delayed(delay: Duration, reply: ScriptedReply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    sticky: Mutex<HashMap<String, ScriptedReply>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-shot reply for `path`.
    pub fn push(&self, path: &str, reply: ScriptedReply) {
        self.replies
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Reply used for `path` once its queue is drained.
    pub fn always(&self, path: &str, reply: ScriptedReply) {
        self.sticky.lock().insert(path.to_string(), reply);
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, AppError> {
        self.calls.lock().push(request.clone());

        let queued = self
            .replies
            .lock()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        let mut reply = match queued {
            Some(reply) => reply,
            None => self
                .sticky
                .lock()
                .get(&request.path)
                .cloned()
                .unwrap_or(ScriptedReply::Unreachable),
        };

        while let ScriptedReply::Delayed(delay, inner) = reply {
            tokio::time::sleep(delay).await;
            reply = *inner;
        }

        match reply {
            ScriptedReply::Json(status, body) => Ok(ApiResponse {
                status,
                retry_after: None,
                body: serde_json::to_vec(&body)?,
            }),
            ScriptedReply::RateLimited(retry_after) => Ok(ApiResponse {
                status: 429,
                retry_after,
                body: br#"{"detail":"too many requests"}"#.to_vec(),
            }),
            ScriptedReply::Unreachable | ScriptedReply::Delayed(..) => Err(AppError::Network(
                format!("no route to {}", request.path),
            )),
        }
    }
}
