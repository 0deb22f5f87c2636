use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub const JOBS_PATH: &str = "/jobs";

pub fn status_path(job_id: &str) -> String {
    format!("{JOBS_PATH}/{job_id}/status")
}

pub fn result_path(job_id: &str) -> String {
    format!("{JOBS_PATH}/{job_id}/result")
}

pub fn ack_path(job_id: &str) -> String {
    format!("{JOBS_PATH}/{job_id}/ack")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    pub submitted_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Lenient parse of the backend status string. Unknown values count as
    /// running so polling continues.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "submitted" | "created" => Self::Pending,
            "completed" | "complete" | "success" | "succeeded" | "done" => Self::Completed,
            "failed" | "failure" | "error" | "errored" | "cancelled" => Self::Failed,
            _ => Self::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub percentage: f64,
    pub message: String,
    pub active_workers: BTreeSet<String>,
    pub completed_workers: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    pub progress: ProgressSnapshot,
    pub error: Option<String>,
}

impl JobStatus {
    /// Reads a `GET /jobs/{id}/status` payload. Missing or malformed fields
    /// degrade to defaults.
    pub fn from_payload(payload: &Value) -> Self {
        let state = payload
            .get("status")
            .or_else(|| payload.get("state"))
            .and_then(Value::as_str)
            .map(JobState::parse_lenient)
            .unwrap_or(JobState::Running);

        let progress_node = payload.get("progress");
        let percentage = progress_node
            .and_then(|node| match node {
                Value::Object(_) => node.get("percentage").and_then(as_percentage),
                other => as_percentage(other),
            })
            .unwrap_or(0.0);
        let message = progress_node
            .and_then(|node| node.get("message"))
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let active_workers = name_set(worker_list(progress_node, ACTIVE_WORKER_KEYS));
        let completed_workers = name_set(worker_list(progress_node, COMPLETED_WORKER_KEYS));

        let error = if state == JobState::Failed {
            Some(
                payload
                    .get("error")
                    .or_else(|| payload.get("error_message"))
                    .or_else(|| payload.get("message"))
                    .and_then(Value::as_str)
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or("job failed without a reason")
                    .to_string(),
            )
        } else {
            None
        };

        Self {
            state,
            progress: ProgressSnapshot {
                percentage,
                message,
                active_workers,
                completed_workers,
            },
            error,
        }
    }

    /// Applies a freshly fetched status. Percentage and the completed set
    /// never regress; a running job never goes back to pending.
    pub fn apply(&mut self, fresh: JobStatus) {
        let percentage = self.progress.percentage.max(fresh.progress.percentage);

        let mut completed_workers = std::mem::take(&mut self.progress.completed_workers);
        completed_workers.extend(fresh.progress.completed_workers);

        let active_workers = fresh
            .progress
            .active_workers
            .into_iter()
            .filter(|name| !completed_workers.contains(name))
            .collect();

        if !fresh.progress.message.is_empty() {
            self.progress.message = fresh.progress.message;
        }

        self.state = match (self.state, fresh.state) {
            (JobState::Running, JobState::Pending) => JobState::Running,
            (_, next) => next,
        };
        self.error = if self.state == JobState::Failed {
            fresh.error
        } else {
            None
        };
        self.progress.percentage = percentage;
        self.progress.completed_workers = completed_workers;
        self.progress.active_workers = active_workers;
    }
}

/// Keys under `progress` naming the workers currently running, in lookup
/// order.
pub const ACTIVE_WORKER_KEYS: &[&str] = &["active_workers", "active_agents"];
/// Keys under `progress` naming the workers that have finished.
pub const COMPLETED_WORKER_KEYS: &[&str] = &["completed_agents", "completed_workers"];

/// First array found under `progress` for any of `keys`.
pub fn worker_list<'a>(progress: Option<&'a Value>, keys: &[&str]) -> Option<&'a Vec<Value>> {
    let progress = progress?;
    keys.iter()
        .find_map(|key| progress.get(*key).and_then(Value::as_array))
}

/// Accepts numbers or numeric strings, clamped to `0..=100`.
pub fn as_percentage(value: &Value) -> Option<f64> {
    let raw = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }?;
    raw.is_finite().then(|| raw.clamp(0.0, 100.0))
}

fn name_set(names: Option<&Vec<Value>>) -> BTreeSet<String> {
    names
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub subject: String,
    #[serde(flatten)]
    pub flags: serde_json::Map<String, Value>,
}

impl JobRequest {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            flags: serde_json::Map::new(),
        }
    }

    pub fn with_flag(mut self, name: &str, value: Value) -> Self {
        self.flags.insert(name.to_string(), value);
        self
    }

    pub fn normalize(self) -> Result<Self, AppError> {
        let subject = self.subject.trim().to_ascii_uppercase();
        if subject.is_empty() || !subject.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-') {
            return Err(AppError::InvalidArgument(
                "subject must be non-empty alphanumeric ASCII".to_string(),
            ));
        }
        if self.flags.contains_key("subject") {
            return Err(AppError::InvalidArgument(
                "flags must not override subject".to_string(),
            ));
        }

        Ok(Self {
            subject,
            flags: self.flags,
        })
    }

    /// Identity used for duplicate-submission tracking.
    pub fn logical_key(&self) -> String {
        self.subject.trim().to_ascii_uppercase()
    }
}
