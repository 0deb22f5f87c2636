//! Merges heterogeneous progress payloads into one worker timeline.
//!
//! A status payload may report workers through the `agent_executions` record
//! list, the completed / active name sets (see [`COMPLETED_WORKER_KEYS`] and
//! [`ACTIVE_WORKER_KEYS`]), and the legacy single `current_agent` field. Each distinct worker name gets exactly one
//! [`WorkerEvent`]; its position is fixed by first sighting.

use super::types::{as_percentage, worker_list, ACTIVE_WORKER_KEYS, COMPLETED_WORKER_KEYS};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub worker_name: String,
    pub state: WorkerState,
    pub percentage: f64,
    pub message: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline {
    events: Vec<WorkerEvent>,
}

impl Timeline {
    pub fn events(&self) -> &[WorkerEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, worker_name: &str) -> Option<&WorkerEvent> {
        self.events
            .iter()
            .find(|event| event.worker_name == worker_name)
    }

    pub fn completed_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| event.state == WorkerState::Completed)
            .count()
    }

    /// Inserts or overwrites the event for its worker name.
    ///
    /// A `Completed` entry is never downgraded by a later `Running` one.
    pub fn upsert(&mut self, incoming: WorkerEvent) {
        let Some(existing) = self
            .events
            .iter_mut()
            .find(|event| event.worker_name == incoming.worker_name)
        else {
            self.events.push(incoming);
            return;
        };

        match (existing.state, incoming.state) {
            (WorkerState::Completed, WorkerState::Running) => {}
            (WorkerState::Completed, WorkerState::Completed)
            | (WorkerState::Running, WorkerState::Running) => {
                existing.percentage = existing.percentage.max(incoming.percentage);
                if !incoming.message.is_empty() {
                    existing.message = incoming.message;
                }
                existing.timestamp_ms = existing.timestamp_ms.max(incoming.timestamp_ms);
            }
            (WorkerState::Running, WorkerState::Completed) => {
                existing.state = incoming.state;
                existing.percentage = incoming.percentage;
                if !incoming.message.is_empty() {
                    existing.message = incoming.message;
                }
                existing.timestamp_ms = incoming.timestamp_ms;
            }
        }
    }
}

/// Pure merge of a raw status payload onto `previous`.
///
/// Unrecognised shapes contribute nothing. `now_ms` stamps events whose
/// records carry no timestamp of their own.
pub fn merge(previous: &Timeline, payload: &Value, now_ms: i64) -> Timeline {
    let mut timeline = previous.clone();
    for event in extract_events(payload, now_ms) {
        timeline.upsert(event);
    }
    timeline
}

fn extract_events(payload: &Value, now_ms: i64) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    let progress = payload.get("progress");

    if let Some(records) = payload.get("agent_executions").and_then(Value::as_array) {
        events.extend(
            records
                .iter()
                .filter_map(|record| execution_event(record, now_ms)),
        );
    }

    let completed = worker_list(progress, COMPLETED_WORKER_KEYS);
    for name in completed.into_iter().flatten().filter_map(worker_name) {
        events.push(named_event(name, WorkerState::Completed, now_ms));
    }

    let active = worker_list(progress, ACTIVE_WORKER_KEYS);
    for name in active.into_iter().flatten().filter_map(worker_name) {
        events.push(named_event(name, WorkerState::Running, now_ms));
    }

    let legacy_current = progress
        .and_then(|node| node.get("current_agent"))
        .or_else(|| payload.get("current_agent"))
        .and_then(worker_name);
    if let Some(name) = legacy_current {
        let mut event = named_event(name, WorkerState::Running, now_ms);
        if let Some(message) = progress
            .and_then(|node| node.get("message"))
            .and_then(Value::as_str)
        {
            event.message = message.to_string();
        }
        events.push(event);
    }

    events
}

fn execution_event(record: &Value, now_ms: i64) -> Option<WorkerEvent> {
    let name = ["agent_name", "worker_name", "name", "agent"]
        .iter()
        .find_map(|field| record.get(*field).and_then(worker_name))?;

    let state = match record
        .get("status")
        .and_then(Value::as_str)
        .map(|raw| raw.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("completed" | "complete" | "done" | "success" | "failed" | "error") => {
            WorkerState::Completed
        }
        Some("running" | "in_progress" | "started" | "active") => WorkerState::Running,
        _ => return None,
    };

    let percentage = ["progress", "percentage"]
        .iter()
        .find_map(|field| record.get(*field).and_then(as_percentage))
        .unwrap_or(match state {
            WorkerState::Completed => 100.0,
            WorkerState::Running => 0.0,
        });
    let message = record
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let timestamp_ms = ["timestamp", "updated_at_ms", "completed_at_ms", "started_at_ms"]
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_i64))
        .unwrap_or(now_ms);

    Some(WorkerEvent {
        worker_name: name,
        state,
        percentage,
        message,
        timestamp_ms,
    })
}

fn named_event(name: String, state: WorkerState, now_ms: i64) -> WorkerEvent {
    WorkerEvent {
        worker_name: name,
        state,
        percentage: match state {
            WorkerState::Completed => 100.0,
            WorkerState::Running => 0.0,
        },
        message: String::new(),
        timestamp_ms: now_ms,
    }
}

fn worker_name(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
