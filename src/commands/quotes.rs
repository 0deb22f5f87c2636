use crate::error::AppError;
use crate::state::AppState;
use crate::sync::EntitySnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSyncSession {
    pub tracked: Vec<String>,
    pub interval_ms: u64,
    pub push_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSnapshotResponse {
    pub running: bool,
    pub tracked: Vec<String>,
    pub entries: BTreeMap<String, EntitySnapshot>,
}

/// Starts synchronizing `ids`, replacing any sync already running.
pub async fn start_quote_sync(
    state: &AppState,
    ids: &[String],
) -> Result<QuoteSyncSession, AppError> {
    let ids: Vec<String> = ids
        .iter()
        .map(|id| id.trim().to_ascii_uppercase())
        .filter(|id| !id.is_empty())
        .collect();
    if ids.is_empty() {
        return Err(AppError::InvalidArgument(
            "at least one quote id is required".to_string(),
        ));
    }

    let mut sync_slot = state.quote_sync.lock().await;
    if let Some(handle) = sync_slot.take() {
        handle.stop().await;
    }

    state.quotes.replace_tracked(&ids);
    *sync_slot = Some(state.quotes.start(state.config.push_url.clone()));

    Ok(QuoteSyncSession {
        tracked: state.quotes.tracked(),
        interval_ms: state.config.sync_interval_ms,
        push_enabled: state.config.push_url.is_some(),
    })
}

pub async fn stop_quote_sync(state: &AppState) -> bool {
    let existing_handle = {
        let mut sync_slot = state.quote_sync.lock().await;
        sync_slot.take()
    };

    match existing_handle {
        Some(handle) => {
            handle.stop().await;
            true
        }
        None => false,
    }
}

pub fn track_quote(state: &AppState, id: &str) -> Result<(), AppError> {
    let id = id.trim().to_ascii_uppercase();
    if id.is_empty() {
        return Err(AppError::InvalidArgument("quote id must not be empty".to_string()));
    }
    state.quotes.track([id]);
    Ok(())
}

pub fn untrack_quote(state: &AppState, id: &str) -> bool {
    state.quotes.untrack(&id.trim().to_ascii_uppercase())
}

pub async fn quote_snapshot(state: &AppState) -> QuoteSnapshotResponse {
    let running = state
        .quote_sync
        .lock()
        .await
        .as_ref()
        .is_some_and(|handle| handle.is_running());

    QuoteSnapshotResponse {
        running,
        tracked: state.quotes.tracked(),
        entries: state.quotes.snapshot(),
    }
}
