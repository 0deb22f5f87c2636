//! Rolling view of independently refreshed entities (quotes).
//!
//! A synchronizer refreshes every tracked id on a fixed interval through the
//! request gateway and optionally accepts push updates. Each entry remembers
//! when its data was observed and where it came from, so polled data that is
//! older than a push (a slow request or a cached reply) never clobbers it.

pub mod push;

use crate::cache::now_unix_ms;
use crate::error::AppError;
use crate::gateway::{CachePolicy, RequestGateway, Served};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

pub use push::{parse_push_message, PushUpdate};

pub const ENTITIES_BATCH_PATH: &str = "/entities/batch";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Poll,
    Push,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub value: Value,
    pub updated_at_ms: i64,
    pub source: UpdateSource,
}

/// A polled value and the time its data was observed by the backend call
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
struct Polled {
    value: Value,
    observed_at_ms: i64,
}

#[derive(Default)]
struct SyncShared {
    tracked: RwLock<BTreeSet<String>>,
    entries: RwLock<BTreeMap<String, EntitySnapshot>>,
}

#[derive(Clone)]
pub struct QuoteSynchronizer {
    gateway: RequestGateway,
    interval: Duration,
    shared: Arc<SyncShared>,
}

impl QuoteSynchronizer {
    pub fn new(gateway: RequestGateway, interval: Duration) -> Self {
        Self {
            gateway,
            interval,
            shared: Arc::new(SyncShared::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts tracking `ids`. Takes effect on the next tick.
    pub fn track<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tracked = self.shared.tracked.write();
        for id in ids {
            let id = id.as_ref().trim();
            if !id.is_empty() {
                tracked.insert(id.to_string());
            }
        }
    }

    /// Stops tracking `id` and drops its entry.
    pub fn untrack(&self, id: &str) -> bool {
        let removed = self.shared.tracked.write().remove(id);
        self.shared.entries.write().remove(id);
        removed
    }

    /// Replaces the tracked set with a copy of `ids`, dropping entries for
    /// ids no longer tracked.
    pub fn replace_tracked<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next: BTreeSet<String> = ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        self.shared
            .entries
            .write()
            .retain(|id, _| next.contains(id));
        *self.shared.tracked.write() = next;
    }

    pub fn tracked(&self) -> Vec<String> {
        self.shared.tracked.read().iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<EntitySnapshot> {
        self.shared.entries.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, EntitySnapshot> {
        self.shared.entries.read().clone()
    }

    pub fn apply_push(&self, update: PushUpdate) -> bool {
        self.apply_push_at(update, now_unix_ms())
    }

    /// Overwrites one tracked entry from the push channel. Untracked ids are
    /// ignored. The poll schedule is unaffected.
    pub fn apply_push_at(&self, update: PushUpdate, now_ms: i64) -> bool {
        if !self.shared.tracked.read().contains(&update.id) {
            debug!(id = %update.id, "ignoring push for untracked entity");
            return false;
        }

        self.shared.entries.write().insert(
            update.id,
            EntitySnapshot {
                value: update.value,
                updated_at_ms: now_ms,
                source: UpdateSource::Push,
            },
        );
        true
    }

    /// Runs one refresh and returns how many entries were written.
    pub async fn refresh(&self) -> usize {
        let ids = self.tracked();
        if ids.is_empty() {
            return 0;
        }

        let values = match self.fetch_batch(&ids).await {
            Ok(values) => values,
            Err(error) => {
                warn!(count = ids.len(), %error, "batch refresh failed, fetching individually");
                self.fetch_each(&ids).await
            }
        };

        self.merge_polled(values)
    }

    /// Writes polled values unless the entry holds newer data or the id is
    /// no longer tracked. A push observed in the same millisecond wins.
    fn merge_polled(&self, values: BTreeMap<String, Polled>) -> usize {
        let tracked = self.shared.tracked.read();
        let mut entries = self.shared.entries.write();
        let mut written = 0;

        for (id, polled) in values {
            if !tracked.contains(&id) {
                continue;
            }
            if let Some(existing) = entries.get(&id) {
                let newer = existing.updated_at_ms > polled.observed_at_ms
                    || (existing.updated_at_ms == polled.observed_at_ms
                        && existing.source == UpdateSource::Push);
                if newer {
                    debug!(id = %id, "discarding poll older than latest update");
                    continue;
                }
            }
            entries.insert(
                id,
                EntitySnapshot {
                    value: polled.value,
                    updated_at_ms: polled.observed_at_ms,
                    source: UpdateSource::Poll,
                },
            );
            written += 1;
        }

        written
    }

    async fn fetch_batch(&self, ids: &[String]) -> Result<BTreeMap<String, Polled>, AppError> {
        let served = self
            .gateway
            .call_with_meta(ENTITIES_BATCH_PATH, &[("ids", ids.join(","))], CachePolicy::Quote)
            .await?;
        Ok(polled_entities(served, ids))
    }

    async fn fetch_each(&self, ids: &[String]) -> BTreeMap<String, Polled> {
        let requests = ids.iter().map(|id| async move {
            let outcome = self
                .gateway
                .call_with_meta(ENTITIES_BATCH_PATH, &[("ids", id.clone())], CachePolicy::Quote)
                .await;
            (id, outcome)
        });

        let mut values = BTreeMap::new();
        for (id, outcome) in join_all(requests).await {
            match outcome {
                Ok(served) => values.extend(polled_entities(served, std::slice::from_ref(id))),
                Err(error) => debug!(id = %id, %error, "dropping failed entity refresh"),
            }
        }
        values
    }

    /// Spawns the refresh loop and, when `push_url` is set, the push channel.
    pub fn start(&self, push_url: Option<String>) -> SyncHandle {
        let cancellation_token = CancellationToken::new();

        let synchronizer = self.clone();
        let poll_cancel = cancellation_token.clone();
        let poll_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(synchronizer.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let written = synchronizer.refresh().await;
                        debug!(written, "quote refresh tick");
                    }
                }
            }
        });

        let push_handle = push_url.map(|url| {
            tokio::spawn(push::run_push_channel(
                url,
                self.clone(),
                cancellation_token.clone(),
            ))
        });

        info!(interval_ms = self.interval.as_millis() as u64, "quote sync started");
        SyncHandle {
            synchronizer: self.clone(),
            _cancel_on_drop: cancellation_token.clone().drop_guard(),
            cancellation_token,
            poll_handle,
            push_handle,
        }
    }
}

/// Owns a running synchronizer. Dropping it cancels both loops without
/// waiting for them; `stop` also joins them.
pub struct SyncHandle {
    synchronizer: QuoteSynchronizer,
    _cancel_on_drop: DropGuard,
    cancellation_token: CancellationToken,
    poll_handle: JoinHandle<()>,
    push_handle: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn synchronizer(&self) -> &QuoteSynchronizer {
        &self.synchronizer
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled() && !self.poll_handle.is_finished()
    }

    /// Cancels both loops and waits for them to exit.
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.poll_handle.await;
        if let Some(handle) = self.push_handle {
            let _ = handle.await;
        }
        info!("quote sync stopped");
    }
}

fn polled_entities(served: Served, requested: &[String]) -> BTreeMap<String, Polled> {
    let observed_at_ms = served.observed_at_ms;
    entity_map(&served.value, requested)
        .into_iter()
        .map(|(id, value)| {
            (
                id,
                Polled {
                    value,
                    observed_at_ms,
                },
            )
        })
        .collect()
}

/// Extracts `id -> value` from a batch payload, which may be wrapped in
/// `data`. Ids not requested are dropped.
fn entity_map(payload: &Value, requested: &[String]) -> BTreeMap<String, Value> {
    let body = payload
        .get("data")
        .filter(|node| node.is_object())
        .unwrap_or(payload);
    let Some(object) = body.as_object() else {
        return BTreeMap::new();
    };

    requested
        .iter()
        .filter_map(|id| {
            object
                .get(id)
                .filter(|value| !value.is_null())
                .map(|value| (id.clone(), value.clone()))
        })
        .collect()
}
