pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod normalize;
pub mod optimistic;
pub mod state;
pub mod sync;

use cache::{now_unix_ms, CacheStore};
use config::OrchestratorArgs;
use db::initialize_pool;
use error::AppError;
use state::AppState;
use std::path::Path;
use tracing::{debug, warn};

/// Opens the cache database under `data_dir`, drops expired entries and
/// wires every component for `args`.
pub async fn bootstrap(data_dir: &Path, args: OrchestratorArgs) -> Result<AppState, AppError> {
    let config = args.normalize()?;
    let db_pool = initialize_pool(data_dir).await?;

    match CacheStore::new(db_pool.clone())
        .prune_expired_at(now_unix_ms())
        .await
    {
        Ok(removed) => debug!(removed, "pruned expired cache entries"),
        Err(error) => warn!(%error, "failed to prune expired cache entries"),
    }

    AppState::new(db_pool, config)
}
