use crate::cache::CacheStore;
use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::gateway::{ReqwestTransport, RequestGateway, Transport};
use crate::jobs::{AdaptivePoller, InFlightRegistry, JobSubmitter, PollerHandle};
use crate::sync::{QuoteSynchronizer, SyncHandle};
use parking_lot::{Mutex, RwLock};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One analysis started through the command surface, keyed by subject.
pub struct AnalysisSession {
    pub subject: String,
    pub poller: PollerHandle,
    pub acknowledged: Arc<RwLock<bool>>,
}

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub config: OrchestratorConfig,
    pub gateway: RequestGateway,
    pub submitter: JobSubmitter,
    pub poller: AdaptivePoller,
    pub inflight: InFlightRegistry,
    pub analyses: Mutex<HashMap<String, AnalysisSession>>,
    pub quotes: QuoteSynchronizer,
    pub quote_sync: tokio::sync::Mutex<Option<SyncHandle>>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: OrchestratorConfig) -> Result<Self, AppError> {
        let transport = ReqwestTransport::new(&config.base_url, config.request_timeout())?;
        Ok(Self::with_transport(db_pool, config, Arc::new(transport)))
    }

    pub fn with_transport(
        db_pool: SqlitePool,
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let gateway = RequestGateway::new(
            transport,
            CacheStore::new(db_pool.clone()),
            config.gateway_settings(),
        );
        let submitter = JobSubmitter::new(gateway.clone());
        let poller = AdaptivePoller::new(gateway.clone(), config.poller_settings());
        let quotes = QuoteSynchronizer::new(gateway.clone(), config.sync_interval());

        Self {
            started_at: Instant::now(),
            db_pool,
            config,
            gateway,
            submitter,
            poller,
            inflight: InFlightRegistry::new(),
            analyses: Mutex::new(HashMap::new()),
            quotes,
            quote_sync: tokio::sync::Mutex::new(None),
        }
    }
}
