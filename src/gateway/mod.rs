//! Request gateway: cache-first reads, rate-limit fallback to stale data and
//! error normalization for every outbound backend call.

#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

use crate::cache::{cache_key, now_unix_ms, CacheEntry, CacheStore, ReadMode};
use crate::error::AppError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use transport::{ApiRequest, ApiResponse, Method, ReqwestTransport, Transport};

pub const DEFAULT_READ_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_QUOTE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(5);

const TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve fresh cache hits; store with the read-mostly TTL.
    ReadMostly,
    /// Serve fresh cache hits; store with the quote TTL.
    Quote,
    /// Always go to the network; store with the quote TTL so a stale copy
    /// exists for rate-limit fallback.
    Live,
}

impl CachePolicy {
    fn serves_fresh_hits(self) -> bool {
        !matches!(self, Self::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub read_ttl: Duration,
    pub quote_ttl: Duration,
    pub rate_limit_default_wait: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            read_ttl: DEFAULT_READ_TTL,
            quote_ttl: DEFAULT_QUOTE_TTL,
            rate_limit_default_wait: DEFAULT_RATE_LIMIT_WAIT,
        }
    }
}

impl GatewaySettings {
    fn ttl_for(&self, policy: CachePolicy) -> Duration {
        match policy {
            CachePolicy::ReadMostly => self.read_ttl,
            CachePolicy::Quote | CachePolicy::Live => self.quote_ttl,
        }
    }
}

/// A gateway reply together with when its data was obtained from the
/// backend. Cache hits report the time the entry was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub value: Value,
    pub observed_at_ms: i64,
    pub from_cache: bool,
}

#[derive(Clone)]
pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    settings: GatewaySettings,
}

impl RequestGateway {
    pub fn new(transport: Arc<dyn Transport>, cache: CacheStore, settings: GatewaySettings) -> Self {
        Self {
            transport,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Cached GET of `endpoint` with `params`.
    pub async fn call(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        policy: CachePolicy,
    ) -> Result<Value, AppError> {
        self.call_with_meta(endpoint, params, policy)
            .await
            .map(|served| served.value)
    }

    /// Like [`RequestGateway::call`], but also reports how old the served
    /// data is. Network replies are stamped with the time the request was
    /// issued.
    pub async fn call_with_meta(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        policy: CachePolicy,
    ) -> Result<Served, AppError> {
        let key = cache_key(endpoint, params);

        if policy.serves_fresh_hits() {
            if let Some(entry) = self.cached(&key, ReadMode::Fresh).await {
                debug!(key = %key, "served fresh cache entry");
                return Ok(Served::from_entry(entry));
            }
        }

        let issued_at_ms = now_unix_ms();
        let request = ApiRequest::get(endpoint, params);
        match self.dispatch(&request).await {
            Ok(value) => {
                if let Err(error) = self
                    .cache
                    .write_at(&key, &value, self.settings.ttl_for(policy), issued_at_ms)
                    .await
                {
                    warn!(key = %key, %error, "failed to store response in cache");
                }
                Ok(Served {
                    value,
                    observed_at_ms: issued_at_ms,
                    from_cache: false,
                })
            }
            Err(AppError::RateLimited { retry_after }) => {
                if let Some(entry) = self.cached(&key, ReadMode::StaleAllowed).await {
                    warn!(key = %key, "rate limited, serving stale cache entry");
                    return Ok(Served::from_entry(entry));
                }
                Err(self.wait_out_rate_limit(endpoint, retry_after).await)
            }
            Err(error) => Err(error),
        }
    }

    /// Issues `request` without consulting or populating the cache.
    pub async fn call_uncached(&self, request: ApiRequest) -> Result<Value, AppError> {
        match self.dispatch(&request).await {
            Err(AppError::RateLimited { retry_after }) => {
                Err(self.wait_out_rate_limit(&request.path, retry_after).await)
            }
            other => other,
        }
    }

    async fn cached(&self, key: &str, mode: ReadMode) -> Option<CacheEntry<Value>> {
        match self.cache.read::<Value>(key, mode).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(key, %error, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn wait_out_rate_limit(&self, endpoint: &str, retry_after: Duration) -> AppError {
        warn!(
            endpoint,
            wait_ms = retry_after.as_millis() as u64,
            "rate limited without cached fallback"
        );
        tokio::time::sleep(retry_after).await;
        AppError::RateLimited { retry_after }
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<Value, AppError> {
        let response = self.transport.send(request).await?;
        interpret_response(response, self.settings.rate_limit_default_wait)
    }
}

impl Served {
    fn from_entry(entry: CacheEntry<Value>) -> Self {
        Self {
            value: entry.value,
            observed_at_ms: entry.written_at_ms,
            from_cache: true,
        }
    }
}

fn interpret_response(response: ApiResponse, default_wait: Duration) -> Result<Value, AppError> {
    if response.status == TOO_MANY_REQUESTS {
        return Err(AppError::RateLimited {
            retry_after: response.retry_after.unwrap_or(default_wait),
        });
    }

    if !response.is_success() {
        return Err(AppError::Server {
            status: response.status,
            message: server_error_message(response.body),
        });
    }

    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }

    let mut body = response.body;
    Ok(simd_json::serde::from_slice::<Value>(body.as_mut_slice())?)
}

fn server_error_message(body: Vec<u8>) -> String {
    let mut owned = body.clone();
    if let Ok(payload) = simd_json::serde::from_slice::<Value>(owned.as_mut_slice()) {
        for field in ["detail", "message", "error"] {
            if let Some(message) = payload.get(field).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }

    let text = String::from_utf8_lossy(&body).trim().to_string();
    if text.is_empty() {
        "empty error response".to_string()
    } else {
        text
    }
}
