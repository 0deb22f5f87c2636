use crate::error::AppError;
use crate::gateway::GatewaySettings;
use crate::jobs::PollerSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const BASE_URL_ENV: &str = "ANALYSIS_API_BASE_URL";

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_READ_TTL_MS: u64 = 300_000;
pub const DEFAULT_QUOTE_TTL_MS: u64 = 60_000;
pub const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INITIAL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_MAX_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_POLL_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 180;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

pub const MIN_TTL_MS: u64 = 1_000;
pub const MAX_TTL_MS: u64 = 86_400_000;
pub const MIN_RATE_LIMIT_WAIT_MS: u64 = 100;
pub const MAX_RATE_LIMIT_WAIT_MS: u64 = 120_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 10;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;
pub const MIN_POLL_MULTIPLIER: f64 = 1.0;
pub const MAX_POLL_MULTIPLIER: f64 = 4.0;
pub const MIN_POLL_MAX_ATTEMPTS: u32 = 1;
pub const MAX_POLL_MAX_ATTEMPTS: u32 = 10_000;
pub const MIN_SYNC_INTERVAL_MS: u64 = 1_000;
pub const MAX_SYNC_INTERVAL_MS: u64 = 3_600_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorArgs {
    pub base_url: Option<String>,
    pub read_ttl_ms: Option<u64>,
    pub quote_ttl_ms: Option<u64>,
    pub rate_limit_default_wait_ms: Option<u64>,
    pub poll_initial_interval_ms: Option<u64>,
    pub poll_max_interval_ms: Option<u64>,
    pub poll_multiplier: Option<f64>,
    pub poll_max_attempts: Option<u32>,
    pub sync_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub push_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub base_url: String,
    pub read_ttl_ms: u64,
    pub quote_ttl_ms: u64,
    pub rate_limit_default_wait_ms: u64,
    pub poll_initial_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_multiplier: f64,
    pub poll_max_attempts: u32,
    pub sync_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub push_url: Option<String>,
}

impl OrchestratorArgs {
    pub fn normalize(self) -> Result<OrchestratorConfig, AppError> {
        let env_base_url = std::env::var(BASE_URL_ENV).ok();
        self.normalize_with_env(env_base_url)
    }

    /// Same as [`normalize`](Self::normalize) with the environment fallback
    /// supplied by the caller.
    pub fn normalize_with_env(
        self,
        env_base_url: Option<String>,
    ) -> Result<OrchestratorConfig, AppError> {
        let base_url = self
            .base_url
            .or(env_base_url)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "baseUrl must start with http:// or https://".to_string(),
            ));
        }
        let base_url = base_url.trim_end_matches('/').to_string();

        let read_ttl_ms = bounded(
            "readTtlMs",
            self.read_ttl_ms.unwrap_or(DEFAULT_READ_TTL_MS),
            MIN_TTL_MS,
            MAX_TTL_MS,
        )?;
        let quote_ttl_ms = bounded(
            "quoteTtlMs",
            self.quote_ttl_ms.unwrap_or(DEFAULT_QUOTE_TTL_MS),
            MIN_TTL_MS,
            MAX_TTL_MS,
        )?;
        let rate_limit_default_wait_ms = bounded(
            "rateLimitDefaultWaitMs",
            self.rate_limit_default_wait_ms
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_MS),
            MIN_RATE_LIMIT_WAIT_MS,
            MAX_RATE_LIMIT_WAIT_MS,
        )?;
        let poll_initial_interval_ms = bounded(
            "pollInitialIntervalMs",
            self.poll_initial_interval_ms
                .unwrap_or(DEFAULT_POLL_INITIAL_INTERVAL_MS),
            MIN_POLL_INTERVAL_MS,
            MAX_POLL_INTERVAL_MS,
        )?;
        let poll_max_interval_ms = bounded(
            "pollMaxIntervalMs",
            self.poll_max_interval_ms
                .unwrap_or(DEFAULT_POLL_MAX_INTERVAL_MS),
            MIN_POLL_INTERVAL_MS,
            MAX_POLL_INTERVAL_MS,
        )?;
        if poll_max_interval_ms < poll_initial_interval_ms {
            return Err(AppError::InvalidArgument(
                "pollMaxIntervalMs must not be below pollInitialIntervalMs".to_string(),
            ));
        }

        let poll_multiplier = self.poll_multiplier.unwrap_or(DEFAULT_POLL_MULTIPLIER);
        if !poll_multiplier.is_finite()
            || !(MIN_POLL_MULTIPLIER..=MAX_POLL_MULTIPLIER).contains(&poll_multiplier)
        {
            return Err(AppError::InvalidArgument(format!(
                "pollMultiplier must be between {MIN_POLL_MULTIPLIER} and {MAX_POLL_MULTIPLIER}"
            )));
        }

        let poll_max_attempts = self.poll_max_attempts.unwrap_or(DEFAULT_POLL_MAX_ATTEMPTS);
        if !(MIN_POLL_MAX_ATTEMPTS..=MAX_POLL_MAX_ATTEMPTS).contains(&poll_max_attempts) {
            return Err(AppError::InvalidArgument(format!(
                "pollMaxAttempts must be between {MIN_POLL_MAX_ATTEMPTS} and {MAX_POLL_MAX_ATTEMPTS}"
            )));
        }

        let sync_interval_ms = bounded(
            "syncIntervalMs",
            self.sync_interval_ms.unwrap_or(DEFAULT_SYNC_INTERVAL_MS),
            MIN_SYNC_INTERVAL_MS,
            MAX_SYNC_INTERVAL_MS,
        )?;
        let request_timeout_ms = bounded(
            "requestTimeoutMs",
            self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            MIN_REQUEST_TIMEOUT_MS,
            MAX_REQUEST_TIMEOUT_MS,
        )?;

        let push_url = self
            .push_url
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(url) = &push_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(AppError::InvalidArgument(
                    "pushUrl must start with ws:// or wss://".to_string(),
                ));
            }
        }

        Ok(OrchestratorConfig {
            base_url,
            read_ttl_ms,
            quote_ttl_ms,
            rate_limit_default_wait_ms,
            poll_initial_interval_ms,
            poll_max_interval_ms,
            poll_multiplier,
            poll_max_attempts,
            sync_interval_ms,
            request_timeout_ms,
            push_url,
        })
    }
}

impl OrchestratorConfig {
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            read_ttl: Duration::from_millis(self.read_ttl_ms),
            quote_ttl: Duration::from_millis(self.quote_ttl_ms),
            rate_limit_default_wait: Duration::from_millis(self.rate_limit_default_wait_ms),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            initial_interval: Duration::from_millis(self.poll_initial_interval_ms),
            max_interval: Duration::from_millis(self.poll_max_interval_ms),
            multiplier: self.poll_multiplier,
            max_attempts: self.poll_max_attempts,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn bounded(field: &str, value: u64, min: u64, max: u64) -> Result<u64, AppError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(AppError::InvalidArgument(format!(
            "{field} must be between {min} and {max}"
        )))
    }
}
