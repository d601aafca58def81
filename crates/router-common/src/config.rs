use std::time::Duration;

/// Process-wide options recognized by the core. Per-provider
/// `concurrency`/`bufferSize` live on `ProviderConfig` in `router-provider`
/// instead, since they are keyed by provider.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Warm-up count for each object pool.
    pub initial_pool_size: usize,
    /// When true, full-queue sends fail immediately instead of blocking.
    pub drop_excess_requests: bool,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub max_pagination_requests: u32,
    pub default_page_size: u32,
    pub send_back_raw_request: bool,
    pub send_back_raw_response: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_pool_size: 16,
            drop_excess_requests: false,
            max_retries: 2,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_cap: Duration::from_secs(10),
            max_pagination_requests: 1000,
            default_page_size: 100,
            send_back_raw_request: false,
            send_back_raw_response: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required engine config field: {0}")]
    MissingField(&'static str),
}

/// Optional layer used for merging engine config: CLI > ENV > file, then
/// folded into a finalized `EngineConfig` via `overlay`/`into_config`.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigPatch {
    pub initial_pool_size: Option<usize>,
    pub drop_excess_requests: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_backoff_base_ms: Option<u64>,
    pub retry_backoff_cap_ms: Option<u64>,
    pub max_pagination_requests: Option<u32>,
    pub default_page_size: Option<u32>,
    pub send_back_raw_request: Option<bool>,
    pub send_back_raw_response: Option<bool>,
}

impl EngineConfigPatch {
    pub fn overlay(&mut self, other: EngineConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(initial_pool_size);
        take!(drop_excess_requests);
        take!(max_retries);
        take!(retry_backoff_base_ms);
        take!(retry_backoff_cap_ms);
        take!(max_pagination_requests);
        take!(default_page_size);
        take!(send_back_raw_request);
        take!(send_back_raw_response);
    }

    pub fn into_config(self) -> Result<EngineConfig, GlobalConfigError> {
        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            initial_pool_size: self.initial_pool_size.unwrap_or(defaults.initial_pool_size),
            drop_excess_requests: self
                .drop_excess_requests
                .unwrap_or(defaults.drop_excess_requests),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff_base: self
                .retry_backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff_base),
            retry_backoff_cap: self
                .retry_backoff_cap_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff_cap),
            max_pagination_requests: self
                .max_pagination_requests
                .unwrap_or(defaults.max_pagination_requests),
            default_page_size: self.default_page_size.unwrap_or(defaults.default_page_size),
            send_back_raw_request: self
                .send_back_raw_request
                .unwrap_or(defaults.send_back_raw_request),
            send_back_raw_response: self
                .send_back_raw_response
                .unwrap_or(defaults.send_back_raw_response),
        })
    }
}

impl From<EngineConfig> for EngineConfigPatch {
    fn from(value: EngineConfig) -> Self {
        Self {
            initial_pool_size: Some(value.initial_pool_size),
            drop_excess_requests: Some(value.drop_excess_requests),
            max_retries: Some(value.max_retries),
            retry_backoff_base_ms: Some(value.retry_backoff_base.as_millis() as u64),
            retry_backoff_cap_ms: Some(value.retry_backoff_cap.as_millis() as u64),
            max_pagination_requests: Some(value.max_pagination_requests),
            default_page_size: Some(value.default_page_size),
            send_back_raw_request: Some(value.send_back_raw_request),
            send_back_raw_response: Some(value.send_back_raw_response),
        }
    }
}
