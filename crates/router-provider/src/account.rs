use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::key::Key;

/// Per-provider concurrency/buffer sizing, used when a provider's queue
/// is first prepared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyAndBufferSize {
    pub concurrency: usize,
    pub buffer_size: usize,
}

impl Default for ConcurrencyAndBufferSize {
    fn default() -> Self {
        Self {
            concurrency: 4,
            buffer_size: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomProviderConfig {
    pub upstream_proto: String,
    pub base_url: String,
}

/// Per-provider configuration returned by the Account capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub network: NetworkConfig,
    pub concurrency_and_buffer_size: ConcurrencyAndBufferSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_provider_config: Option<CustomProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<String>,
    #[serde(default)]
    pub send_back_raw_request: bool,
    #[serde(default)]
    pub send_back_raw_response: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AccountError {
    #[error("provider not configured: {0}")]
    UnknownProvider(String),
    #[error("no keys configured for provider: {0}")]
    NoKeys(String),
}

/// The Account capability: an opaque, read-only config and
/// credential source. Persisted state across restarts is an explicit
/// Non-goal of the core; implementations may be DB-backed,
/// file-backed, or in-memory.
#[async_trait]
pub trait Account: Send + Sync {
    async fn configured_providers(&self) -> Vec<String>;

    async fn config_for_provider(&self, id: &str) -> Result<ProviderConfig, AccountError>;

    async fn keys_for_provider(&self, id: &str) -> Result<Vec<Key>, AccountError>;
}
