use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use router_provider::{Account, AccountError, Key, ProviderConfig};

/// A single configured provider entry in the accounts file.
#[derive(Debug, Clone, Deserialize)]
struct ProviderEntry {
    #[serde(flatten)]
    config: ProviderConfig,
    #[serde(default)]
    keys: Vec<Key>,
}

/// Shape of the on-disk accounts file: `{ "providers": { name: {...} } }`.
/// Persisted state across restarts lives entirely in the gateway, not
/// `router-engine`.
#[derive(Debug, Clone, Deserialize)]
struct AccountsFile {
    providers: HashMap<String, ProviderEntry>,
}

/// File-backed `Account`. Loaded once at startup and held read-only in
/// memory; there is no live-reload endpoint for it, unlike
/// `Dispatcher::update_provider`, which only rotates the runtime queue.
pub struct FileAccount {
    providers: HashMap<String, ProviderEntry>,
}

impl FileAccount {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading accounts file {}: {e}", path.as_ref().display()))?;
        let parsed: AccountsFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing accounts file {}: {e}", path.as_ref().display()))?;
        Ok(Self {
            providers: parsed.providers,
        })
    }
}

#[async_trait]
impl Account for FileAccount {
    async fn configured_providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    async fn config_for_provider(&self, id: &str) -> Result<ProviderConfig, AccountError> {
        self.providers
            .get(id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| AccountError::UnknownProvider(id.to_string()))
    }

    async fn keys_for_provider(&self, id: &str) -> Result<Vec<Key>, AccountError> {
        let entry = self
            .providers
            .get(id)
            .ok_or_else(|| AccountError::UnknownProvider(id.to_string()))?;
        if entry.keys.is_empty() {
            return Err(AccountError::NoKeys(id.to_string()));
        }
        Ok(entry.keys.clone())
    }
}
