use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

use router_provider::UpstreamProvider;

use crate::pipeline::Plugin;

/// Bounded CAS retry limit for registry mutations: under heavy
/// contention, give up after this many attempts and surface a
/// documented bounded-contention error rather than spin indefinitely.
pub const MAX_CAS_ATTEMPTS: usize = 100;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("CAS contention exceeded after {0} attempts")]
    ContentionExceeded(usize),
    #[error("no entry named {0}")]
    NotFound(String),
}

/// A named, registry-managed provider entry.
pub struct ProviderEntry {
    pub key: String,
    pub provider: Arc<dyn UpstreamProvider>,
}

/// Copy-on-write, CAS-retried immutable-slice registry of providers: an
/// atomic pointer to an immutable slice, where all structural updates go
/// through copy-on-write plus CAS retry rather than a lock.
#[derive(Default)]
pub struct ProvidersRegistry {
    snapshot: ArcSwap<Vec<Arc<ProviderEntry>>>,
}

impl ProvidersRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn load(&self) -> Arc<Vec<Arc<ProviderEntry>>> {
        self.snapshot.load_full()
    }

    pub fn get(&self, key: &str) -> Option<Arc<ProviderEntry>> {
        self.load().iter().find(|e| e.key == key).cloned()
    }

    /// Appends or replaces an entry by key via copy-on-write + bounded CAS
    /// retry.
    pub fn upsert(&self, key: &str, provider: Arc<dyn UpstreamProvider>) -> Result<(), RegistryError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.snapshot.load();
            let mut next: Vec<Arc<ProviderEntry>> = current
                .iter()
                .filter(|e| e.key != key)
                .cloned()
                .collect();
            next.push(Arc::new(ProviderEntry {
                key: key.to_string(),
                provider: provider.clone(),
            }));
            let prev_ptr = Arc::as_ptr(&current);
            let next_arc = Arc::new(next);
            let swapped = self.snapshot.compare_and_swap(&current, next_arc);
            if Arc::as_ptr(&swapped) == prev_ptr {
                return Ok(());
            }
        }
        Err(RegistryError::ContentionExceeded(MAX_CAS_ATTEMPTS))
    }

    /// CAS-removes an entry by key.
    pub fn remove(&self, key: &str) -> Result<(), RegistryError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.snapshot.load();
            if !current.iter().any(|e| e.key == key) {
                return Err(RegistryError::NotFound(key.to_string()));
            }
            let next: Vec<Arc<ProviderEntry>> =
                current.iter().filter(|e| e.key != key).cloned().collect();
            let prev_ptr = Arc::as_ptr(&current);
            let next_arc = Arc::new(next);
            let swapped = self.snapshot.compare_and_swap(&current, next_arc);
            if Arc::as_ptr(&swapped) == prev_ptr {
                return Ok(());
            }
        }
        Err(RegistryError::ContentionExceeded(MAX_CAS_ATTEMPTS))
    }
}

/// A named, registry-managed plugin entry.
pub struct PluginEntry {
    pub name: String,
    pub plugin: Arc<dyn Plugin>,
}

/// Same copy-on-write + CAS-retry shape as `ProvidersRegistry`: same
/// shape, same update discipline. `upsert` invokes `Cleanup` on the
/// replaced instance exactly once after a successful swap.
#[derive(Default)]
pub struct PluginsRegistry {
    snapshot: ArcSwap<Vec<Arc<PluginEntry>>>,
}

impl PluginsRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn load(&self) -> Arc<Vec<Arc<PluginEntry>>> {
        self.snapshot.load_full()
    }

    /// Plugins in registration order, for building a `PluginPipeline`.
    pub fn ordered_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.load().iter().map(|e| e.plugin.clone()).collect()
    }

    pub async fn upsert(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let replaced = self.cas_upsert(name, plugin)?;
        if let Some(old) = replaced {
            old.cleanup().await;
        }
        Ok(())
    }

    fn cas_upsert(
        &self,
        name: &str,
        plugin: Arc<dyn Plugin>,
    ) -> Result<Option<Arc<dyn Plugin>>, RegistryError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.snapshot.load();
            let replaced = current.iter().find(|e| e.name == name).map(|e| e.plugin.clone());
            let mut next: Vec<Arc<PluginEntry>> =
                current.iter().filter(|e| e.name != name).cloned().collect();
            next.push(Arc::new(PluginEntry {
                name: name.to_string(),
                plugin: plugin.clone(),
            }));
            let prev_ptr = Arc::as_ptr(&current);
            let next_arc = Arc::new(next);
            let swapped = self.snapshot.compare_and_swap(&current, next_arc);
            if Arc::as_ptr(&swapped) == prev_ptr {
                return Ok(replaced);
            }
        }
        Err(RegistryError::ContentionExceeded(MAX_CAS_ATTEMPTS))
    }

    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let removed = self.cas_remove(name)?;
        removed.cleanup().await;
        Ok(())
    }

    fn cas_remove(&self, name: &str) -> Result<Arc<dyn Plugin>, RegistryError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.snapshot.load();
            let Some(found) = current.iter().find(|e| e.name == name).map(|e| e.plugin.clone()) else {
                return Err(RegistryError::NotFound(name.to_string()));
            };
            let next: Vec<Arc<PluginEntry>> =
                current.iter().filter(|e| e.name != name).cloned().collect();
            let prev_ptr = Arc::as_ptr(&current);
            let next_arc = Arc::new(next);
            let swapped = self.snapshot.compare_and_swap(&current, next_arc);
            if Arc::as_ptr(&swapped) == prev_ptr {
                return Ok(found);
            }
        }
        Err(RegistryError::ContentionExceeded(MAX_CAS_ATTEMPTS))
    }
}
