use std::path::{Path, PathBuf};
use std::sync::Arc;

use mpc_store::{CacheStore, FsCacheStore, FsStoreConfig, InMemoryCacheStore};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::registry::DEFAULT_MAX_TRACKED_OBJECTS;

/// Storage backend behind the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Filesystem,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the cache. Required.
    pub path: PathBuf,
    pub backend: StoreBackend,
    /// Upper bound on tracked objects per connection.
    pub max_tracked_objects: usize,
    /// `fsync` stream blobs when they are closed.
    pub sync_on_close: bool,
    /// `fsync` the index log after every commit.
    pub sync_index: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            backend: StoreBackend::Filesystem,
            max_tracked_objects: DEFAULT_MAX_TRACKED_OBJECTS,
            sync_on_close: false,
            sync_index: false,
        }
    }
}

impl CacheConfig {
    /// Configuration rooted at `path` with default settings.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(CacheError::Config("missing cache path".into()));
        }
        if self.max_tracked_objects == 0 {
            return Err(CacheError::Config(
                "max_tracked_objects must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn store_config(&self) -> FsStoreConfig {
        FsStoreConfig {
            sync_on_close: self.sync_on_close,
            sync_index: self.sync_index,
        }
    }

    /// Open the configured backend.
    pub fn open_store(&self) -> CacheResult<Arc<dyn CacheStore>> {
        self.validate()?;
        let store: Arc<dyn CacheStore> = match self.backend {
            StoreBackend::Memory => Arc::new(InMemoryCacheStore::new()),
            StoreBackend::Filesystem => {
                std::fs::create_dir_all(&self.path)?;
                Arc::new(FsCacheStore::open(&self.path, self.store_config())?)
            }
        };
        Ok(store)
    }
}
