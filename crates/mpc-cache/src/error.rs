use std::collections::TryReserveError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object registry full: {limit} tracked objects")]
    Exhausted { limit: usize },

    #[error("allocation failed: {0}")]
    Reserve(#[from] TryReserveError),

    #[error("store error: {0}")]
    Store(#[from] mpc_store::StoreError),

    #[error("protocol error: {0}")]
    Protocol(#[from] mpc_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session lock poisoned: {0}")]
    Poisoned(String),
}

impl CacheError {
    /// Allocation failures abandon the rest of a pull phase.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Reserve(_))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
