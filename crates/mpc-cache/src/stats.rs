//! Counters and completion measurements.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

/// Where the bytes that completed a stream came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionSource {
    Server,
    Cache,
}

impl fmt::Display for CompletionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// Time from opening a stream to the client holding all of its bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCompletion {
    pub label: String,
    pub elapsed: Duration,
    pub source: CompletionSource,
}

/// Completions kept for inspection; older ones are only in the log.
pub const RECENT_COMPLETIONS: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub forwarded_batches: u64,
    pub short_circuited_batches: u64,
    pub bytes_from_server: u64,
    pub bytes_from_cache: u64,
    pub streams_completed: u64,
    pub provisional_discards: u64,
    /// Pull phases abandoned because the registry could not grow.
    pub aborted_batches: u64,
    #[serde(skip)]
    recent: VecDeque<StreamCompletion>,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(&mut self, completion: StreamCompletion) {
        info!(
            label = %completion.label,
            source = %completion.source,
            secs = completion.elapsed.as_secs(),
            micros = completion.elapsed.subsec_micros(),
            "STATISTIC"
        );
        self.streams_completed += 1;
        self.remember(completion);
    }

    /// The last [`RECENT_COMPLETIONS`] completions, oldest first.
    pub fn recent_completions(&self) -> &VecDeque<StreamCompletion> {
        &self.recent
    }

    fn remember(&mut self, completion: StreamCompletion) {
        if self.recent.len() == RECENT_COMPLETIONS {
            self.recent.pop_front();
        }
        self.recent.push_back(completion);
    }

    /// Fold another session's counters into these.
    pub fn merge(&mut self, other: &CacheStats) {
        self.forwarded_batches += other.forwarded_batches;
        self.short_circuited_batches += other.short_circuited_batches;
        self.bytes_from_server += other.bytes_from_server;
        self.bytes_from_cache += other.bytes_from_cache;
        self.streams_completed += other.streams_completed;
        self.provisional_discards += other.provisional_discards;
        self.aborted_batches += other.aborted_batches;
        for completion in &other.recent {
            self.remember(completion.clone());
        }
    }
}
