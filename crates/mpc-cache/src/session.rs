use std::fmt;
use std::sync::Arc;

use mpc_protocol::{MapiRequest, MapiResponse};
use mpc_store::CacheStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dispatch;
use crate::pull;
use crate::push;
use crate::registry::ObjectRegistry;
use crate::stats::CacheStats;

/// Identifier of one cache session (time-ordered UUID v7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache state of one client connection.
///
/// Holds the object registry for the connection and a shared handle to the
/// durable store. The three hooks must be called in order for each batch:
/// [`try_short_circuit`](Self::try_short_circuit) first; if it returns
/// `None`, [`on_outgoing_batch`](Self::on_outgoing_batch) before forwarding
/// and [`on_incoming_batch`](Self::on_incoming_batch) with the reply.
pub struct CacheSession {
    id: SessionId,
    registry: ObjectRegistry,
    store: Arc<dyn CacheStore>,
    stats: CacheStats,
    closed: bool,
}

impl CacheSession {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_registry(store, ObjectRegistry::new())
    }

    pub fn with_registry(store: Arc<dyn CacheStore>, registry: ObjectRegistry) -> Self {
        let id = SessionId::new();
        debug!(session = %id, limit = registry.limit(), "cache session opened");
        Self {
            id,
            registry,
            store,
            stats: CacheStats::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Pull hook, called before a batch is forwarded.
    pub fn on_outgoing_batch(&mut self, request: &MapiRequest) {
        if request.is_idle() {
            return;
        }
        self.stats.forwarded_batches += 1;
        if let Err(e) = pull::observe(&mut self.registry, self.store.as_ref(), request) {
            if e.is_exhaustion() {
                self.stats.aborted_batches += 1;
            }
            warn!(session = %self.id, error = %e, "pull phase abandoned");
        }
    }

    /// Answer the batch from the cache, or `None` to forward it.
    pub fn try_short_circuit(&mut self, request: &MapiRequest) -> Option<MapiResponse> {
        if request.is_idle() {
            return None;
        }
        dispatch::try_short_circuit(
            &mut self.registry,
            self.store.as_ref(),
            &mut self.stats,
            request,
        )
    }

    /// Push hook, called with the server's reply to a forwarded batch.
    pub fn on_incoming_batch(&mut self, request: &MapiRequest, response: &MapiResponse) {
        if request.is_idle() || response.is_idle() {
            return;
        }
        push::observe(
            &mut self.registry,
            self.store.as_ref(),
            &mut self.stats,
            request,
            response,
        );
    }

    /// Drop all tracked objects and close their blobs. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let streams = self.registry.drain_streams();
        for stream in &streams {
            pull::drop_blob(self.store.as_ref(), stream);
        }
        debug!(
            session = %self.id,
            streams = streams.len(),
            forwarded = self.stats.forwarded_batches,
            short_circuited = self.stats.short_circuited_batches,
            "cache session closed"
        );
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSession")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .field("closed", &self.closed)
            .finish()
    }
}
