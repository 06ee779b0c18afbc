//! Proxy module adapter.
//!
//! The hosting proxy drives modules through [`ProxyModule`]: `dispatch`
//! before a call is forwarded, `pull` just before it is sent, `push` once
//! the reply is back, and `disconnect` when the client goes away.
//! [`CacheModule`] keeps one [`CacheSession`] per connection over a single
//! shared store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use mpc_protocol::{ConnectionId, MapiRequest, MapiResponse, RpcCall};
use mpc_store::CacheStore;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::registry::{ObjectRegistry, DEFAULT_MAX_TRACKED_OBJECTS};
use crate::session::CacheSession;
use crate::stats::CacheStats;

pub const MODULE_NAME: &str = "cache";
pub const MODULE_DESCRIPTION: &str = "Cache MAPI messages and attachments";
pub const MODULE_ENDPOINT: &str = "exchange_emsmdb";

fn poisoned<E: std::fmt::Display>(e: E) -> CacheError {
    CacheError::Poisoned(e.to_string())
}

pub trait ProxyModule: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Endpoint whose calls the module sees.
    fn endpoint(&self) -> &'static str;

    /// Called just before a forwarded request is sent.
    fn pull(&self, call: &RpcCall, request: &MapiRequest) -> CacheResult<()>;

    /// Called before forwarding. `Some` replaces the server round trip.
    fn dispatch(&self, call: &RpcCall, request: &MapiRequest) -> CacheResult<Option<MapiResponse>>;

    /// Called with the server's reply to a forwarded request.
    fn push(&self, call: &RpcCall, request: &MapiRequest, response: &MapiResponse) -> CacheResult<()>;

    fn disconnect(&self, connection: ConnectionId) -> CacheResult<()>;
}

/// How a relayed call was answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    ShortCircuited,
}

/// Drive one call through `module`, calling `forward` unless the module
/// answers it. Module errors are logged and never change the reply.
pub fn relay<F>(
    module: &dyn ProxyModule,
    call: &RpcCall,
    request: &MapiRequest,
    forward: F,
) -> (MapiResponse, Outcome)
where
    F: FnOnce(&MapiRequest) -> MapiResponse,
{
    match module.dispatch(call, request) {
        Ok(Some(local)) => return (local, Outcome::ShortCircuited),
        Ok(None) => {}
        Err(e) => warn!(module = module.name(), error = %e, "dispatch failed"),
    }
    if let Err(e) = module.pull(call, request) {
        warn!(module = module.name(), error = %e, "pull failed");
    }
    let response = forward(request);
    if let Err(e) = module.push(call, request, &response) {
        warn!(module = module.name(), error = %e, "push failed");
    }
    (response, Outcome::Forwarded)
}

type SharedSession = Arc<Mutex<CacheSession>>;

pub struct CacheModule {
    store: Arc<dyn CacheStore>,
    max_tracked_objects: usize,
    sessions: RwLock<HashMap<ConnectionId, SharedSession>>,
    /// Counters of sessions already closed.
    retired: Mutex<CacheStats>,
}

impl CacheModule {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_limit(store, DEFAULT_MAX_TRACKED_OBJECTS)
    }

    pub fn with_limit(store: Arc<dyn CacheStore>, max_tracked_objects: usize) -> Self {
        Self {
            store,
            max_tracked_objects,
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(CacheStats::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        let store = config.open_store()?;
        info!(
            path = %config.path.display(),
            backend = ?config.backend,
            "cache module initialized"
        );
        Ok(Self::with_limit(store, config.max_tracked_objects))
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    fn session(&self, connection: ConnectionId) -> CacheResult<SharedSession> {
        if let Some(session) = self.sessions.read().map_err(poisoned)?.get(&connection) {
            return Ok(session.clone());
        }
        let mut sessions = self.sessions.write().map_err(poisoned)?;
        let session = sessions.entry(connection).or_insert_with(|| {
            debug!(%connection, "new connection");
            Arc::new(Mutex::new(CacheSession::with_registry(
                self.store.clone(),
                ObjectRegistry::with_limit(self.max_tracked_objects),
            )))
        });
        Ok(session.clone())
    }

    /// Calls the cache acts on: non-idle `EcDoRpc` batches.
    fn observes(call: &RpcCall, request: &MapiRequest) -> bool {
        call.is_ecdorpc() && !request.is_idle()
    }

    /// Counters across closed and live sessions.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let mut total = self.retired.lock().map_err(poisoned)?.clone();
        for session in self.sessions.read().map_err(poisoned)?.values() {
            total.merge(session.lock().map_err(poisoned)?.stats());
        }
        Ok(total)
    }

    /// Close every live session.
    pub fn shutdown(&self) -> CacheResult<()> {
        let connections: Vec<ConnectionId> =
            self.sessions.read().map_err(poisoned)?.keys().copied().collect();
        for connection in connections {
            self.disconnect(connection)?;
        }
        Ok(())
    }
}

impl ProxyModule for CacheModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn description(&self) -> &'static str {
        MODULE_DESCRIPTION
    }

    fn endpoint(&self) -> &'static str {
        MODULE_ENDPOINT
    }

    fn pull(&self, call: &RpcCall, request: &MapiRequest) -> CacheResult<()> {
        if !Self::observes(call, request) {
            return Ok(());
        }
        let session = self.session(call.connection)?;
        session.lock().map_err(poisoned)?.on_outgoing_batch(request);
        Ok(())
    }

    fn dispatch(&self, call: &RpcCall, request: &MapiRequest) -> CacheResult<Option<MapiResponse>> {
        if !Self::observes(call, request) {
            return Ok(None);
        }
        let session = self.session(call.connection)?;
        let reply = session.lock().map_err(poisoned)?.try_short_circuit(request);
        Ok(reply)
    }

    fn push(&self, call: &RpcCall, request: &MapiRequest, response: &MapiResponse) -> CacheResult<()> {
        if !Self::observes(call, request) {
            return Ok(());
        }
        let session = self.session(call.connection)?;
        session
            .lock()
            .map_err(poisoned)?
            .on_incoming_batch(request, response);
        Ok(())
    }

    fn disconnect(&self, connection: ConnectionId) -> CacheResult<()> {
        let removed = self.sessions.write().map_err(poisoned)?.remove(&connection);
        let Some(session) = removed else {
            return Ok(());
        };
        let mut session = session.lock().map_err(poisoned)?;
        session.close();
        self.retired.lock().map_err(poisoned)?.merge(session.stats());
        debug!(%connection, "connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for CacheModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheModule")
            .field("sessions", &self.session_count())
            .field("max_tracked_objects", &self.max_tracked_objects)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_protocol::{Handle, ReplyBody, ReplyCall, RequestCall};
    use mpc_store::InMemoryCacheStore;

    fn h(raw: u32) -> Handle {
        Handle::new(raw)
    }

    fn module() -> CacheModule {
        CacheModule::new(Arc::new(InMemoryCacheStore::new()))
    }

    fn open_message(module: &CacheModule, call: &RpcCall, handle: u32) {
        let request = MapiRequest::new(
            vec![RequestCall::open_message(0, 1, 10, 55)],
            vec![h(0x10), Handle::UNSET],
        );
        let (_, outcome) = relay(module, call, &request, |_| {
            MapiResponse::new(
                vec![ReplyCall::success(1, ReplyBody::OpenMessage)],
                vec![h(0x10), h(handle)],
            )
        });
        assert_eq!(outcome, Outcome::Forwarded);
    }

    #[test]
    fn registration_metadata() {
        let m = module();
        assert_eq!(m.name(), "cache");
        assert_eq!(m.description(), "Cache MAPI messages and attachments");
        assert_eq!(m.endpoint(), "exchange_emsmdb");
    }

    #[test]
    fn sessions_are_per_connection() {
        let m = module();
        let a = RpcCall::ecdorpc(ConnectionId::new());
        let b = RpcCall::ecdorpc(ConnectionId::new());
        open_message(&m, &a, 0x1000);
        open_message(&m, &b, 0x2000);
        assert_eq!(m.session_count(), 2);

        // Both connections opened the same message under different handles.
        let sa = m.session(a.connection).unwrap();
        let sb = m.session(b.connection).unwrap();
        assert!(sa.lock().unwrap().registry().message_by_handle(h(0x1000)).is_some());
        assert!(sa.lock().unwrap().registry().message_by_handle(h(0x2000)).is_none());
        assert!(sb.lock().unwrap().registry().message_by_handle(h(0x2000)).is_some());
    }

    #[test]
    fn other_rpc_operations_pass_through() {
        let m = module();
        let call = RpcCall {
            connection: ConnectionId::new(),
            opnum: 0x1,
        };
        open_message(&m, &call, 0x1000);
        assert_eq!(m.session_count(), 0);
    }

    #[test]
    fn disconnect_retires_stats() {
        let m = module();
        let call = RpcCall::ecdorpc(ConnectionId::new());
        open_message(&m, &call, 0x1000);
        m.disconnect(call.connection).unwrap();
        assert_eq!(m.session_count(), 0);
        assert_eq!(m.stats().unwrap().forwarded_batches, 1);
        // Unknown connection is a no-op.
        m.disconnect(call.connection).unwrap();
    }

    #[test]
    fn relay_short_circuits_cached_reads() {
        let m = module();
        let call = RpcCall::ecdorpc(ConnectionId::new());
        open_message(&m, &call, 0x1000);

        let open_stream = MapiRequest::new(
            vec![RequestCall::open_stream(0, 1, 0x1000_001F)],
            vec![h(0x1000), Handle::UNSET],
        );
        relay(&m, &call, &open_stream, |_| {
            MapiResponse::new(
                vec![ReplyCall::success(1, ReplyBody::OpenStream { stream_size: 3 })],
                vec![h(0x1000), h(0x3000)],
            )
        });

        let read = MapiRequest::new(vec![RequestCall::read_stream(0, 3)], vec![h(0x3000)]);
        let (_, outcome) = relay(&m, &call, &read, |_| {
            MapiResponse::new(
                vec![ReplyCall::success(0, ReplyBody::ReadStream { data: b"abc".to_vec() })],
                vec![h(0x3000)],
            )
        });
        assert_eq!(outcome, Outcome::Forwarded);

        let again = MapiRequest::new(vec![RequestCall::read_stream(0, 3)], vec![h(0x3000)]);
        let (reply, outcome) = relay(&m, &call, &again, |_| panic!("forwarded a read at end of stream"));
        assert_eq!(outcome, Outcome::ShortCircuited);
        assert!(reply.replies[0].read_data().unwrap().is_empty());

        let reopen = MapiRequest::new(
            vec![RequestCall::open_stream(0, 1, 0x1000_001F)],
            vec![h(0x1000), Handle::UNSET],
        );
        relay(&m, &call, &reopen, |_| {
            MapiResponse::new(
                vec![ReplyCall::success(1, ReplyBody::OpenStream { stream_size: 3 })],
                vec![h(0x1000), h(0x3001)],
            )
        });
        let read = MapiRequest::new(vec![RequestCall::read_stream(0, 3)], vec![h(0x3001)]);
        let (reply, outcome) = relay(&m, &call, &read, |_| panic!("forwarded a cached read"));
        assert_eq!(outcome, Outcome::ShortCircuited);
        assert_eq!(reply.replies[0].read_data().unwrap(), b"abc");

        m.shutdown().unwrap();
        let stats = m.stats().unwrap();
        assert_eq!(stats.short_circuited_batches, 2);
        assert_eq!(stats.streams_completed, 2);
    }

    #[test]
    fn from_config_memory_backend() {
        let config = CacheConfig::from_toml_str("path = \"/unused\"\nbackend = \"memory\"\nmax_tracked_objects = 8").unwrap();
        let m = CacheModule::from_config(&config).unwrap();
        assert_eq!(m.max_tracked_objects, 8);
    }
}
