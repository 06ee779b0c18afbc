//! Stream cache engine of the MAPI proxy.
//!
//! Observes every `EcDoRpc` batch passing through the proxy, models which
//! messages, attachments and streams the client has open, captures stream
//! content into the store, and answers read-only batches on fully captured
//! streams without contacting the server.
//!
//! # Phases
//!
//! For each batch the host calls, in order:
//!
//! 1. [`dispatch::try_short_circuit`] -- answer locally, or `None` to forward
//! 2. [`pull::observe`] -- create/drop provisional entries before sending
//! 3. [`push::observe`] -- confirm/discard entries and capture bytes from
//!    the reply
//!
//! [`CacheSession`] bundles the three over one connection's
//! [`ObjectRegistry`], and [`CacheModule`] maps connections to sessions.
//!
//! # Design Rules
//!
//! 1. Cache failures never change the reply a client sees for a forwarded
//!    call.
//! 2. A batch is short-circuited in full or not at all.
//! 3. Entries are confirmed by natural key, never by call identity.
//! 4. Only streams whose blob holds every declared byte are served.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod module;
pub mod pull;
pub mod push;
pub mod registry;
pub mod session;
pub mod stats;
pub mod tracked;

pub use config::{CacheConfig, StoreBackend};
pub use error::{CacheError, CacheResult};
pub use module::{relay, CacheModule, Outcome, ProxyModule};
pub use registry::{ObjectRegistry, DEFAULT_MAX_TRACKED_OBJECTS};
pub use session::{CacheSession, SessionId};
pub use stats::{CacheStats, CompletionSource, StreamCompletion, RECENT_COMPLETIONS};
pub use tracked::{
    AttachmentKey, MessageKey, StreamKey, StreamOwner, TrackedAttachment, TrackedMessage,
    TrackedObject, TrackedRef, TrackedStream,
};
