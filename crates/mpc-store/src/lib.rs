//! Durable storage for the MAPI proxy cache.
//!
//! Two things are persisted: a durable index of confirmed objects (messages,
//! attachments and streams the client opened successfully) and one byte
//! blob per stream holding the content captured from the server.
//!
//! Entries are keyed by handle-independent locations (folder id, message id,
//! attachment id, property tag): server handles are only valid for the
//! lifetime of a connection, locations survive it.
//!
//! # Storage Backends
//!
//! All backends implement the [`CacheStore`] trait:
//!
//! - [`InMemoryCacheStore`] -- `HashMap`-based store for tests and embedding
//! - [`FsCacheStore`] -- blob files plus a CRC-framed index log, compacted
//!   once it is mostly superseded entries
//!
//! # Design Rules
//!
//! 1. A blob only ever grows by appends, or is reset to empty. Every capture
//!    writes its own blob; a complete one is promoted into the index.
//! 2. Committing a record for an existing key replaces it.
//! 3. Reads past the end of a blob return no bytes, never an error.
//! 4. All I/O errors are propagated; the cache layer decides what to log.

pub mod error;
pub mod fs;
pub mod index;
pub mod memory;
pub mod record;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use fs::{FsCacheStore, FsStoreConfig};
pub use index::{IndexEntry, IndexState};
pub use memory::InMemoryCacheStore;
pub use record::{AttachmentRecord, BlobId, MessageRecord, StreamLocation, StreamRecord};
pub use traits::CacheStore;
