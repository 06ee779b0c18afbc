use crate::error::StoreResult;
use crate::record::{AttachmentRecord, BlobId, MessageRecord, StreamLocation, StreamRecord};

/// Durable index of confirmed objects plus per-stream blob storage.
///
/// All implementations must satisfy these invariants:
/// - Committing a record replaces any record with the same key.
/// - `blob_append` only ever extends a blob; `blob_reset` empties it and
///   `blob_remove` deletes it.
/// - `promote_stream` is atomic with respect to other promotions of the
///   same location: the first complete capture of a given size wins.
/// - `blob_read` past the end of a blob returns an empty buffer.
/// - All I/O errors are propagated, never silently ignored.
pub trait CacheStore: Send + Sync {
    /// Record a message the server confirmed.
    fn commit_message(&self, record: &MessageRecord) -> StoreResult<()>;

    /// Record an attachment the server confirmed.
    fn commit_attachment(&self, record: &AttachmentRecord) -> StoreResult<()>;

    /// Record a stream and the state of its capture.
    fn commit_stream(&self, record: &StreamRecord) -> StoreResult<()>;

    /// Offer a complete capture to the index.
    ///
    /// If the index already holds a complete record for the location with
    /// the same declared size and a blob of that length, it is kept and
    /// returned. Otherwise `record` replaces it, and the blob of a replaced
    /// complete record is removed. Returns the record now in effect.
    fn promote_stream(&self, record: &StreamRecord) -> StoreResult<StreamRecord>;

    /// Look up the last committed record for a stream location.
    fn lookup_stream(&self, location: &StreamLocation) -> StoreResult<Option<StreamRecord>>;

    /// All committed messages, ordered by folder then message id.
    fn messages(&self) -> StoreResult<Vec<MessageRecord>>;

    /// All committed attachments, ordered by message then attachment id.
    fn attachments(&self) -> StoreResult<Vec<AttachmentRecord>>;

    /// All committed streams, ordered by location.
    fn streams(&self) -> StoreResult<Vec<StreamRecord>>;

    /// Append bytes to a blob, creating it if needed. Returns the new length.
    fn blob_append(&self, blob: &BlobId, bytes: &[u8]) -> StoreResult<u64>;

    /// Read up to `max_len` bytes starting at `offset`.
    ///
    /// Returns `Err(BlobNotFound)` if the blob was never written.
    fn blob_read(&self, blob: &BlobId, offset: u64, max_len: usize) -> StoreResult<Vec<u8>>;

    /// Current blob length; `0` for a blob that does not exist.
    fn blob_len(&self, blob: &BlobId) -> StoreResult<u64>;

    /// Truncate a blob to empty, creating it if needed.
    fn blob_reset(&self, blob: &BlobId) -> StoreResult<()>;

    /// Delete a blob. Removing a blob that does not exist is not an error.
    fn blob_remove(&self, blob: &BlobId) -> StoreResult<()>;

    /// Release resources held for a blob (open writers).
    ///
    /// Default implementation does nothing. Backends that keep file handles
    /// open between appends override this.
    fn blob_close(&self, _blob: &BlobId) -> StoreResult<()> {
        Ok(())
    }
}
