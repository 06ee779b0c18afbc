use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::index::{IndexEntry, IndexState};
use crate::record::{AttachmentRecord, BlobId, MessageRecord, StreamLocation, StreamRecord};
use crate::traits::CacheStore;

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Poisoned(e.to_string())
}

/// In-memory, HashMap-based cache store.
///
/// Intended for tests and embedding. Index and blobs live behind `RwLock`s
/// and are lost when the store is dropped.
pub struct InMemoryCacheStore {
    index: RwLock<IndexState>,
    blobs: RwLock<HashMap<BlobId, Vec<u8>>>,
}

impl InMemoryCacheStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(IndexState::new()),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Total bytes across all blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs
            .read()
            .map(|b| b.values().map(|data| data.len() as u64).sum())
            .unwrap_or(0)
    }

    fn commit(&self, entry: IndexEntry) -> StoreResult<()> {
        self.index.write().map_err(poisoned)?.apply(entry);
        Ok(())
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn commit_message(&self, record: &MessageRecord) -> StoreResult<()> {
        self.commit(IndexEntry::Message(record.clone()))
    }

    fn commit_attachment(&self, record: &AttachmentRecord) -> StoreResult<()> {
        self.commit(IndexEntry::Attachment(record.clone()))
    }

    fn commit_stream(&self, record: &StreamRecord) -> StoreResult<()> {
        self.commit(IndexEntry::Stream(record.clone()))
    }

    fn promote_stream(&self, record: &StreamRecord) -> StoreResult<StreamRecord> {
        let mut index = self.index.write().map_err(poisoned)?;
        if let Some(current) = index.complete_stream(&record.location, record.declared_size) {
            if self.blob_len(&current.blob)? == record.declared_size {
                return Ok(current.clone());
            }
        }
        let superseded = index
            .stream(&record.location)
            .filter(|current| current.complete && current.blob != record.blob)
            .map(|current| current.blob);
        index.apply(IndexEntry::Stream(record.clone()));
        drop(index);

        if let Some(blob) = superseded {
            self.blob_remove(&blob)?;
        }
        Ok(record.clone())
    }

    fn lookup_stream(&self, location: &StreamLocation) -> StoreResult<Option<StreamRecord>> {
        Ok(self.index.read().map_err(poisoned)?.stream(location).cloned())
    }

    fn messages(&self) -> StoreResult<Vec<MessageRecord>> {
        Ok(self.index.read().map_err(poisoned)?.messages())
    }

    fn attachments(&self) -> StoreResult<Vec<AttachmentRecord>> {
        Ok(self.index.read().map_err(poisoned)?.attachments())
    }

    fn streams(&self) -> StoreResult<Vec<StreamRecord>> {
        Ok(self.index.read().map_err(poisoned)?.streams())
    }

    fn blob_append(&self, blob: &BlobId, bytes: &[u8]) -> StoreResult<u64> {
        let mut blobs = self.blobs.write().map_err(poisoned)?;
        let data = blobs.entry(*blob).or_default();
        data.extend_from_slice(bytes);
        Ok(data.len() as u64)
    }

    fn blob_read(&self, blob: &BlobId, offset: u64, max_len: usize) -> StoreResult<Vec<u8>> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        let data = blobs.get(blob).ok_or(StoreError::BlobNotFound(*blob))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(max_len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn blob_len(&self, blob: &BlobId) -> StoreResult<u64> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        Ok(blobs.get(blob).map_or(0, |data| data.len() as u64))
    }

    fn blob_reset(&self, blob: &BlobId) -> StoreResult<()> {
        self.blobs.write().map_err(poisoned)?.insert(*blob, Vec::new());
        Ok(())
    }

    fn blob_remove(&self, blob: &BlobId) -> StoreResult<()> {
        self.blobs.write().map_err(poisoned)?.remove(blob);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.index.read().map(|i| i.len()).unwrap_or(0);
        f.debug_struct("InMemoryCacheStore")
            .field("record_count", &records)
            .field("blob_count", &self.blob_count())
            .finish()
    }
}
