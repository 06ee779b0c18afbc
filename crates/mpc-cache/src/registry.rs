//! In-memory registry of the messages, attachments and streams a client has
//! opened through the proxy.
//!
//! Each category is a `HashMap` keyed by natural key, with a secondary map
//! from confirmed handle to natural key. Provisional entries are only
//! reachable by natural key.

use std::collections::HashMap;

use mpc_protocol::Handle;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::tracked::{
    AttachmentKey, MessageKey, StreamKey, TrackedAttachment, TrackedMessage, TrackedObject,
    TrackedRef, TrackedStream,
};

/// Default bound on the number of tracked objects per session.
pub const DEFAULT_MAX_TRACKED_OBJECTS: usize = 65_536;

pub struct ObjectRegistry {
    messages: HashMap<MessageKey, TrackedMessage>,
    attachments: HashMap<AttachmentKey, TrackedAttachment>,
    streams: HashMap<StreamKey, TrackedStream>,
    message_handles: HashMap<Handle, MessageKey>,
    attachment_handles: HashMap<Handle, AttachmentKey>,
    stream_handles: HashMap<Handle, StreamKey>,
    limit: usize,
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("messages", &self.messages.len())
            .field("attachments", &self.attachments.len())
            .field("streams", &self.streams.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_TRACKED_OBJECTS)
    }

    /// Create a registry holding at most `limit` entries across all
    /// categories.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            messages: HashMap::new(),
            attachments: HashMap::new(),
            streams: HashMap::new(),
            message_handles: HashMap::new(),
            attachment_handles: HashMap::new(),
            stream_handles: HashMap::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.attachments.len() + self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn ensure_room(&self) -> CacheResult<()> {
        if self.len() >= self.limit {
            return Err(CacheError::Exhausted { limit: self.limit });
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------

    /// Insert a message, replacing any entry with the same key. Returns the
    /// replaced entry.
    pub fn upsert_message(&mut self, entry: TrackedMessage) -> CacheResult<Option<TrackedMessage>> {
        let key = entry.key();
        let replaced = self.remove_message(&key);
        self.ensure_room()?;
        self.messages.try_reserve(1)?;
        if let Some(handle) = entry.handle {
            self.index_message_handle(key, handle);
        }
        self.messages.insert(key, entry);
        Ok(replaced)
    }

    pub fn message(&self, key: &MessageKey) -> Option<&TrackedMessage> {
        self.messages.get(key)
    }

    pub fn message_by_handle(&self, handle: Handle) -> Option<&TrackedMessage> {
        self.message_handles
            .get(&handle)
            .and_then(|key| self.messages.get(key))
    }

    /// Assign the server handle to a message. Returns `None` if the key is
    /// not tracked.
    pub fn confirm_message(&mut self, key: &MessageKey, handle: Handle) -> Option<&TrackedMessage> {
        let previous = self.messages.get(key)?.handle;
        if let Some(old) = previous {
            self.unindex_message_handle(key, old);
        }
        self.index_message_handle(*key, handle);
        let entry = self.messages.get_mut(key)?;
        entry.handle = Some(handle);
        Some(entry)
    }

    pub fn remove_message(&mut self, key: &MessageKey) -> Option<TrackedMessage> {
        let entry = self.messages.remove(key)?;
        if let Some(handle) = entry.handle {
            self.unindex_message_handle(key, handle);
        }
        Some(entry)
    }

    fn index_message_handle(&mut self, key: MessageKey, handle: Handle) {
        if let Some(stale) = self.message_handles.insert(handle, key) {
            if stale != key && self.messages.remove(&stale).is_some() {
                debug!(%handle, ?stale, "handle reused by server; evicting stale message");
            }
        }
    }

    fn unindex_message_handle(&mut self, key: &MessageKey, handle: Handle) {
        if self.message_handles.get(&handle) == Some(key) {
            self.message_handles.remove(&handle);
        }
    }

    // ---------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------

    pub fn upsert_attachment(
        &mut self,
        entry: TrackedAttachment,
    ) -> CacheResult<Option<TrackedAttachment>> {
        let key = entry.key();
        let replaced = self.remove_attachment(&key);
        self.ensure_room()?;
        self.attachments.try_reserve(1)?;
        if let Some(handle) = entry.handle {
            self.index_attachment_handle(key, handle);
        }
        self.attachments.insert(key, entry);
        Ok(replaced)
    }

    pub fn attachment(&self, key: &AttachmentKey) -> Option<&TrackedAttachment> {
        self.attachments.get(key)
    }

    pub fn attachment_mut(&mut self, key: &AttachmentKey) -> Option<&mut TrackedAttachment> {
        self.attachments.get_mut(key)
    }

    pub fn attachment_by_handle(&self, handle: Handle) -> Option<&TrackedAttachment> {
        self.attachment_handles
            .get(&handle)
            .and_then(|key| self.attachments.get(key))
    }

    pub fn confirm_attachment(
        &mut self,
        key: &AttachmentKey,
        handle: Handle,
    ) -> Option<&TrackedAttachment> {
        let previous = self.attachments.get(key)?.handle;
        if let Some(old) = previous {
            self.unindex_attachment_handle(key, old);
        }
        self.index_attachment_handle(*key, handle);
        let entry = self.attachments.get_mut(key)?;
        entry.handle = Some(handle);
        Some(entry)
    }

    pub fn remove_attachment(&mut self, key: &AttachmentKey) -> Option<TrackedAttachment> {
        let entry = self.attachments.remove(key)?;
        if let Some(handle) = entry.handle {
            self.unindex_attachment_handle(key, handle);
        }
        Some(entry)
    }

    fn index_attachment_handle(&mut self, key: AttachmentKey, handle: Handle) {
        if let Some(stale) = self.attachment_handles.insert(handle, key) {
            if stale != key && self.attachments.remove(&stale).is_some() {
                debug!(%handle, ?stale, "handle reused by server; evicting stale attachment");
            }
        }
    }

    fn unindex_attachment_handle(&mut self, key: &AttachmentKey, handle: Handle) {
        if self.attachment_handles.get(&handle) == Some(key) {
            self.attachment_handles.remove(&handle);
        }
    }

    // ---------------------------------------------------------------
    // Streams
    // ---------------------------------------------------------------

    pub fn upsert_stream(&mut self, entry: TrackedStream) -> CacheResult<Option<TrackedStream>> {
        let key = entry.key();
        let replaced = self.remove_stream(&key);
        self.ensure_room()?;
        self.streams.try_reserve(1)?;
        if let Some(handle) = entry.handle {
            self.index_stream_handle(key, handle);
        }
        self.streams.insert(key, entry);
        Ok(replaced)
    }

    pub fn stream(&self, key: &StreamKey) -> Option<&TrackedStream> {
        self.streams.get(key)
    }

    pub fn stream_mut(&mut self, key: &StreamKey) -> Option<&mut TrackedStream> {
        self.streams.get_mut(key)
    }

    pub fn stream_by_handle(&self, handle: Handle) -> Option<&TrackedStream> {
        self.stream_handles
            .get(&handle)
            .and_then(|key| self.streams.get(key))
    }

    pub fn stream_by_handle_mut(&mut self, handle: Handle) -> Option<&mut TrackedStream> {
        let key = self.stream_handles.get(&handle)?;
        self.streams.get_mut(key)
    }

    pub fn confirm_stream(&mut self, key: &StreamKey, handle: Handle) -> Option<&mut TrackedStream> {
        let previous = self.streams.get(key)?.handle;
        if let Some(old) = previous {
            self.unindex_stream_handle(key, old);
        }
        self.index_stream_handle(*key, handle);
        let entry = self.streams.get_mut(key)?;
        entry.handle = Some(handle);
        Some(entry)
    }

    pub fn remove_stream(&mut self, key: &StreamKey) -> Option<TrackedStream> {
        let entry = self.streams.remove(key)?;
        if let Some(handle) = entry.handle {
            self.unindex_stream_handle(key, handle);
        }
        Some(entry)
    }

    pub fn streams(&self) -> impl Iterator<Item = &TrackedStream> {
        self.streams.values()
    }

    fn index_stream_handle(&mut self, key: StreamKey, handle: Handle) {
        if let Some(stale) = self.stream_handles.insert(handle, key) {
            if stale != key && self.streams.remove(&stale).is_some() {
                debug!(%handle, ?stale, "handle reused by server; evicting stale stream");
            }
        }
    }

    fn unindex_stream_handle(&mut self, key: &StreamKey, handle: Handle) {
        if self.stream_handles.get(&handle) == Some(key) {
            self.stream_handles.remove(&handle);
        }
    }

    // ---------------------------------------------------------------
    // Cross-category lookups
    // ---------------------------------------------------------------

    /// Find the entry holding `handle`. Messages are searched first, then
    /// attachments, then streams; the first match wins.
    pub fn find_by_handle(&self, handle: Handle) -> Option<TrackedRef<'_>> {
        if let Some(message) = self.message_by_handle(handle) {
            return Some(TrackedRef::Message(message));
        }
        if let Some(attachment) = self.attachment_by_handle(handle) {
            return Some(TrackedRef::Attachment(attachment));
        }
        self.stream_by_handle(handle).map(TrackedRef::Stream)
    }

    /// Remove the entry [`find_by_handle`](Self::find_by_handle) would
    /// return. Removing an unknown handle is a no-op.
    pub fn remove(&mut self, handle: Handle) -> Option<TrackedObject> {
        if let Some(key) = self.message_handles.get(&handle).copied() {
            return self.remove_message(&key).map(TrackedObject::Message);
        }
        if let Some(key) = self.attachment_handles.get(&handle).copied() {
            return self.remove_attachment(&key).map(TrackedObject::Attachment);
        }
        if let Some(key) = self.stream_handles.get(&handle).copied() {
            return self.remove_stream(&key).map(TrackedObject::Stream);
        }
        None
    }

    /// Drop every entry, returning the streams so their blobs can be closed.
    pub fn drain_streams(&mut self) -> Vec<TrackedStream> {
        self.messages.clear();
        self.attachments.clear();
        self.message_handles.clear();
        self.attachment_handles.clear();
        self.stream_handles.clear();
        self.streams.drain().map(|(_, stream)| stream).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked::StreamOwner;

    fn h(raw: u32) -> Handle {
        Handle::new(raw)
    }

    fn confirmed_message(registry: &mut ObjectRegistry, fid: u64, mid: u64, handle: u32) {
        let key = MessageKey::new(fid, mid);
        registry.upsert_message(TrackedMessage::provisional(key)).unwrap();
        registry.confirm_message(&key, h(handle)).unwrap();
    }

    fn confirmed_attachment(registry: &mut ObjectRegistry, parent: u32, id: u32, handle: u32) {
        let key = AttachmentKey::new(h(parent), id);
        registry
            .upsert_attachment(TrackedAttachment::provisional(key, None))
            .unwrap();
        registry.confirm_attachment(&key, h(handle)).unwrap();
    }

    fn confirmed_stream(registry: &mut ObjectRegistry, parent: u32, tag: u32, handle: u32) {
        let key = StreamKey::new(h(parent), tag);
        let owner = StreamOwner::Message(MessageKey::new(0, 0));
        registry
            .upsert_stream(TrackedStream::provisional(key, owner))
            .unwrap();
        registry.confirm_stream(&key, h(handle)).unwrap();
    }

    #[test]
    fn upsert_replaces_same_key() {
        let mut registry = ObjectRegistry::new();
        confirmed_message(&mut registry, 10, 55, 0x1000);

        let replaced = registry
            .upsert_message(TrackedMessage::provisional(MessageKey::new(10, 55)))
            .unwrap()
            .expect("previous entry");
        assert_eq!(replaced.handle, Some(h(0x1000)));
        assert_eq!(registry.message_count(), 1);
        assert!(!registry.message(&MessageKey::new(10, 55)).unwrap().is_confirmed());
        // The old handle no longer resolves.
        assert!(registry.message_by_handle(h(0x1000)).is_none());
    }

    #[test]
    fn provisional_entries_are_not_found_by_handle() {
        let mut registry = ObjectRegistry::new();
        registry
            .upsert_message(TrackedMessage::provisional(MessageKey::new(1, 1)))
            .unwrap();
        assert!(registry.find_by_handle(Handle::UNSET).is_none());
        assert!(registry.remove(Handle::UNSET).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn find_by_handle_prefers_messages() {
        let mut registry = ObjectRegistry::new();
        confirmed_stream(&mut registry, 0x10, 0x3701, 0x42);
        confirmed_attachment(&mut registry, 0x10, 1, 0x42);
        confirmed_message(&mut registry, 1, 1, 0x42);

        assert_eq!(registry.find_by_handle(h(0x42)).unwrap().kind(), "message");
        assert_eq!(registry.remove(h(0x42)).unwrap().kind(), "message");
        assert_eq!(registry.find_by_handle(h(0x42)).unwrap().kind(), "attachment");
        assert_eq!(registry.remove(h(0x42)).unwrap().kind(), "attachment");
        assert_eq!(registry.remove(h(0x42)).unwrap().kind(), "stream");
        assert!(registry.remove(h(0x42)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_handle_is_noop() {
        let mut registry = ObjectRegistry::new();
        confirmed_message(&mut registry, 1, 1, 0x10);
        assert!(registry.remove(h(0x99)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reconfirm_moves_handle() {
        let mut registry = ObjectRegistry::new();
        confirmed_message(&mut registry, 1, 1, 0x10);
        registry.confirm_message(&MessageKey::new(1, 1), h(0x20)).unwrap();
        assert!(registry.message_by_handle(h(0x10)).is_none());
        assert!(registry.message_by_handle(h(0x20)).is_some());
    }

    #[test]
    fn handle_reuse_evicts_stale_entry() {
        let mut registry = ObjectRegistry::new();
        confirmed_message(&mut registry, 1, 1, 0x10);
        confirmed_message(&mut registry, 1, 2, 0x10);
        assert_eq!(registry.message_count(), 1);
        assert_eq!(registry.message_by_handle(h(0x10)).unwrap().message_id, 2);
    }

    #[test]
    fn confirm_unknown_key_is_none() {
        let mut registry = ObjectRegistry::new();
        assert!(registry.confirm_message(&MessageKey::new(1, 1), h(1)).is_none());
        assert!(registry
            .confirm_attachment(&AttachmentKey::new(h(1), 0), h(2))
            .is_none());
        assert!(registry.confirm_stream(&StreamKey::new(h(1), 0), h(2)).is_none());
    }

    #[test]
    fn limit_is_enforced() {
        let mut registry = ObjectRegistry::with_limit(2);
        registry
            .upsert_message(TrackedMessage::provisional(MessageKey::new(1, 1)))
            .unwrap();
        registry
            .upsert_message(TrackedMessage::provisional(MessageKey::new(1, 2)))
            .unwrap();
        let err = registry
            .upsert_message(TrackedMessage::provisional(MessageKey::new(1, 3)))
            .unwrap_err();
        assert!(matches!(err, CacheError::Exhausted { limit: 2 }));

        // Replacing an existing key never needs room.
        registry
            .upsert_message(TrackedMessage::provisional(MessageKey::new(1, 2)))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn stream_lookup_by_handle_mut() {
        let mut registry = ObjectRegistry::new();
        confirmed_stream(&mut registry, 0x2000, 0x3701, 0x3000);
        registry.stream_by_handle_mut(h(0x3000)).unwrap().declared_size = 4096;
        assert_eq!(registry.stream_by_handle(h(0x3000)).unwrap().declared_size, 4096);
        assert_eq!(registry.streams().count(), 1);
    }

    #[test]
    fn drain_streams_clears_everything() {
        let mut registry = ObjectRegistry::new();
        confirmed_message(&mut registry, 1, 1, 0x10);
        confirmed_attachment(&mut registry, 0x10, 0, 0x11);
        confirmed_stream(&mut registry, 0x11, 0x3701, 0x12);
        let streams = registry.drain_streams();
        assert_eq!(streams.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.find_by_handle(h(0x12)).is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn at_most_one_message_per_key(opens in proptest::collection::vec((0u64..4, 0u64..4), 1..40)) {
                let mut registry = ObjectRegistry::new();
                for (fid, mid) in &opens {
                    registry
                        .upsert_message(TrackedMessage::provisional(MessageKey::new(*fid, *mid)))
                        .unwrap();
                }
                let mut distinct = opens.clone();
                distinct.sort();
                distinct.dedup();
                prop_assert_eq!(registry.message_count(), distinct.len());
            }

            #[test]
            fn release_removes_at_most_one(handles in proptest::collection::vec(1u32..16, 1..30), victim in 1u32..16) {
                let mut registry = ObjectRegistry::new();
                for (i, handle) in handles.iter().enumerate() {
                    confirmed_message(&mut registry, 1, i as u64, *handle);
                }
                let before = registry.len();
                registry.remove(h(victim));
                prop_assert!(before - registry.len() <= 1);
                let after_first = registry.len();
                registry.remove(h(victim));
                prop_assert_eq!(registry.len(), after_first);
            }
        }
    }
}
