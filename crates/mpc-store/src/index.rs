//! In-memory view of the durable object index.
//!
//! Both backends keep the index as an [`IndexState`]. The filesystem backend
//! additionally logs every [`IndexEntry`] it applies and rebuilds the state
//! by replaying the log on open.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{AttachmentRecord, MessageRecord, StreamLocation, StreamRecord};

/// One committed index change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEntry {
    Message(MessageRecord),
    Attachment(AttachmentRecord),
    Stream(StreamRecord),
}

/// Latest committed record per key.
#[derive(Clone, Debug, Default)]
pub struct IndexState {
    messages: BTreeMap<(u64, u64), MessageRecord>,
    attachments: BTreeMap<(u64, u64, u32), AttachmentRecord>,
    streams: BTreeMap<StreamLocation, StreamRecord>,
}

impl IndexState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an entry, replacing any record with the same key.
    pub fn apply(&mut self, entry: IndexEntry) {
        match entry {
            IndexEntry::Message(record) => {
                self.messages.insert(record.key(), record);
            }
            IndexEntry::Attachment(record) => {
                self.attachments.insert(record.key(), record);
            }
            IndexEntry::Stream(record) => {
                self.streams.insert(record.location, record);
            }
        }
    }

    pub fn stream(&self, location: &StreamLocation) -> Option<&StreamRecord> {
        self.streams.get(location)
    }

    /// The complete record for `location` if it has `declared_size`.
    pub fn complete_stream(&self, location: &StreamLocation, declared_size: u64) -> Option<&StreamRecord> {
        self.stream(location)
            .filter(|record| record.complete && record.declared_size == declared_size)
    }

    /// One entry per live record, enough to rebuild this state.
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        let messages = self.messages.values().cloned().map(IndexEntry::Message);
        let attachments = self.attachments.values().cloned().map(IndexEntry::Attachment);
        let streams = self.streams.values().cloned().map(IndexEntry::Stream);
        messages.chain(attachments).chain(streams).collect()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.values().cloned().collect()
    }

    pub fn attachments(&self) -> Vec<AttachmentRecord> {
        self.attachments.values().cloned().collect()
    }

    pub fn streams(&self) -> Vec<StreamRecord> {
        self.streams.values().cloned().collect()
    }

    /// Total number of records across all kinds.
    pub fn len(&self) -> usize {
        self.messages.len() + self.attachments.len() + self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_replaces_same_key() {
        let mut state = IndexState::new();
        let loc = StreamLocation::message(1, 2, 3);
        state.apply(IndexEntry::Stream(StreamRecord::new(loc, 100, false)));
        state.apply(IndexEntry::Stream(StreamRecord::new(loc, 100, true)));
        assert_eq!(state.len(), 1);
        assert!(state.stream(&loc).unwrap().complete);
    }

    #[test]
    fn listings_are_ordered() {
        let mut state = IndexState::new();
        state.apply(IndexEntry::Message(MessageRecord::new(2, 1)));
        state.apply(IndexEntry::Message(MessageRecord::new(1, 9)));
        state.apply(IndexEntry::Message(MessageRecord::new(1, 3)));
        let keys: Vec<_> = state.messages().iter().map(|m| m.key()).collect();
        assert_eq!(keys, vec![(1, 3), (1, 9), (2, 1)]);
    }

    #[test]
    fn snapshot_rebuilds_state() {
        let mut state = IndexState::new();
        let loc = StreamLocation::message(1, 2, 3);
        state.apply(IndexEntry::Message(MessageRecord::new(1, 2)));
        state.apply(IndexEntry::Stream(StreamRecord::new(loc, 8, false)));
        state.apply(IndexEntry::Stream(StreamRecord::new(loc, 8, true)));

        let mut rebuilt = IndexState::new();
        for entry in state.snapshot() {
            rebuilt.apply(entry);
        }
        assert_eq!(rebuilt.len(), 2);
        assert!(rebuilt.complete_stream(&loc, 8).is_some());
        assert!(rebuilt.complete_stream(&loc, 9).is_none());
    }

    #[test]
    fn kinds_are_independent() {
        let mut state = IndexState::new();
        state.apply(IndexEntry::Message(MessageRecord::new(1, 2)));
        state.apply(IndexEntry::Attachment(AttachmentRecord::new(1, 2, 0)));
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.attachments().len(), 1);
        assert!(state.streams().is_empty());
        assert!(!state.is_empty());
    }
}
