use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Handle-independent address of a stream: the property of a message, or of
/// one of its attachments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamLocation {
    pub folder_id: u64,
    pub message_id: u64,
    pub attachment_id: Option<u32>,
    pub property_tag: u32,
}

impl StreamLocation {
    pub fn message(folder_id: u64, message_id: u64, property_tag: u32) -> Self {
        Self {
            folder_id,
            message_id,
            attachment_id: None,
            property_tag,
        }
    }

    pub fn attachment(folder_id: u64, message_id: u64, attachment_id: u32, property_tag: u32) -> Self {
        Self {
            folder_id,
            message_id,
            attachment_id: Some(attachment_id),
            property_tag,
        }
    }

    /// Label of the object owning the stream, `0xFID/0xMID[/ATTACH]`.
    pub fn owner_label(&self) -> String {
        match self.attachment_id {
            Some(attach) => format!("{:#x}/{:#x}/{}", self.folder_id, self.message_id, attach),
            None => format!("{:#x}/{:#x}", self.folder_id, self.message_id),
        }
    }

    pub fn blob_id(&self) -> BlobId {
        BlobId::for_location(self)
    }
}

impl fmt::Display for StreamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#010x}", self.owner_label(), self.property_tag)
    }
}

/// Identifier of a stream blob, derived from its location.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// Default blob id for a location.
    pub fn for_location(location: &StreamLocation) -> Self {
        Self::derive(location, None)
    }

    /// Blob id of one capture of a location. Each capture writes its own
    /// blob, so concurrent captures of the same stream never share bytes.
    pub fn for_capture(location: &StreamLocation, capture: u128) -> Self {
        Self::derive(location, Some(capture))
    }

    fn derive(location: &StreamLocation, capture: Option<u128>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"mpc-blob-v1:");
        hasher.update(&location.folder_id.to_le_bytes());
        hasher.update(&location.message_id.to_le_bytes());
        match location.attachment_id {
            Some(attach) => {
                hasher.update(b"attach:");
                hasher.update(&attach.to_le_bytes());
            }
            None => {
                hasher.update(b"message:");
            }
        }
        hasher.update(&location.property_tag.to_le_bytes());
        if let Some(capture) = capture {
            hasher.update(b"capture:");
            hasher.update(&capture.to_le_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.short_hex())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A message the client opened successfully.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub folder_id: u64,
    pub message_id: u64,
    pub committed_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(folder_id: u64, message_id: u64) -> Self {
        Self {
            folder_id,
            message_id,
            committed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> (u64, u64) {
        (self.folder_id, self.message_id)
    }
}

/// An attachment the client opened successfully.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub folder_id: u64,
    pub message_id: u64,
    pub attachment_id: u32,
    pub committed_at: DateTime<Utc>,
}

impl AttachmentRecord {
    pub fn new(folder_id: u64, message_id: u64, attachment_id: u32) -> Self {
        Self {
            folder_id,
            message_id,
            attachment_id,
            committed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> (u64, u64, u32) {
        (self.folder_id, self.message_id, self.attachment_id)
    }
}

/// A stream the client opened successfully, with the state of its capture.
///
/// `complete` is set once `blob` holds exactly `declared_size` bytes; only
/// complete streams are ever served from the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub location: StreamLocation,
    pub blob: BlobId,
    pub declared_size: u64,
    pub complete: bool,
    pub committed_at: DateTime<Utc>,
}

impl StreamRecord {
    pub fn new(location: StreamLocation, declared_size: u64, complete: bool) -> Self {
        Self {
            location,
            blob: location.blob_id(),
            declared_size,
            complete,
            committed_at: Utc::now(),
        }
    }

    /// Record for a capture written to its own blob.
    pub fn with_blob(location: StreamLocation, blob: BlobId, declared_size: u64, complete: bool) -> Self {
        Self {
            blob,
            ..Self::new(location, declared_size, complete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_is_deterministic() {
        let loc = StreamLocation::attachment(10, 55, 2, 0x3701_0102);
        assert_eq!(loc.blob_id(), BlobId::for_location(&loc));
    }

    #[test]
    fn blob_id_separates_message_and_attachment_streams() {
        let on_message = StreamLocation::message(10, 55, 0x1000_001F);
        let on_attach = StreamLocation::attachment(10, 55, 0, 0x1000_001F);
        assert_ne!(on_message.blob_id(), on_attach.blob_id());
    }

    #[test]
    fn captures_of_one_location_get_distinct_blobs() {
        let loc = StreamLocation::message(10, 55, 0x1000_001F);
        let first = BlobId::for_capture(&loc, 1);
        assert_ne!(first, BlobId::for_capture(&loc, 2));
        assert_ne!(first, loc.blob_id());
        assert_eq!(first, BlobId::for_capture(&loc, 1));
    }

    #[test]
    fn labels() {
        let loc = StreamLocation::attachment(10, 55, 2, 0x3701);
        assert_eq!(loc.owner_label(), "0xa/0x37/2");
        assert_eq!(loc.to_string(), "0xa/0x37/2/0x00003701");
        assert_eq!(StreamLocation::message(1, 2, 3).owner_label(), "0x1/0x2");
    }

    #[test]
    fn blob_hex() {
        let id = StreamLocation::message(1, 2, 3).blob_id();
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(id.short_hex().len(), 8);
        assert_eq!(format!("{id}"), id.to_hex());
    }

    #[test]
    fn stream_record_derives_blob() {
        let loc = StreamLocation::message(1, 2, 3);
        let record = StreamRecord::new(loc, 4096, false);
        assert_eq!(record.blob, loc.blob_id());
        assert!(!record.complete);
    }

    #[test]
    fn record_serde_roundtrip() {
        let record = StreamRecord::new(StreamLocation::attachment(1, 2, 3, 4), 10, true);
        let json = serde_json::to_string(&record).unwrap();
        let back: StreamRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
