//! Entries of the object registry.
//!
//! Every entry starts provisional (`handle == None`) when the pull phase sees
//! the open call, and becomes confirmed when the push phase sees a successful
//! reply. Back-references to parents are natural keys, resolved on demand;
//! they never keep a parent alive.

use std::time::Instant;

use mpc_protocol::Handle;
use mpc_store::{BlobId, StreamLocation};

/// Natural key of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub folder_id: u64,
    pub message_id: u64,
}

impl MessageKey {
    pub fn new(folder_id: u64, message_id: u64) -> Self {
        Self {
            folder_id,
            message_id,
        }
    }
}

/// Natural key of an attachment: the handle of the message it was opened
/// from, plus its attachment number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentKey {
    pub parent_handle: Handle,
    pub attachment_id: u32,
}

impl AttachmentKey {
    pub fn new(parent_handle: Handle, attachment_id: u32) -> Self {
        Self {
            parent_handle,
            attachment_id,
        }
    }
}

/// Natural key of a stream: the handle of the object it was opened on, plus
/// the property tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub parent_handle: Handle,
    pub property_tag: u32,
}

impl StreamKey {
    pub fn new(parent_handle: Handle, property_tag: u32) -> Self {
        Self {
            parent_handle,
            property_tag,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedMessage {
    pub folder_id: u64,
    pub message_id: u64,
    pub handle: Option<Handle>,
}

impl TrackedMessage {
    pub fn provisional(key: MessageKey) -> Self {
        Self {
            folder_id: key.folder_id,
            message_id: key.message_id,
            handle: None,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.folder_id, self.message_id)
    }

    pub fn is_confirmed(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedAttachment {
    pub attachment_id: u32,
    pub parent_handle: Handle,
    pub handle: Option<Handle>,
    /// Message the attachment belongs to, if it was tracked when the
    /// attachment was opened.
    pub message: Option<MessageKey>,
}

impl TrackedAttachment {
    pub fn provisional(key: AttachmentKey, message: Option<MessageKey>) -> Self {
        Self {
            attachment_id: key.attachment_id,
            parent_handle: key.parent_handle,
            handle: None,
            message,
        }
    }

    pub fn key(&self) -> AttachmentKey {
        AttachmentKey::new(self.parent_handle, self.attachment_id)
    }

    pub fn is_confirmed(&self) -> bool {
        self.handle.is_some()
    }
}

/// The object a stream was opened on. Exactly one of the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOwner {
    Attachment(AttachmentKey),
    Message(MessageKey),
}

#[derive(Clone, Debug)]
pub struct TrackedStream {
    pub parent_handle: Handle,
    pub property_tag: u32,
    pub handle: Option<Handle>,
    /// Size announced by the server when the stream was opened.
    pub declared_size: u64,
    /// Bytes captured into the blob so far.
    pub written_offset: u64,
    /// Position of the client in the stream.
    pub read_offset: u64,
    /// The blob holds all `declared_size` bytes.
    pub cached: bool,
    /// Blob receiving the capture; `None` when the stream is not captured.
    pub blob: Option<BlobId>,
    /// Durable address, once resolved through the owner.
    pub location: Option<StreamLocation>,
    pub started_at: Instant,
    pub owner: StreamOwner,
}

impl TrackedStream {
    pub fn provisional(key: StreamKey, owner: StreamOwner) -> Self {
        Self {
            parent_handle: key.parent_handle,
            property_tag: key.property_tag,
            handle: None,
            declared_size: 0,
            written_offset: 0,
            read_offset: 0,
            cached: false,
            blob: None,
            location: None,
            started_at: Instant::now(),
            owner,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.parent_handle, self.property_tag)
    }

    pub fn is_confirmed(&self) -> bool {
        self.handle.is_some()
    }

    /// Label used in completion statistics.
    pub fn label(&self) -> String {
        match &self.location {
            Some(location) => location.owner_label(),
            None => format!("{}/{:#010x}", self.parent_handle, self.property_tag),
        }
    }
}

/// An entry removed from the registry.
#[derive(Clone, Debug)]
pub enum TrackedObject {
    Message(TrackedMessage),
    Attachment(TrackedAttachment),
    Stream(TrackedStream),
}

impl TrackedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Attachment(_) => "attachment",
            Self::Stream(_) => "stream",
        }
    }
}

/// A registry entry found by handle.
#[derive(Clone, Copy, Debug)]
pub enum TrackedRef<'a> {
    Message(&'a TrackedMessage),
    Attachment(&'a TrackedAttachment),
    Stream(&'a TrackedStream),
}

impl TrackedRef<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Attachment(_) => "attachment",
            Self::Stream(_) => "stream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_entries_are_unconfirmed() {
        let msg = TrackedMessage::provisional(MessageKey::new(10, 55));
        assert!(!msg.is_confirmed());
        assert_eq!(msg.key(), MessageKey::new(10, 55));

        let attach = TrackedAttachment::provisional(
            AttachmentKey::new(Handle::new(0x1000), 2),
            Some(msg.key()),
        );
        assert!(!attach.is_confirmed());
        assert_eq!(attach.key().attachment_id, 2);

        let stream = TrackedStream::provisional(
            StreamKey::new(Handle::new(0x2000), 0x3701),
            StreamOwner::Attachment(attach.key()),
        );
        assert!(!stream.is_confirmed());
        assert!(!stream.cached);
        assert_eq!(stream.written_offset, 0);
    }

    #[test]
    fn stream_label_prefers_location() {
        let mut stream = TrackedStream::provisional(
            StreamKey::new(Handle::new(0x2000), 0x3701),
            StreamOwner::Message(MessageKey::new(10, 55)),
        );
        assert_eq!(stream.label(), "0x2000/0x00003701");
        stream.location = Some(StreamLocation::message(10, 55, 0x3701));
        assert_eq!(stream.label(), "0xa/0x37");
    }
}
