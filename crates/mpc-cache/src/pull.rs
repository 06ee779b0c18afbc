//! Pre-send phase: create and drop provisional registry entries.
//!
//! Runs on every forwarded batch before it leaves for the server. Open calls
//! create provisional entries keyed by natural key; Release calls drop the
//! entry holding the released handle.

use mpc_protocol::{Handle, MapiRequest, RequestBody, RequestCall};
use mpc_store::CacheStore;
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::registry::ObjectRegistry;
use crate::tracked::{
    AttachmentKey, MessageKey, StreamKey, StreamOwner, TrackedAttachment, TrackedMessage,
    TrackedObject, TrackedStream,
};

/// Observe an outgoing batch.
///
/// Only registry exhaustion is returned as an error, and it abandons the
/// remaining calls. Every other mismatch is logged and skipped.
pub fn observe(
    registry: &mut ObjectRegistry,
    store: &dyn CacheStore,
    request: &MapiRequest,
) -> CacheResult<()> {
    for call in &request.calls {
        match &call.body {
            RequestBody::OpenMessage {
                folder_id,
                message_id,
                ..
            } => open_message(registry, MessageKey::new(*folder_id, *message_id))?,
            RequestBody::OpenAttach { attachment_id, .. } => {
                if let Some(parent) = input_handle(request, call) {
                    open_attach(registry, AttachmentKey::new(parent, *attachment_id))?;
                }
            }
            RequestBody::OpenStream { property_tag, .. } => {
                if let Some(parent) = input_handle(request, call) {
                    open_stream(registry, store, StreamKey::new(parent, *property_tag))?;
                }
            }
            RequestBody::Release => {
                if let Some(handle) = input_handle(request, call) {
                    release(registry, store, handle);
                }
            }
            RequestBody::ReadStream { .. } | RequestBody::Other { .. } => {}
        }
    }
    Ok(())
}

fn input_handle(request: &MapiRequest, call: &RequestCall) -> Option<Handle> {
    match request.input_handle(call) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(opnum = %call.opnum(), error = %e, "skipping call");
            None
        }
    }
}

fn open_message(registry: &mut ObjectRegistry, key: MessageKey) -> CacheResult<()> {
    let replaced = registry.upsert_message(TrackedMessage::provisional(key))?;
    debug!(
        fid = key.folder_id,
        mid = key.message_id,
        replaced = replaced.is_some(),
        "message: provisional"
    );
    Ok(())
}

fn open_attach(registry: &mut ObjectRegistry, key: AttachmentKey) -> CacheResult<()> {
    let message = registry
        .message_by_handle(key.parent_handle)
        .map(TrackedMessage::key);
    if message.is_none() {
        debug!(parent = %key.parent_handle, "attachment: no tracked parent message");
    }
    let replaced = registry.upsert_attachment(TrackedAttachment::provisional(key, message))?;
    debug!(
        parent = %key.parent_handle,
        attach = key.attachment_id,
        replaced = replaced.is_some(),
        "attachment: provisional"
    );
    Ok(())
}

fn open_stream(registry: &mut ObjectRegistry, store: &dyn CacheStore, key: StreamKey) -> CacheResult<()> {
    let owner = if let Some(attachment) = registry.attachment_by_handle(key.parent_handle) {
        StreamOwner::Attachment(attachment.key())
    } else if let Some(message) = registry.message_by_handle(key.parent_handle) {
        StreamOwner::Message(message.key())
    } else {
        debug!(
            parent = %key.parent_handle,
            tag = format_args!("{:#010x}", key.property_tag),
            "stream: parent not tracked, not caching"
        );
        return Ok(());
    };
    if let Some(replaced) = registry.upsert_stream(TrackedStream::provisional(key, owner))? {
        drop_blob(store, &replaced);
    }
    debug!(
        parent = %key.parent_handle,
        tag = format_args!("{:#010x}", key.property_tag),
        "stream: provisional"
    );
    Ok(())
}

fn release(registry: &mut ObjectRegistry, store: &dyn CacheStore, handle: Handle) {
    match registry.remove(handle) {
        Some(TrackedObject::Stream(stream)) => {
            debug!(%handle, "stream: released");
            drop_blob(store, &stream);
        }
        Some(other) => debug!(%handle, kind = other.kind(), "released"),
        None => {}
    }
}

/// Let go of a stream's blob. A complete blob is closed and stays cached; a
/// partial capture can never be resumed, so its blob is removed.
pub(crate) fn drop_blob(store: &dyn CacheStore, stream: &TrackedStream) {
    let Some(blob) = stream.blob else {
        return;
    };
    let result = if stream.cached {
        store.blob_close(&blob)
    } else {
        store.blob_remove(&blob)
    };
    if let Err(e) = result {
        warn!(blob = %blob.short_hex(), cached = stream.cached, error = %e, "failed to drop stream blob");
    }
}
