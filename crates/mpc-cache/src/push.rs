//! Post-reply phase: confirm or discard provisional entries and capture
//! stream bytes.
//!
//! Replies are matched to requests with [`MapiRequest::correlate`], never by
//! position: Release calls have no reply, so the arrays drift apart.

use mpc_protocol::{Handle, MapiRequest, MapiResponse, Opnum, ReplyCall, RequestBody, RequestCall};
use mpc_store::{AttachmentRecord, BlobId, CacheStore, MessageRecord, StreamLocation, StreamRecord};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::CacheResult;
use crate::registry::ObjectRegistry;
use crate::stats::{CacheStats, CompletionSource, StreamCompletion};
use crate::tracked::{AttachmentKey, MessageKey, StreamKey, StreamOwner, TrackedStream};

/// Observe the reply to a forwarded batch. Failures are logged per reply and
/// never affect the reply the client receives.
pub fn observe(
    registry: &mut ObjectRegistry,
    store: &dyn CacheStore,
    stats: &mut CacheStats,
    request: &MapiRequest,
    response: &MapiResponse,
) {
    for reply in &response.replies {
        let opnum = reply.opnum();
        if !matches!(
            opnum,
            Opnum::OpenMessage | Opnum::OpenAttach | Opnum::OpenStream | Opnum::ReadStream
        ) {
            continue;
        }
        let Some(call) = request.correlate(reply) else {
            trace!(%opnum, "no matching request");
            continue;
        };
        let mut ctx = Push {
            registry: &mut *registry,
            store,
            stats: &mut *stats,
            request,
            response,
        };
        if let Err(e) = ctx.reply(call, reply) {
            warn!(%opnum, error = %e, "push: reply skipped");
        }
    }
}

struct Push<'a> {
    registry: &'a mut ObjectRegistry,
    store: &'a dyn CacheStore,
    stats: &'a mut CacheStats,
    request: &'a MapiRequest,
    response: &'a MapiResponse,
}

impl Push<'_> {
    fn reply(&mut self, call: &RequestCall, reply: &ReplyCall) -> CacheResult<()> {
        match &call.body {
            RequestBody::OpenMessage {
                folder_id,
                message_id,
                ..
            } => self.open_message(call, reply, MessageKey::new(*folder_id, *message_id)),
            RequestBody::OpenAttach { attachment_id, .. } => {
                let parent = self.request.input_handle(call)?;
                self.open_attach(call, reply, AttachmentKey::new(parent, *attachment_id))
            }
            RequestBody::OpenStream { property_tag, .. } => {
                let parent = self.request.input_handle(call)?;
                self.open_stream(call, reply, StreamKey::new(parent, *property_tag))
            }
            RequestBody::ReadStream { .. } => {
                let handle = self.request.input_handle(call)?;
                self.read_stream(reply, handle)
            }
            RequestBody::Release | RequestBody::Other { .. } => Ok(()),
        }
    }

    /// Handle the server assigned to the object a successful open created.
    fn assigned_handle(&self, call: &RequestCall) -> CacheResult<Option<Handle>> {
        let handle = self.response.handle_at(call.result_handle_idx())?;
        Ok((!handle.is_unset()).then_some(handle))
    }

    fn discarded(&mut self, kind: &'static str, existed: bool, status: impl std::fmt::Display) {
        if existed {
            self.stats.provisional_discards += 1;
            debug!(kind, %status, "provisional entry discarded");
        }
    }

    fn open_message(
        &mut self,
        call: &RequestCall,
        reply: &ReplyCall,
        key: MessageKey,
    ) -> CacheResult<()> {
        let handle = if reply.is_success() {
            self.assigned_handle(call)?
        } else {
            None
        };
        let Some(handle) = handle else {
            let existed = self.registry.remove_message(&key).is_some();
            self.discarded("message", existed, reply.status);
            return Ok(());
        };
        if self.registry.confirm_message(&key, handle).is_none() {
            trace!(fid = key.folder_id, mid = key.message_id, "message not tracked");
            return Ok(());
        }
        debug!(fid = key.folder_id, mid = key.message_id, %handle, "message: confirmed");
        self.store
            .commit_message(&MessageRecord::new(key.folder_id, key.message_id))?;
        Ok(())
    }

    fn open_attach(
        &mut self,
        call: &RequestCall,
        reply: &ReplyCall,
        key: AttachmentKey,
    ) -> CacheResult<()> {
        let handle = if reply.is_success() {
            self.assigned_handle(call)?
        } else {
            None
        };
        let Some(handle) = handle else {
            let existed = self.registry.remove_attachment(&key).is_some();
            self.discarded("attachment", existed, reply.status);
            return Ok(());
        };
        if self.registry.confirm_attachment(&key, handle).is_none() {
            trace!(parent = %key.parent_handle, attach = key.attachment_id, "attachment not tracked");
            return Ok(());
        }

        // The parent message may have been confirmed after the open was sent.
        let relink = match self.registry.attachment(&key).and_then(|a| a.message) {
            Some(_) => None,
            None => self
                .response
                .handle_at(call.handle_idx)
                .ok()
                .and_then(|parent| self.registry.message_by_handle(parent))
                .map(|message| message.key()),
        };
        if let (Some(message), Some(entry)) = (relink, self.registry.attachment_mut(&key)) {
            entry.message = Some(message);
        }

        debug!(parent = %key.parent_handle, attach = key.attachment_id, %handle, "attachment: confirmed");
        match self.registry.attachment(&key).and_then(|a| a.message) {
            Some(message) => self.store.commit_attachment(&AttachmentRecord::new(
                message.folder_id,
                message.message_id,
                key.attachment_id,
            ))?,
            None => debug!(attach = key.attachment_id, "attachment has no parent message, not committed"),
        }
        Ok(())
    }

    fn open_stream(
        &mut self,
        call: &RequestCall,
        reply: &ReplyCall,
        key: StreamKey,
    ) -> CacheResult<()> {
        let handle = if reply.is_success() {
            self.assigned_handle(call)?
        } else {
            None
        };
        let Some(handle) = handle else {
            let existed = self.registry.remove_stream(&key).is_some();
            self.discarded("stream", existed, reply.status);
            return Ok(());
        };
        let declared_size = u64::from(reply.stream_size()?);
        let Some(owner) = self.registry.stream(&key).map(|s| s.owner) else {
            trace!(parent = %key.parent_handle, "stream not tracked");
            return Ok(());
        };
        let location = self.resolve_location(owner, key.property_tag);
        let store = self.store;

        let Some(stream) = self.registry.confirm_stream(&key, handle) else {
            return Ok(());
        };
        stream.declared_size = declared_size;
        stream.written_offset = 0;
        stream.read_offset = 0;
        stream.cached = false;
        stream.blob = None;
        stream.location = location;

        let Some(location) = location else {
            debug!(%handle, "stream: location unresolved, not capturing");
            return Ok(());
        };
        if let Err(e) = begin_capture(store, stream, location) {
            warn!(%handle, location = %location, error = %e, "stream: capture disabled");
            stream.blob = None;
            stream.cached = false;
        }
        debug!(
            %handle,
            location = %location,
            size = declared_size,
            cached = stream.cached,
            "stream: confirmed"
        );
        Ok(())
    }

    fn resolve_location(&self, owner: StreamOwner, property_tag: u32) -> Option<StreamLocation> {
        match owner {
            StreamOwner::Message(message) => Some(StreamLocation::message(
                message.folder_id,
                message.message_id,
                property_tag,
            )),
            StreamOwner::Attachment(key) => {
                let attachment = self.registry.attachment(&key)?;
                let message = attachment.message?;
                Some(StreamLocation::attachment(
                    message.folder_id,
                    message.message_id,
                    attachment.attachment_id,
                    property_tag,
                ))
            }
        }
    }

    fn read_stream(&mut self, reply: &ReplyCall, handle: Handle) -> CacheResult<()> {
        if !reply.is_success() {
            return Ok(());
        }
        let data = reply.read_data()?;
        let store = self.store;
        let Some(stream) = self.registry.stream_by_handle_mut(handle) else {
            return Ok(());
        };
        self.stats.bytes_from_server += data.len() as u64;
        stream.read_offset = (stream.read_offset + data.len() as u64).min(stream.declared_size);

        if stream.cached || data.is_empty() {
            return Ok(());
        }
        let Some(blob) = stream.blob else {
            return Ok(());
        };

        let expected = stream.written_offset + data.len() as u64;
        if expected > stream.declared_size {
            warn!(
                %handle,
                written = stream.written_offset,
                len = data.len(),
                declared = stream.declared_size,
                "stream: payload overflows declared size, abandoning capture"
            );
            abandon(store, stream);
            return Ok(());
        }
        let len = match store.blob_append(&blob, data) {
            Ok(len) => len,
            Err(e) => {
                warn!(%handle, error = %e, "stream: append failed, abandoning capture");
                abandon(store, stream);
                return Ok(());
            }
        };
        if len != expected {
            warn!(%handle, len, expected, "stream: blob out of step, abandoning capture");
            abandon(store, stream);
            return Ok(());
        }
        stream.written_offset = len;
        trace!(%handle, written = len, declared = stream.declared_size, "stream: captured");

        if stream.written_offset == stream.declared_size {
            if let Err(e) = finish_capture(store, stream) {
                warn!(%handle, error = %e, "stream: promotion failed, abandoning capture");
                abandon(store, stream);
                return Ok(());
            }
            let completion = StreamCompletion {
                label: stream.label(),
                elapsed: stream.started_at.elapsed(),
                source: CompletionSource::Server,
            };
            self.stats.record_completion(completion);
        }
        Ok(())
    }
}

/// Reuse a complete earlier capture of `location`, or start a fresh one in a
/// blob of its own.
fn begin_capture(
    store: &dyn CacheStore,
    stream: &mut TrackedStream,
    location: StreamLocation,
) -> CacheResult<()> {
    let declared = stream.declared_size;
    let existing = store.lookup_stream(&location)?;
    if let Some(record) = existing.as_ref().filter(|r| r.complete && r.declared_size == declared) {
        if store.blob_len(&record.blob)? == declared {
            stream.blob = Some(record.blob);
            stream.written_offset = declared;
            stream.cached = true;
            return Ok(());
        }
    }

    let blob = BlobId::for_capture(&location, Uuid::now_v7().as_u128());
    stream.blob = Some(blob);
    if declared == 0 {
        store.blob_reset(&blob)?;
        return finish_capture(store, stream);
    }
    // A complete record of another size stays until this capture replaces it.
    if !existing.is_some_and(|r| r.complete) {
        store.commit_stream(&StreamRecord::with_blob(location, blob, declared, false))?;
    }
    Ok(())
}

/// Promote a stream whose blob holds `declared_size` bytes. If another
/// capture of the same location got there first, its blob is adopted and
/// this one removed.
fn finish_capture(store: &dyn CacheStore, stream: &mut TrackedStream) -> CacheResult<()> {
    let (Some(location), Some(blob)) = (stream.location, stream.blob) else {
        return Ok(());
    };
    let record = StreamRecord::with_blob(location, blob, stream.declared_size, true);
    let current = store.promote_stream(&record)?;
    if current.blob != blob {
        debug!(location = %location, "stream: earlier capture kept");
        if let Err(e) = store.blob_remove(&blob) {
            warn!(blob = %blob.short_hex(), error = %e, "failed to remove duplicate capture");
        }
        stream.blob = Some(current.blob);
    }
    stream.cached = true;
    Ok(())
}

/// Drop a capture in progress. Only called on uncached streams, whose blob
/// belongs to this capture alone.
fn abandon(store: &dyn CacheStore, stream: &mut TrackedStream) {
    if let Some(blob) = stream.blob.take() {
        if let Err(e) = store.blob_remove(&blob) {
            warn!(blob = %blob.short_hex(), error = %e, "failed to remove abandoned blob");
        }
    }
    stream.cached = false;
}
