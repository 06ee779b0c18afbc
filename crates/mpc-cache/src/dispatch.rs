//! Short-circuit decision: answer a batch from the cache or forward it.
//!
//! A batch is answered locally only if every call is a ReadStream on a
//! stream whose capture is complete. Reads are planned first and cursors
//! committed only once every read succeeded, so a batch is either answered
//! in full or left untouched.

use mpc_protocol::{Handle, MapiRequest, MapiResponse, ReplyBody, ReplyCall, RequestBody};
use mpc_store::CacheStore;
use tracing::{debug, warn};

use crate::registry::ObjectRegistry;
use crate::stats::{CacheStats, CompletionSource, StreamCompletion};

/// Build the reply to `request` from cached blobs, or `None` to forward it.
pub fn try_short_circuit(
    registry: &mut ObjectRegistry,
    store: &dyn CacheStore,
    stats: &mut CacheStats,
    request: &MapiRequest,
) -> Option<MapiResponse> {
    if request.is_empty() {
        return None;
    }

    // Cursor each stream reaches after this batch, in first-read order.
    let mut cursors: Vec<(Handle, u64)> = Vec::new();
    let mut replies = Vec::with_capacity(request.len());
    let mut served = 0u64;

    for call in &request.calls {
        let RequestBody::ReadStream { byte_count } = &call.body else {
            return None;
        };
        let handle = request.input_handle(call).ok()?;
        let stream = registry.stream_by_handle(handle)?;
        if !stream.cached {
            return None;
        }
        let blob = stream.blob?;

        let slot = match cursors.iter().position(|(h, _)| *h == handle) {
            Some(slot) => slot,
            None => {
                cursors.push((handle, stream.read_offset));
                cursors.len() - 1
            }
        };
        let cursor = cursors[slot].1;
        let remaining = stream.declared_size.saturating_sub(cursor);
        let want = remaining.min(u64::from(*byte_count)) as usize;

        let data = match store.blob_read(&blob, cursor, want) {
            Ok(data) => data,
            Err(e) => {
                warn!(%handle, error = %e, "cached read failed, forwarding batch");
                return None;
            }
        };
        if data.len() != want {
            warn!(%handle, cursor, want, got = data.len(), "cached blob short, forwarding batch");
            return None;
        }
        cursors[slot].1 = cursor + want as u64;
        served += want as u64;
        replies.push(ReplyCall::success(call.handle_idx, ReplyBody::ReadStream { data }));
    }

    for (handle, cursor) in cursors {
        let Some(stream) = registry.stream_by_handle_mut(handle) else {
            continue;
        };
        let reached_end = stream.read_offset < stream.declared_size && cursor == stream.declared_size;
        stream.read_offset = cursor;
        if reached_end {
            let completion = StreamCompletion {
                label: stream.label(),
                elapsed: stream.started_at.elapsed(),
                source: CompletionSource::Cache,
            };
            stats.record_completion(completion);
        }
    }
    stats.short_circuited_batches += 1;
    stats.bytes_from_cache += served;
    debug!(calls = request.len(), bytes = served, "batch served from cache");

    Some(MapiResponse::new(replies, request.handles.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_protocol::RequestCall;
    use mpc_store::{InMemoryCacheStore, StreamLocation};

    use crate::tracked::{MessageKey, StreamKey, StreamOwner, TrackedStream};

    fn h(raw: u32) -> Handle {
        Handle::new(raw)
    }

    /// Registry with one confirmed, fully captured stream per `(handle, content)`.
    fn setup(streams: &[(u32, &[u8])]) -> (ObjectRegistry, InMemoryCacheStore) {
        let mut registry = ObjectRegistry::new();
        let store = InMemoryCacheStore::new();
        for (i, (handle, content)) in streams.iter().enumerate() {
            let location = StreamLocation::message(1, i as u64, 0x1000_001F);
            let key = StreamKey::new(h(0x1000 + i as u32), 0x1000_001F);
            let mut stream =
                TrackedStream::provisional(key, StreamOwner::Message(MessageKey::new(1, i as u64)));
            stream.declared_size = content.len() as u64;
            stream.written_offset = content.len() as u64;
            stream.cached = true;
            stream.blob = Some(location.blob_id());
            stream.location = Some(location);
            registry.upsert_stream(stream).unwrap();
            registry.confirm_stream(&key, h(*handle)).unwrap();
            store.blob_append(&location.blob_id(), content).unwrap();
        }
        (registry, store)
    }

    fn read_batch(reads: &[(u32, u16)]) -> MapiRequest {
        let handles = reads.iter().map(|(handle, _)| h(*handle)).collect();
        let calls = reads
            .iter()
            .enumerate()
            .map(|(i, (_, count))| RequestCall::read_stream(i as u8, *count))
            .collect();
        MapiRequest::new(calls, handles)
    }

    fn payload(reply: &ReplyCall) -> &[u8] {
        reply.read_data().unwrap()
    }

    #[test]
    fn serves_cached_stream_in_chunks() {
        let (mut registry, store) = setup(&[(0x3000, b"hello world".as_slice())]);
        let mut stats = CacheStats::new();

        let first = try_short_circuit(&mut registry, &store, &mut stats, &read_batch(&[(0x3000, 5)]))
            .expect("served");
        assert_eq!(payload(&first.replies[0]), b"hello".as_slice());
        assert!(first.replies[0].is_success());

        let second = try_short_circuit(&mut registry, &store, &mut stats, &read_batch(&[(0x3000, 100)]))
            .expect("served");
        assert_eq!(payload(&second.replies[0]), b" world".as_slice());
        assert_eq!(registry.stream_by_handle(h(0x3000)).unwrap().read_offset, 11);
        assert_eq!(stats.streams_completed, 1);
        assert_eq!(stats.recent_completions()[0].source, CompletionSource::Cache);

        // At the end: empty reads, no second completion.
        let third = try_short_circuit(&mut registry, &store, &mut stats, &read_batch(&[(0x3000, 100)]))
            .expect("served");
        assert!(payload(&third.replies[0]).is_empty());
        assert_eq!(stats.streams_completed, 1);
        assert_eq!(stats.short_circuited_batches, 3);
        assert_eq!(stats.bytes_from_cache, 11);
    }

    #[test]
    fn same_stream_twice_in_one_batch() {
        let (mut registry, store) = setup(&[(0x3000, b"abcdef".as_slice())]);
        let mut stats = CacheStats::new();
        let request = MapiRequest::new(
            vec![RequestCall::read_stream(0, 4), RequestCall::read_stream(0, 4)],
            vec![h(0x3000)],
        );
        let response = try_short_circuit(&mut registry, &store, &mut stats, &request).unwrap();
        assert_eq!(payload(&response.replies[0]), b"abcd".as_slice());
        assert_eq!(payload(&response.replies[1]), b"ef".as_slice());
        assert_eq!(registry.stream_by_handle(h(0x3000)).unwrap().read_offset, 6);
    }

    #[test]
    fn mixed_batch_is_forwarded_untouched() {
        let (mut registry, store) = setup(&[(0x3000, b"abcdef".as_slice())]);
        let mut stats = CacheStats::new();
        let request = MapiRequest::new(
            vec![RequestCall::read_stream(0, 4), RequestCall::release(0)],
            vec![h(0x3000)],
        );
        assert!(try_short_circuit(&mut registry, &store, &mut stats, &request).is_none());
        assert_eq!(registry.stream_by_handle(h(0x3000)).unwrap().read_offset, 0);
        assert_eq!(stats, CacheStats::default());
    }

    #[test]
    fn uncached_stream_forwards_whole_batch() {
        let (mut registry, store) = setup(&[(0x3000, b"abcdef".as_slice()), (0x3001, b"xyz".as_slice())]);
        registry.stream_by_handle_mut(h(0x3001)).unwrap().cached = false;
        let mut stats = CacheStats::new();
        let request = read_batch(&[(0x3000, 2), (0x3001, 2)]);
        assert!(try_short_circuit(&mut registry, &store, &mut stats, &request).is_none());
        assert_eq!(registry.stream_by_handle(h(0x3000)).unwrap().read_offset, 0);
    }

    #[test]
    fn unknown_handle_forwards() {
        let (mut registry, store) = setup(&[(0x3000, b"abc".as_slice())]);
        let mut stats = CacheStats::new();
        assert!(try_short_circuit(&mut registry, &store, &mut stats, &read_batch(&[(0x4000, 1)])).is_none());
    }

    #[test]
    fn empty_batch_forwards() {
        let (mut registry, store) = setup(&[]);
        let mut stats = CacheStats::new();
        assert!(try_short_circuit(&mut registry, &store, &mut stats, &MapiRequest::default()).is_none());
    }

    #[test]
    fn truncated_blob_forwards() {
        let (mut registry, store) = setup(&[(0x3000, b"abcdef".as_slice())]);
        let blob = registry.stream_by_handle(h(0x3000)).unwrap().blob.unwrap();
        store.blob_reset(&blob).unwrap();
        store.blob_append(&blob, b"abc".as_slice()).unwrap();
        let mut stats = CacheStats::new();
        assert!(try_short_circuit(&mut registry, &store, &mut stats, &read_batch(&[(0x3000, 6)])).is_none());
        assert_eq!(registry.stream_by_handle(h(0x3000)).unwrap().read_offset, 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn reads_bounded_and_monotonic(
                size in 0usize..4096,
                counts in proptest::collection::vec(0u16..1500, 1..12),
            ) {
                let content: Vec<u8> = (0..size).map(|i| i as u8).collect();
                let (mut registry, store) = setup(&[(0x3000, content.as_slice())]);
                let mut stats = CacheStats::new();
                let mut previous = 0u64;
                let mut served = Vec::new();
                for count in counts {
                    let response = try_short_circuit(
                        &mut registry, &store, &mut stats, &read_batch(&[(0x3000, count)]),
                    ).unwrap();
                    let data = payload(&response.replies[0]);
                    prop_assert!(data.len() <= count as usize);
                    served.extend_from_slice(data);
                    let cursor = registry.stream_by_handle(h(0x3000)).unwrap().read_offset;
                    prop_assert!(cursor >= previous);
                    prop_assert!(cursor <= size as u64);
                    previous = cursor;
                }
                prop_assert_eq!(&served[..], &content[..served.len()]);
                prop_assert!(stats.streams_completed <= 1);
            }
        }
    }
}
