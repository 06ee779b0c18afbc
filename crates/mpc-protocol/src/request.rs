use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::handle::Handle;
use crate::opnum::Opnum;
use crate::response::ReplyCall;

/// Kind-specific fields of an outgoing ROP call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    OpenMessage {
        folder_id: u64,
        message_id: u64,
        output_handle_idx: u8,
    },
    OpenAttach {
        attachment_id: u32,
        output_handle_idx: u8,
    },
    OpenStream {
        property_tag: u32,
        output_handle_idx: u8,
    },
    ReadStream {
        byte_count: u16,
    },
    Release,
    Other {
        opnum: u8,
    },
}

/// One call of an outgoing batch.
///
/// `handle_idx` is the input handle slot (the object the call acts on). Open
/// calls additionally name the slot the server fills with the new handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCall {
    pub handle_idx: u8,
    pub body: RequestBody,
}

impl RequestCall {
    pub fn open_message(handle_idx: u8, output_handle_idx: u8, folder_id: u64, message_id: u64) -> Self {
        Self {
            handle_idx,
            body: RequestBody::OpenMessage {
                folder_id,
                message_id,
                output_handle_idx,
            },
        }
    }

    pub fn open_attach(handle_idx: u8, output_handle_idx: u8, attachment_id: u32) -> Self {
        Self {
            handle_idx,
            body: RequestBody::OpenAttach {
                attachment_id,
                output_handle_idx,
            },
        }
    }

    pub fn open_stream(handle_idx: u8, output_handle_idx: u8, property_tag: u32) -> Self {
        Self {
            handle_idx,
            body: RequestBody::OpenStream {
                property_tag,
                output_handle_idx,
            },
        }
    }

    pub fn read_stream(handle_idx: u8, byte_count: u16) -> Self {
        Self {
            handle_idx,
            body: RequestBody::ReadStream { byte_count },
        }
    }

    pub fn release(handle_idx: u8) -> Self {
        Self {
            handle_idx,
            body: RequestBody::Release,
        }
    }

    pub fn other(handle_idx: u8, opnum: u8) -> Self {
        Self {
            handle_idx,
            body: RequestBody::Other { opnum },
        }
    }

    pub fn opnum(&self) -> Opnum {
        match &self.body {
            RequestBody::OpenMessage { .. } => Opnum::OpenMessage,
            RequestBody::OpenAttach { .. } => Opnum::OpenAttach,
            RequestBody::OpenStream { .. } => Opnum::OpenStream,
            RequestBody::ReadStream { .. } => Opnum::ReadStream,
            RequestBody::Release => Opnum::Release,
            RequestBody::Other { opnum } => Opnum::from_u8(*opnum),
        }
    }

    /// Handle slot the server's reply refers to: the output slot for open
    /// calls, the input slot otherwise.
    pub fn result_handle_idx(&self) -> u8 {
        match &self.body {
            RequestBody::OpenMessage { output_handle_idx, .. }
            | RequestBody::OpenAttach { output_handle_idx, .. }
            | RequestBody::OpenStream { output_handle_idx, .. } => *output_handle_idx,
            _ => self.handle_idx,
        }
    }
}

/// An outgoing `EcDoRpc` batch: explicit-length call list plus the handle
/// array the calls index into.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapiRequest {
    pub calls: Vec<RequestCall>,
    pub handles: Vec<Handle>,
}

impl MapiRequest {
    pub fn new(calls: Vec<RequestCall>, handles: Vec<Handle>) -> Self {
        Self { calls, handles }
    }

    /// Keep-alive batches carry no calls and are never observed.
    pub fn is_idle(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn handle_at(&self, index: u8) -> ProtocolResult<Handle> {
        self.handles
            .get(index as usize)
            .copied()
            .ok_or(ProtocolError::HandleIndexOutOfRange {
                index,
                len: self.handles.len(),
            })
    }

    /// Handle the call acts on.
    pub fn input_handle(&self, call: &RequestCall) -> ProtocolResult<Handle> {
        self.handle_at(call.handle_idx)
    }

    /// Find the request call a reply answers.
    ///
    /// Release calls have no reply, so positions cannot be trusted. The
    /// first call of the same opnum whose result slot equals the reply's
    /// handle slot wins; failing that, the first call of the same opnum.
    pub fn correlate(&self, reply: &ReplyCall) -> Option<&RequestCall> {
        let opnum = reply.opnum();
        let mut candidates = self.calls.iter().filter(|call| call.opnum() == opnum);
        let first = candidates.clone().next();
        candidates
            .find(|call| call.result_handle_idx() == reply.handle_idx)
            .or(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ReplyBody;
    use crate::status::MapiStatus;

    fn h(raw: u32) -> Handle {
        Handle::new(raw)
    }

    #[test]
    fn opnum_and_result_slot() {
        let open = RequestCall::open_message(0, 1, 10, 55);
        assert_eq!(open.opnum(), Opnum::OpenMessage);
        assert_eq!(open.result_handle_idx(), 1);

        let read = RequestCall::read_stream(2, 512);
        assert_eq!(read.opnum(), Opnum::ReadStream);
        assert_eq!(read.result_handle_idx(), 2);

        assert_eq!(RequestCall::other(0, 0x70).opnum(), Opnum::Other(0x70));
    }

    #[test]
    fn handle_at_is_bounds_checked() {
        let req = MapiRequest::new(vec![RequestCall::release(3)], vec![h(1), h(2)]);
        assert_eq!(req.handle_at(1).unwrap(), h(2));
        assert_eq!(
            req.handle_at(3).unwrap_err(),
            ProtocolError::HandleIndexOutOfRange { index: 3, len: 2 }
        );
    }

    #[test]
    fn idle_batch() {
        assert!(MapiRequest::default().is_idle());
        let req = MapiRequest::new(vec![RequestCall::release(0)], vec![h(1)]);
        assert!(!req.is_idle());
        assert_eq!(req.len(), 1);
    }

    #[test]
    fn correlate_skips_release() {
        // Release at position 0 has no reply, so the reply at position 0
        // answers the call at position 1.
        let req = MapiRequest::new(
            vec![
                RequestCall::release(0),
                RequestCall::open_message(1, 2, 10, 55),
            ],
            vec![h(0x500), h(0x600), Handle::UNSET],
        );
        let reply = ReplyCall::success(2, ReplyBody::OpenMessage);
        let call = req.correlate(&reply).expect("correlated");
        assert_eq!(call.opnum(), Opnum::OpenMessage);
    }

    #[test]
    fn correlate_prefers_matching_slot() {
        let req = MapiRequest::new(
            vec![
                RequestCall::open_message(0, 1, 10, 1),
                RequestCall::open_message(0, 2, 10, 2),
            ],
            vec![h(0x500), Handle::UNSET, Handle::UNSET],
        );
        let reply = ReplyCall::success(2, ReplyBody::OpenMessage);
        match &req.correlate(&reply).unwrap().body {
            RequestBody::OpenMessage { message_id, .. } => assert_eq!(*message_id, 2),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn correlate_falls_back_to_first_of_kind() {
        let req = MapiRequest::new(
            vec![RequestCall::open_message(0, 1, 10, 1)],
            vec![h(0x500), Handle::UNSET],
        );
        let reply = ReplyCall::failure(7, Opnum::OpenMessage, MapiStatus::MAPI_E_NOT_FOUND);
        assert!(req.correlate(&reply).is_some());
    }

    #[test]
    fn correlate_miss() {
        let req = MapiRequest::new(vec![RequestCall::release(0)], vec![h(1)]);
        let reply = ReplyCall::success(0, ReplyBody::ReadStream { data: vec![] });
        assert!(req.correlate(&reply).is_none());
    }

    #[test]
    fn json_roundtrip() {
        let req = MapiRequest::new(
            vec![RequestCall::open_stream(0, 1, 0x3701), RequestCall::read_stream(1, 1024)],
            vec![h(0x2000), Handle::UNSET],
        );
        let json = serde_json::to_string(&req).unwrap();
        let back: MapiRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
