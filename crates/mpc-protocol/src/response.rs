use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::handle::Handle;
use crate::opnum::Opnum;
use crate::status::MapiStatus;

/// Kind-specific fields of a ROP reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody {
    OpenMessage,
    OpenAttach,
    OpenStream { stream_size: u32 },
    ReadStream { data: Vec<u8> },
    Other { opnum: u8 },
}

impl ReplyBody {
    /// Body carried by a failed reply of the given kind.
    pub fn empty(opnum: Opnum) -> Self {
        match opnum {
            Opnum::OpenMessage => Self::OpenMessage,
            Opnum::OpenAttach => Self::OpenAttach,
            Opnum::OpenStream => Self::OpenStream { stream_size: 0 },
            Opnum::ReadStream => Self::ReadStream { data: Vec::new() },
            other => Self::Other {
                opnum: other.as_u8(),
            },
        }
    }
}

/// One reply of an incoming batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyCall {
    pub handle_idx: u8,
    pub status: MapiStatus,
    pub body: ReplyBody,
}

impl ReplyCall {
    pub fn success(handle_idx: u8, body: ReplyBody) -> Self {
        Self {
            handle_idx,
            status: MapiStatus::SUCCESS,
            body,
        }
    }

    pub fn failure(handle_idx: u8, opnum: Opnum, status: MapiStatus) -> Self {
        Self {
            handle_idx,
            status,
            body: ReplyBody::empty(opnum),
        }
    }

    pub fn opnum(&self) -> Opnum {
        match &self.body {
            ReplyBody::OpenMessage => Opnum::OpenMessage,
            ReplyBody::OpenAttach => Opnum::OpenAttach,
            ReplyBody::OpenStream { .. } => Opnum::OpenStream,
            ReplyBody::ReadStream { .. } => Opnum::ReadStream,
            ReplyBody::Other { opnum } => Opnum::from_u8(*opnum),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Declared size of an opened stream.
    pub fn stream_size(&self) -> ProtocolResult<u32> {
        match &self.body {
            ReplyBody::OpenStream { stream_size } => Ok(*stream_size),
            _ => Err(ProtocolError::UnexpectedReplyBody {
                opnum: self.opnum().to_string(),
            }),
        }
    }

    /// Payload of a stream read.
    pub fn read_data(&self) -> ProtocolResult<&[u8]> {
        match &self.body {
            ReplyBody::ReadStream { data } => Ok(data),
            _ => Err(ProtocolError::UnexpectedReplyBody {
                opnum: self.opnum().to_string(),
            }),
        }
    }
}

/// An incoming `EcDoRpc` batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapiResponse {
    pub replies: Vec<ReplyCall>,
    pub handles: Vec<Handle>,
}

impl MapiResponse {
    pub fn new(replies: Vec<ReplyCall>, handles: Vec<Handle>) -> Self {
        Self { replies, handles }
    }

    pub fn is_idle(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
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
}
