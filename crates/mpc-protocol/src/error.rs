use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handle index {index} out of range (batch carries {len} handles)")]
    HandleIndexOutOfRange { index: u8, len: usize },

    #[error("unexpected reply body for {opnum}")]
    UnexpectedReplyBody { opnum: String },
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
