//! Pre-parsed `EcDoRpc` batch model for the MAPI proxy cache.
//!
//! The proxy receives every client call already unmarshalled by the host RPC
//! server. This crate describes that pre-parsed shape: a batch of ROP calls
//! plus the shared handle array they index into, and the matching reply
//! batch. Wire encoding is the host's concern and is not modelled here.
//!
//! # Key Types
//!
//! - [`Handle`] -- opaque server object handle
//! - [`Opnum`] -- closed set of ROP operation numbers the cache observes
//! - [`MapiStatus`] -- per-reply status code
//! - [`MapiRequest`] / [`RequestCall`] -- outgoing batch
//! - [`MapiResponse`] / [`ReplyCall`] -- incoming batch
//! - [`RpcCall`] -- the RPC-level envelope (connection and DCE/RPC opnum)

pub mod error;
pub mod handle;
pub mod opnum;
pub mod request;
pub mod response;
pub mod rpc;
pub mod status;

pub use error::{ProtocolError, ProtocolResult};
pub use handle::Handle;
pub use opnum::Opnum;
pub use request::{MapiRequest, RequestBody, RequestCall};
pub use response::{MapiResponse, ReplyBody, ReplyCall};
pub use rpc::{ConnectionId, RpcCall, ECDORPC_OPNUM};
pub use status::MapiStatus;
