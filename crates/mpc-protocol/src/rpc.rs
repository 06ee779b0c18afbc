use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// DCE/RPC operation number of `EcDoRpc` on the `exchange_emsmdb` endpoint.
/// Every other operation on the endpoint is passed through untouched.
pub const ECDORPC_OPNUM: u16 = 0x2;

/// Identity of one client connection to the proxy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RPC-level envelope of a call received by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    pub connection: ConnectionId,
    pub opnum: u16,
}

impl RpcCall {
    pub fn ecdorpc(connection: ConnectionId) -> Self {
        Self {
            connection,
            opnum: ECDORPC_OPNUM,
        }
    }

    pub fn is_ecdorpc(&self) -> bool {
        self.opnum == ECDORPC_OPNUM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn ecdorpc_filter() {
        let conn = ConnectionId::new();
        assert!(RpcCall::ecdorpc(conn).is_ecdorpc());
        assert!(!RpcCall { connection: conn, opnum: 0x1 }.is_ecdorpc());
    }
}
