use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-reply MAPI status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapiStatus(u32);

impl MapiStatus {
    pub const SUCCESS: MapiStatus = MapiStatus(0x0000_0000);
    pub const MAPI_E_CALL_FAILED: MapiStatus = MapiStatus(0x8000_4005);
    pub const MAPI_E_NO_SUPPORT: MapiStatus = MapiStatus(0x8004_0102);
    pub const MAPI_E_NOT_FOUND: MapiStatus = MapiStatus(0x8004_010F);
    pub const MAPI_E_NO_ACCESS: MapiStatus = MapiStatus(0x8007_0005);
    pub const MAPI_E_INVALID_PARAMETER: MapiStatus = MapiStatus(0x8007_0057);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::SUCCESS => "MAPI_E_SUCCESS",
            Self::MAPI_E_CALL_FAILED => "MAPI_E_CALL_FAILED",
            Self::MAPI_E_NO_SUPPORT => "MAPI_E_NO_SUPPORT",
            Self::MAPI_E_NOT_FOUND => "MAPI_E_NOT_FOUND",
            Self::MAPI_E_NO_ACCESS => "MAPI_E_NO_ACCESS",
            Self::MAPI_E_INVALID_PARAMETER => "MAPI_E_INVALID_PARAMETER",
            _ => "MAPI_E_UNKNOWN",
        }
    }
}

impl Default for MapiStatus {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl fmt::Debug for MapiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#010x})", self.name(), self.0)
    }
}

impl fmt::Display for MapiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
