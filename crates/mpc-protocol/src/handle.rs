use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier the server assigns to a live object (message,
/// attachment, stream, folder, ...).
///
/// Handles are only meaningful for equality. A tracked object whose handle is
/// not known yet holds `Option<Handle>::None`; [`Handle::UNSET`] is the value
/// the wire format uses for "no handle" and is never treated as a match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Wire sentinel for an unassigned handle slot.
    pub const UNSET: Handle = Handle(0xFFFF_FFFF);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Returns `true` for the wire sentinel.
    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_sentinel() {
        assert!(Handle::UNSET.is_unset());
        assert!(!Handle::new(0x1000).is_unset());
        assert_eq!(Handle::UNSET.raw(), 0xFFFF_FFFF);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(Handle::new(0x3000).to_string(), "0x3000");
        assert_eq!(format!("{:?}", Handle::new(0x10)), "Handle(0x10)");
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&Handle::new(4096)).unwrap();
        assert_eq!(json, "4096");
        let back: Handle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Handle::new(4096));
    }
}
