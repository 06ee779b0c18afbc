use std::fmt;

use serde::{Deserialize, Serialize};

/// ROP operation numbers.
///
/// Only the calls the cache observes get their own variant; everything else
/// is carried through as [`Opnum::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opnum {
    Release,
    OpenMessage,
    OpenAttach,
    OpenStream,
    ReadStream,
    Other(u8),
}

impl Opnum {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0x01 => Self::Release,
            0x03 => Self::OpenMessage,
            0x22 => Self::OpenAttach,
            0x2B => Self::OpenStream,
            0x2C => Self::ReadStream,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Release => 0x01,
            Self::OpenMessage => 0x03,
            Self::OpenAttach => 0x22,
            Self::OpenStream => 0x2B,
            Self::ReadStream => 0x2C,
            Self::Other(raw) => *raw,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Release => "Release",
            Self::OpenMessage => "OpenMessage",
            Self::OpenAttach => "OpenAttach",
            Self::OpenStream => "OpenStream",
            Self::ReadStream => "ReadStream",
            Self::Other(_) => "Other",
        }
    }

    /// Release never produces a reply entry, which is what makes request and
    /// reply arrays drift apart.
    pub fn has_reply(&self) -> bool {
        !matches!(self, Self::Release)
    }
}

impl fmt::Display for Opnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "Other({raw:#04x})"),
            named => write!(f, "{}", named.name()),
        }
    }
}
