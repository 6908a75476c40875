//! Serialized command transport between the application and network cores.

use std::fmt::{self, Debug, Display, Formatter};

use tracing::error;

pub use {proxy::*, router::*, token::*};

mod proxy;
mod router;
mod token;

/// Error type shared by both ends of the link.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("out of memory")]
    NoMem,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("operation already in progress")]
    Already,
    #[error("not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("malformed {0} message")]
    BadMessage(CmdId),
    #[error("internal fault")]
    Fault,
    #[error("peer error {0}")]
    Peer(i32),
}

impl Error {
    /// Returns the negative status code used on the wire.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::NoMem => -1,
            Self::InvalidParam => -2,
            Self::Already => -3,
            Self::NotFound => -4,
            Self::NotSupported => -5,
            Self::BadMessage(_) => -6,
            Self::Fault => -7,
            Self::Peer(c) => c,
        }
    }

    /// Converts a wire status code back into an error. Non-negative codes are
    /// not errors and map to `None`.
    #[must_use]
    pub const fn from_code(c: i32) -> Option<Self> {
        if c >= 0 {
            return None;
        }
        Some(match c {
            -1 => Self::NoMem,
            -2 => Self::InvalidParam,
            -3 => Self::Already,
            -4 => Self::NotFound,
            -5 => Self::NotSupported,
            -7 => Self::Fault,
            _ => Self::Peer(c),
        })
    }
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Opaque connection identifier, carried verbatim on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnId(pub u16);

impl Display for ConnId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn {:#06X}", self.0)
    }
}

impl From<ConnId> for u16 {
    #[inline]
    fn from(c: ConnId) -> Self {
        c.0
    }
}

/// Command identifiers. Commands below `DiscoverCallback` flow from the
/// client to the host; the rest are callbacks flowing back.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum CmdId {
    Discover = 0x01,
    Read = 0x02,
    Write = 0x03,
    WriteWithoutResponse = 0x04,
    Subscribe = 0x05,
    Resubscribe = 0x06,
    Unsubscribe = 0x07,
    SubscribeFlagUpdate = 0x08,
    DiscoverCallback = 0x81,
    ReadCallback = 0x82,
    WriteCallback = 0x83,
    CompleteCallback = 0x84,
    NotifyCallback = 0x85,
    SubscribeWriteCallback = 0x86,
}

impl Display for CmdId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Command channel to the remote core. `cmd` delivers one serialized command
/// and blocks for the matching response. Responses to malformed commands may
/// never arrive at the sender, so decoding failures are also reported
/// out-of-band via `report`.
pub trait Transport: Debug + Send + Sync {
    /// Sends command `id` with `payload` and returns the raw response.
    fn cmd(&self, id: CmdId, payload: &[u8]) -> Result<Vec<u8>>;

    /// Reports a command decoding failure to the error sink.
    fn report(&self, id: CmdId, err: &Error) {
        error!("{id} failed: {err}");
    }
}
