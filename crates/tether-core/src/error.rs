//! Error types for the session runtime.
//!
//! Failures that cross the wire or the handoff pipe carry a stable
//! numeric code so peers built from different revisions agree on what
//! went wrong.

use thiserror::Error;

/// Errors raised by the session runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The send queue cannot accept the packet (or all of its fragments).
    #[error("send buffer is full")]
    FullBuffer,

    /// A frag/multi packet declared a total of zero.
    #[error("frag/multi total is zero on a frag/multi packet")]
    InvalidPacketCount,

    /// The active profile group has no transport driver.
    #[error("active group is not a connector")]
    NotAConnector,

    /// The operation requires a client session.
    #[error("must be a client session")]
    NotClient,

    /// A handoff is already in progress.
    #[error("migration in progress")]
    Migrating,

    /// The profile contains a layer that cannot be serialized.
    #[error("cannot marshal profile")]
    CannotMarshalProfile,

    /// The handoff peer answered with something other than `OK`.
    #[error("unexpected OK value")]
    BadResponse,

    /// The pipe base name is empty.
    #[error("empty or invalid pipe name")]
    EmptyName,

    /// The child never connected to the handoff pipe.
    #[error("no connection to child process")]
    NoConn,

    /// The session cannot accept packets any more.
    #[error("session is closed")]
    Closed,

    /// The peer answered the hello exchange with an unexpected packet.
    #[error("server sent an invalid response")]
    InvalidResponse,

    /// A packet failed structural validation.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// The marshalled profile carries an unknown version byte.
    #[error("unsupported profile version 0x{0:02X}")]
    ProfileVersion(u8),

    /// A marshalled profile ended early or carried invalid fields.
    #[error("malformed profile: {0}")]
    MalformedProfile(&'static str),

    /// The host receive handler rejected a packet.
    #[error("receive handler: {0}")]
    Handler(String),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] tether_transport::TransportError),

    /// Masking or key failure.
    #[error(transparent)]
    Crypto(#[from] tether_crypto::CryptoError),

    /// Local I/O failure (handoff pipe, process start).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Protocol-stable numeric code, where one is assigned.
    #[must_use]
    pub fn code(&self) -> Option<u8> {
        match self {
            CoreError::EmptyName => Some(0x43),
            CoreError::BadResponse => Some(0x45),
            CoreError::FullBuffer => Some(0x4C),
            CoreError::InvalidPacketCount => Some(0x4D),
            CoreError::NotClient => Some(0x4E),
            CoreError::Migrating => Some(0x4F),
            CoreError::CannotMarshalProfile => Some(0x50),
            _ => None,
        }
    }
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(CoreError::FullBuffer.code(), Some(0x4C));
        assert_eq!(CoreError::InvalidPacketCount.code(), Some(0x4D));
        assert_eq!(CoreError::Migrating.code(), Some(0x4F));
        assert_eq!(CoreError::CannotMarshalProfile.code(), Some(0x50));
        assert_eq!(CoreError::BadResponse.code(), Some(0x45));
        assert_eq!(CoreError::NotAConnector.code(), None);
        assert_eq!(CoreError::NoConn.code(), None);
    }
}
