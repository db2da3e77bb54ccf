//! Transport layer errors.

use thiserror::Error;

/// Errors raised by transports, listeners and the connection facade.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was aborted by the other half.
    #[error("connection aborted")]
    Aborted,

    /// An advisory deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The peer closed the conduit mid-frame.
    #[error("connection closed")]
    Closed,

    /// A frame exceeded the configured maximum size.
    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    /// The driver does not support the requested operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// A wrapper layer rejected the packet body.
    #[error("wrapper error: {0}")]
    Wrap(String),
}
