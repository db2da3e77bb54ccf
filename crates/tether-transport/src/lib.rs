//! # TETHER Transport
//!
//! Pluggable transports and the framed connection facade used by the
//! session runtime.
//!
//! This crate provides:
//! - The [`Transport`] trait (connect/listen) over a closed set of drivers
//! - A [`Connection`] facade that frames whole packets over stream or
//!   datagram I/O, with advisory deadlines and abortable reads/writes
//! - The open [`Wrap`] interface for user-supplied framing/cipher layers
//! - TCP and UDP drivers, plus the local IPC pipe used by handoff
//!
//! The facade guarantees that one successful read yields exactly one
//! packet body regardless of the underlying transport family.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod conn;
pub mod error;
#[cfg(unix)]
pub mod pipe;
pub mod tcp;
pub mod transport;
pub mod udp;
pub mod wrap;

pub use conn::{Connection, Datagram, RecvHalf, SendHalf};
pub use error::TransportError;
#[cfg(unix)]
pub use pipe::Pipe;
pub use tcp::Tcp;
pub use transport::{Listener, Transport};
pub use udp::Udp;
pub use wrap::{Wrap, WrapStack, XorWrap};

/// Upper bound on a single framed packet body (16 MiB).
pub const MAX_FRAME: usize = 1 << 24;

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
