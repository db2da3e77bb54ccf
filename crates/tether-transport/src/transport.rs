//! The transport driver abstraction.
//!
//! Drivers are a closed set of tagged implementations (TCP, UDP, the
//! local pipe); the trait exists so the session core can hold any of
//! them behind one seam without caring which family it got.

use async_trait::async_trait;

use crate::Result;
use crate::conn::Connection;

/// A connection factory for one transport family.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `addr`.
    ///
    /// The address format is driver-specific: `host:port` for network
    /// drivers, a filesystem path for the pipe.
    async fn connect(&self, addr: &str) -> Result<Connection>;

    /// Bind a listener on `addr`.
    ///
    /// Drivers without a server side return
    /// [`TransportError::NotSupported`](crate::TransportError::NotSupported).
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// An accepting socket yielding framed connections.
#[async_trait]
pub trait Listener: Send {
    /// Wait for and accept one inbound connection.
    async fn accept(&mut self) -> Result<Connection>;

    /// The bound address, for logs.
    fn local_addr(&self) -> String;
}
