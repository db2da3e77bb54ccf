//! Local IPC pipe used by the handoff protocol.
//!
//! Endpoint names are derived from a caller-supplied base plus a process
//! id in lowercase hex, so a parent can address the pipe its child is
//! about to bind without any coordination beyond the base name.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{Instant, sleep};

use crate::conn::Connection;
use crate::error::TransportError;
use crate::transport::{Listener, Transport};
use crate::Result;

/// Interval between connect attempts while waiting for the child's
/// listener to appear.
const SPIN_INTERVAL: Duration = Duration::from_millis(100);

/// Derive the pipe endpoint path for `base` and `pid`.
#[must_use]
pub fn format(base: &str, pid: u32) -> PathBuf {
    std::env::temp_dir().join(std::format!("{base}.{pid:x}"))
}

/// Repeatedly try to connect to the pipe `base`.`pid` until `timeout`
/// elapses.
///
/// The target process needs time to start and bind its listener, so a
/// refused or missing endpoint is retried rather than reported.
pub async fn spin_connect(base: &str, pid: u32, timeout: Duration) -> Result<UnixStream> {
    let path = format(base, pid);
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => return Ok(stream),
            Err(_) if Instant::now() < deadline => sleep(SPIN_INTERVAL).await,
            Err(_) => return Err(TransportError::DeadlineExceeded),
        }
    }
}

/// Bind the pipe endpoint for `base` under this process id.
///
/// A stale socket file from a previous run with the same pid is removed
/// first.
pub fn listen_self(base: &str) -> std::io::Result<UnixListener> {
    let path = format(base, std::process::id());
    let _ = std::fs::remove_file(&path);
    UnixListener::bind(path)
}

/// The pipe driver, usable from profiles for local-only groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pipe;

#[async_trait]
impl Transport for Pipe {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let stream = UnixStream::connect(addr).await?;
        let (r, w) = stream.into_split();
        Ok(Connection::stream(r, w))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let _ = std::fs::remove_file(addr);
        let inner = UnixListener::bind(addr)?;
        Ok(Box::new(PipeServer {
            inner,
            addr: addr.to_string(),
        }))
    }
}

/// Accepting side of the pipe driver.
pub struct PipeServer {
    inner: UnixListener,
    addr: String,
}

#[async_trait]
impl Listener for PipeServer {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, _) = self.inner.accept().await?;
        let (r, w) = stream.into_split();
        Ok(Connection::stream(r, w))
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}
