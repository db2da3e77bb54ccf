//! The framed connection facade.
//!
//! A [`Connection`] frames whole packet bodies over either a reliable
//! byte stream (4-byte big-endian length prefix) or a datagram conduit
//! (one message = one body). It splits into independently owned send and
//! receive halves for channel mode; the halves share an abort flag that
//! stands in for the past-dated deadline trick stream sockets use to
//! interrupt a blocked peer task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::{MAX_FRAME, Result};

/// Bounded-message conduit (UDP and friends).
#[async_trait]
pub trait Datagram: Send + Sync {
    /// Send one message.
    async fn send(&self, buf: &[u8]) -> std::io::Result<usize>;

    /// Receive one message into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Shared abort state between the two halves of a connection.
struct Abort {
    flag: AtomicBool,
    notify: Notify,
}

impl Abort {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn fire(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn fired(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run `fut` under the abort flag and an optional deadline.
async fn guarded<T, F>(abort: &Abort, deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let notified = abort.notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if abort.fired() {
        return Err(TransportError::Aborted);
    }
    tokio::pin!(fut);
    match deadline {
        Some(d) => tokio::select! {
            r = &mut fut => r,
            _ = &mut notified => Err(TransportError::Aborted),
            _ = tokio::time::sleep_until(d) => Err(TransportError::DeadlineExceeded),
        },
        None => tokio::select! {
            r = &mut fut => r,
            _ = &mut notified => Err(TransportError::Aborted),
        },
    }
}

enum SendIo {
    Stream(Box<dyn AsyncWrite + Send + Unpin>),
    Datagram(Arc<dyn Datagram>),
}

enum RecvIo {
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Datagram(Arc<dyn Datagram>),
}

/// The writing half of a connection.
pub struct SendHalf {
    io: SendIo,
    deadline: Option<Instant>,
    abort: Arc<Abort>,
}

impl SendHalf {
    /// Set (or clear) the advisory write deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Interrupt any I/O blocked on either half.
    pub fn abort(&self) {
        self.abort.fire();
    }

    /// Frame and send one packet body.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME {
            return Err(TransportError::FrameTooLarge(body.len()));
        }
        let deadline = self.deadline;
        match &mut self.io {
            SendIo::Stream(w) => {
                guarded(&self.abort, deadline, async {
                    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
                    w.write_all(body).await?;
                    w.flush().await?;
                    Ok(())
                })
                .await
            }
            SendIo::Datagram(d) => {
                guarded(&self.abort, deadline, async {
                    d.send(body).await?;
                    Ok(())
                })
                .await
            }
        }
    }

    /// Shut down the write side, when the transport supports it.
    pub async fn close(&mut self) {
        if let SendIo::Stream(w) = &mut self.io {
            let _ = w.shutdown().await;
        }
    }
}

/// The reading half of a connection.
pub struct RecvHalf {
    io: RecvIo,
    deadline: Option<Instant>,
    abort: Arc<Abort>,
}

impl RecvHalf {
    /// Set (or clear) the advisory read deadline.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Interrupt any I/O blocked on either half.
    pub fn abort(&self) {
        self.abort.fire();
    }

    /// Receive one framed packet body.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let deadline = self.deadline;
        match &mut self.io {
            RecvIo::Stream(r) => {
                guarded(&self.abort, deadline, async {
                    let mut len = [0u8; 4];
                    r.read_exact(&mut len).await.map_err(eof_as_closed)?;
                    let n = u32::from_be_bytes(len) as usize;
                    if n > MAX_FRAME {
                        return Err(TransportError::FrameTooLarge(n));
                    }
                    let mut body = vec![0u8; n];
                    r.read_exact(&mut body).await.map_err(eof_as_closed)?;
                    Ok(body)
                })
                .await
            }
            RecvIo::Datagram(d) => {
                guarded(&self.abort, deadline, async {
                    let mut buf = vec![0u8; 65536];
                    let n = d.recv(&mut buf).await?;
                    buf.truncate(n);
                    Ok(buf)
                })
                .await
            }
        }
    }
}

fn eof_as_closed(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

/// A duplex, packet-framed conduit to one peer.
pub struct Connection {
    tx: SendHalf,
    rx: RecvHalf,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Build a connection over a reliable byte stream.
    pub fn stream<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let abort = Abort::new();
        Self {
            tx: SendHalf {
                io: SendIo::Stream(Box::new(writer)),
                deadline: None,
                abort: Arc::clone(&abort),
            },
            rx: RecvHalf {
                io: RecvIo::Stream(Box::new(reader)),
                deadline: None,
                abort,
            },
        }
    }

    /// Build a connection over a bounded-message conduit.
    pub fn datagram(conduit: Arc<dyn Datagram>) -> Self {
        let abort = Abort::new();
        Self {
            tx: SendHalf {
                io: SendIo::Datagram(Arc::clone(&conduit)),
                deadline: None,
                abort: Arc::clone(&abort),
            },
            rx: RecvHalf {
                io: RecvIo::Datagram(conduit),
                deadline: None,
                abort,
            },
        }
    }

    /// Receive one framed packet body.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.rx.read_frame().await
    }

    /// Frame and send one packet body.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        self.tx.write_frame(body).await
    }

    /// Set (or clear) the advisory read deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.rx.set_deadline(deadline);
    }

    /// Set (or clear) the advisory write deadline.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.tx.set_deadline(deadline);
    }

    /// Interrupt any I/O blocked on this connection.
    pub fn abort(&self) {
        self.tx.abort();
    }

    /// Split into independently owned halves for channel mode.
    #[must_use]
    pub fn split(self) -> (SendHalf, RecvHalf) {
        (self.tx, self.rx)
    }

    /// Close the connection.
    pub async fn close(mut self) {
        self.tx.close().await;
    }
}
