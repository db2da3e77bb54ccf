//! XOR-keyed shim over an async byte stream.
//!
//! Used by the handoff protocol to mask the identity transfer flowing
//! over the local pipe. The key is derived from the pipe base name, so
//! both ends can build it without any prior exchange.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::xor::Xor;

/// A duplex stream whose reads and writes are masked with an [`Xor`] key.
///
/// Each direction keys off its own running byte offset, so the two ends
/// stay aligned no matter how either side chunks its reads and writes.
pub struct XorStream<S> {
    inner: S,
    key: Xor,
    rpos: usize,
    wpos: usize,
}

impl<S> XorStream<S> {
    /// Wrap `inner` with the given key.
    pub fn new(inner: S, key: Xor) -> Self {
        Self {
            inner,
            key,
            rpos: 0,
            wpos: 0,
        }
    }

    /// Unwrap, returning the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> XorStream<S> {
    /// Read exactly `buf.len()` bytes and unmask them.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf).await?;
        self.key.mask_at(buf, self.rpos);
        self.rpos += buf.len();
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> XorStream<S> {
    /// Mask and write all of `buf`.
    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        let mut masked = buf.to_vec();
        self.key.mask_at(&mut masked, self.wpos);
        self.wpos += masked.len();
        self.inner.write_all(&masked).await?;
        self.inner.flush().await
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_masked_duplex_roundtrip() {
        let (a, b) = tokio::io::duplex(256);
        let key = Xor::new(b"pipename".to_vec());

        let mut tx = XorStream::new(a, key.clone());
        let mut rx = XorStream::new(b, key);

        tx.write_all(b"identity block").await.unwrap();
        let mut got = [0u8; 14];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"identity block");
    }

    #[tokio::test]
    async fn test_chunking_stays_aligned() {
        let (a, b) = tokio::io::duplex(256);
        let key = Xor::new(b"key".to_vec());

        let mut tx = XorStream::new(a, key.clone());
        let mut rx = XorStream::new(b, key);

        // Writer sends three records; reader drains them in one gulp.
        tx.write_all(b"one").await.unwrap();
        tx.write_all(b"two").await.unwrap();
        tx.write_all(b"three").await.unwrap();
        let mut got = [0u8; 11];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"onetwothree");
    }

    #[tokio::test]
    async fn test_wire_bytes_are_masked() {
        let (a, b) = tokio::io::duplex(256);
        let mut tx = XorStream::new(a, Xor::new(b"key".to_vec()));

        tx.write_all(b"secret").await.unwrap();
        // Read the raw side without the key: bytes must differ.
        let mut raw = b;
        let mut got = [0u8; 6];
        raw.read_exact(&mut got).await.unwrap();
        assert_ne!(&got, b"secret");
    }
}
