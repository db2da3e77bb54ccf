//! TCP stream transport.

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::Result;
use crate::conn::Connection;
use crate::transport::{Listener, Transport};

/// The TCP driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tcp;

#[async_trait]
impl Transport for Tcp {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        // Exchanges are single small frames; coalescing only adds latency.
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Ok(Connection::stream(r, w))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpServer { inner }))
    }
}

/// Accepting side of the TCP driver.
pub struct TcpServer {
    inner: TcpListener,
}

#[async_trait]
impl Listener for TcpServer {
    async fn accept(&mut self) -> Result<Connection> {
        let (stream, _) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Ok(Connection::stream(r, w))
    }

    fn local_addr(&self) -> String {
        self.inner
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let mut listener = Tcp.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let got = conn.read_frame().await.unwrap();
            conn.write_frame(&got).await.unwrap();
        });

        let mut conn = Tcp.connect(&addr).await.unwrap();
        conn.write_frame(b"echo me").await.unwrap();
        assert_eq!(conn.read_frame().await.unwrap(), b"echo me");
        server.await.unwrap();
    }
}
