//! UDP datagram transport.
//!
//! One datagram carries exactly one packet body, so the facade needs no
//! extra framing. The driver is connect-only: accepting many clients on
//! one socket requires a demultiplexer that belongs to the host, not to
//! this runtime.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::conn::{Connection, Datagram};
use crate::error::TransportError;
use crate::transport::{Listener, Transport};
use crate::Result;

/// The UDP driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct Udp;

struct UdpConduit(UdpSocket);

#[async_trait]
impl Datagram for UdpConduit {
    async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.recv(buf).await
    }
}

#[async_trait]
impl Transport for Udp {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let bind = if addr.contains('[') || addr.matches(':').count() > 1 {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        Ok(Connection::datagram(Arc::new(UdpConduit(socket))))
    }

    async fn listen(&self, _addr: &str) -> Result<Box<dyn Listener>> {
        Err(TransportError::NotSupported(
            "udp accept requires a host-side demultiplexer",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], from).await.unwrap();
        });

        let mut conn = Udp.connect(&addr.to_string()).await.unwrap();
        conn.write_frame(b"ping").await.unwrap();
        assert_eq!(conn.read_frame().await.unwrap(), b"ping");
        echo.await.unwrap();
    }
}
