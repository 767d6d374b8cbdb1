use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// An abstraction for sending and receiving datagrams, introduced to facilitate replacing the
///  I/O part for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()>;

    /// Returns the next datagram if one arrives within `timeout`. A zero timeout only drains
    ///  what is already there.
    async fn recv_datagram(&self, buf: &mut [u8], timeout: Duration) -> Option<(usize, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        self.send_to(datagram, to).await?;
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8], timeout: Duration) -> Option<(usize, SocketAddr)> {
        let result = if timeout.is_zero() {
            self.try_recv_from(buf).ok()
        }
        else {
            tokio::time::timeout(timeout, self.recv_from(buf)).await
                .ok()
                .and_then(|r| r.ok())
        };

        if let Some((len, from)) = &result {
            trace!("UDP socket: received {} bytes from {:?}", len, from);
        }
        result
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.as_ref().local_addr()
    }
}
