use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing (and to inject synthetic packet loss).
///
/// Send errors are logged and swallowed: a datagram that could not be sent looks exactly
///  like a lost one, and the retransmission machinery repairs both the same way.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}
