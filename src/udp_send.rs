//! Multicast UDP emission.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
#[cfg(test)]
use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::SendError;

/// Abstraction for the outgoing datagram socket, introduced to facilitate
/// mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_dgram(&self, to: SocketAddr, buf: &[u8]) -> std::io::Result<usize>;

    fn set_multicast_if_v4(&self, interface: Ipv4Addr) -> std::io::Result<()>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_dgram(&self, to: SocketAddr, buf: &[u8]) -> std::io::Result<usize> {
        self.send_to(buf, to).await
    }

    fn set_multicast_if_v4(&self, interface: Ipv4Addr) -> std::io::Result<()> {
        socket2::SockRef::from(self).set_multicast_if_v4(&interface)
    }
}

/// The multicast half of the sender: one UDP socket aimed at the group.
///
/// Every call emits exactly one datagram; a kernel rejection propagates as
/// an I/O error to the caller, and there is no retry at this layer.
pub struct UdpSend {
    socket: Arc<dyn DatagramSocket>,
    group: SocketAddr,
}

impl UdpSend {
    /// Binds the send socket and applies TTL and, if configured, the
    /// outgoing multicast interface.
    pub fn init(
        group: SocketAddrV4,
        ttl: u32,
        default_if: Option<Ipv4Addr>,
    ) -> Result<UdpSend, SendError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        socket.set_multicast_ttl_v4(ttl)?;
        if let Some(interface) = default_if {
            socket.set_multicast_if_v4(&interface)?;
        }
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(UdpSend {
            socket: Arc::new(socket),
            group: SocketAddr::V4(group),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_socket(socket: Arc<dyn DatagramSocket>, group: SocketAddr) -> UdpSend {
        UdpSend { socket, group }
    }

    /// Sends `buf` as one datagram to the group.
    pub async fn send_to(&self, buf: &[u8]) -> Result<(), SendError> {
        let sent = self.socket.send_dgram(self.group, buf).await?;
        if sent != buf.len() {
            return Err(SendError::System(format!(
                "datagram truncated: {sent} of {} bytes sent",
                buf.len()
            )));
        }
        trace!(to = %self.group, len = buf.len(), "sent datagram");
        Ok(())
    }

    /// Gather send: emits the concatenation of `parts` as exactly one
    /// datagram.
    pub async fn send_gather(&self, parts: &[&[u8]]) -> Result<(), SendError> {
        let mut buf = BytesMut::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            buf.put_slice(part);
        }
        self.send_to(&buf).await
    }

    /// Selects the interface used for outgoing multicast traffic.
    pub fn set_default_if(&self, interface: Ipv4Addr) -> Result<(), SendError> {
        self.socket.set_multicast_if_v4(interface)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn group() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9999))
    }

    #[tokio::test]
    async fn test_send_gather_emits_one_datagram() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_send_dgram()
            .once()
            .withf(|to, buf| to == &group() && buf == b"headerbodymeta".as_slice())
            .returning(|_, buf| Ok(buf.len()));

        let udpsend = UdpSend::with_socket(Arc::new(socket), group());
        udpsend
            .send_gather(&[b"header", b"body", b"meta"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_propagates() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send_dgram().returning(|_, _| {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "no route",
            ))
        });

        let udpsend = UdpSend::with_socket(Arc::new(socket), group());
        assert!(matches!(
            udpsend.send_to(b"x").await,
            Err(SendError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_short_send_is_an_error() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_send_dgram().returning(|_, _| Ok(1));

        let udpsend = UdpSend::with_socket(Arc::new(socket), group());
        assert!(matches!(
            udpsend.send_to(b"abcdef").await,
            Err(SendError::System(_))
        ));
    }

    #[tokio::test]
    async fn test_set_default_if_forwards_to_socket() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_set_multicast_if_v4()
            .once()
            .with(eq(Ipv4Addr::new(10, 0, 0, 3)))
            .returning(|_| Ok(()));

        let udpsend = UdpSend::with_socket(Arc::new(socket), group());
        udpsend.set_default_if(Ipv4Addr::new(10, 0, 0, 3)).unwrap();
    }

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let group = match receiver.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let udpsend = UdpSend::init(group, 1, None).unwrap();
        udpsend.send_gather(&[b"abc", b"def"]).await.unwrap();

        let mut buf = [0u8; 32];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcdef");
    }
}
