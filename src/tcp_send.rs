//! The TCP control channel: listener, live-connection registry and framed
//! send/receive on the per-receiver retransmission connections.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::SendError;
use crate::frame::{VcmtpHeader, VCMTP_HEADER_LEN};

/// Identifies one live receiver connection. Stable for the lifetime of the
/// connection and never reused within a sender lifetime.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReceiverId(u32);

impl ReceiverId {
    pub fn from_raw(raw: u32) -> ReceiverId {
        ReceiverId(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte stream to one receiver, abstracted so tests can substitute an
/// in-memory duplex stream for a real TCP connection.
pub trait RetxStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RetxStream for T {}

type SharedStream = Arc<tokio::sync::Mutex<Box<dyn RetxStream>>>;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_RETRIES: u32 = 5;

/// Sender-side TCP layer. One instance serves all receivers; the registry
/// of live connections is shared between the acceptor, the per-receiver
/// workers and the multicast path (which snapshots it per product).
pub struct TcpSend {
    listener: TcpListener,
    conns: Mutex<FxHashMap<ReceiverId, SharedStream>>,
    next_id: AtomicU32,
}

impl TcpSend {
    /// Binds and listens on the retransmission port. Port 0 asks the
    /// operating system for one; [local_port] reports the outcome.
    pub async fn init(addr: Ipv4Addr, port: u16) -> Result<TcpSend, SendError> {
        let listener = TcpListener::bind(SocketAddrV4::new(addr, port)).await?;
        Ok(TcpSend {
            listener,
            conns: Mutex::new(FxHashMap::default()),
            next_id: AtomicU32::new(0),
        })
    }

    /// The bound port in host byte order.
    pub fn local_port(&self) -> Result<u16, SendError> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accepts one incoming connection, enables keep-alive on it and
    /// registers it. Everything after the accept itself is synchronous, so a
    /// task cancellation cannot separate an accepted socket from its
    /// registry entry.
    pub async fn accept(&self) -> Result<ReceiverId, SendError> {
        let (stream, peer) = self.listener.accept().await?;
        Self::set_keepalive(&stream)?;
        let id = self.register(Box::new(stream));
        debug!(receiver = %id, %peer, "accepted retransmission connection");
        Ok(id)
    }

    /// A dead receiver must eventually fail the worker's read instead of
    /// parking it forever.
    fn set_keepalive(stream: &TcpStream) -> Result<(), SendError> {
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        Ok(())
    }

    pub(crate) fn register(&self, stream: Box<dyn RetxStream>) -> ReceiverId {
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.conns
            .lock()
            .insert(id, Arc::new(tokio::sync::Mutex::new(stream)));
        id
    }

    /// Reads exactly one frame header from the receiver's stream.
    pub async fn parse_header(&self, id: ReceiverId) -> Result<VcmtpHeader, SendError> {
        let stream = self.stream(id)?;
        let mut buf = [0u8; VCMTP_HEADER_LEN];
        stream.lock().await.read_exact(&mut buf).await?;
        VcmtpHeader::deser(&mut &buf[..])
    }

    /// Writes a header and optional body contiguously, retrying until
    /// everything is written or the stream fails.
    pub async fn send(
        &self,
        id: ReceiverId,
        header: &VcmtpHeader,
        body: Option<&[u8]>,
    ) -> Result<(), SendError> {
        let stream = self.stream(id)?;

        let mut buf = BytesMut::with_capacity(VCMTP_HEADER_LEN + body.map_or(0, |b| b.len()));
        header.ser(&mut buf);
        if let Some(body) = body {
            buf.put_slice(body);
        }

        let mut stream = stream.lock().await;
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Closes and de-registers the connection. Idempotent; the socket itself
    /// closes once the last holder of its stream lets go.
    pub fn remove(&self, id: ReceiverId) {
        self.conns.lock().remove(&id);
    }

    /// Snapshot of all live connection ids.
    pub fn connected_ids(&self) -> Vec<ReceiverId> {
        self.conns.lock().keys().copied().collect()
    }

    fn stream(&self, id: ReceiverId) -> Result<SharedStream, SendError> {
        self.conns
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| SendError::System(format!("no connection registered for receiver {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use tokio::io::duplex;

    async fn test_tcpsend() -> TcpSend {
        TcpSend::init(Ipv4Addr::LOCALHOST, 0).await.unwrap()
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let tcpsend = test_tcpsend().await;
        assert!(tcpsend.connected_ids().is_empty());

        let (_near, far) = duplex(1024);
        let id_a = tcpsend.register(Box::new(far));
        let (_near, far) = duplex(1024);
        let id_b = tcpsend.register(Box::new(far));

        assert_ne!(id_a, id_b);
        let mut ids = tcpsend.connected_ids();
        ids.sort();
        assert_eq!(ids, vec![id_a, id_b]);

        tcpsend.remove(id_a);
        assert_eq!(tcpsend.connected_ids(), vec![id_b]);
        tcpsend.remove(id_a);
        assert_eq!(tcpsend.connected_ids(), vec![id_b]);
    }

    #[tokio::test]
    async fn test_parse_header_reads_exactly_one_header() {
        let tcpsend = test_tcpsend().await;
        let (mut near, far) = duplex(1024);
        let id = tcpsend.register(Box::new(far));

        let mut buf = BytesMut::new();
        VcmtpHeader {
            prodindex: 3,
            seqnum: 1448,
            payloadlen: 1448,
            flags: FrameKind::RetxReq,
        }
        .ser(&mut buf);
        VcmtpHeader::control(4, FrameKind::RetxEnd).ser(&mut buf);
        near.write_all(&buf).await.unwrap();

        let first = tcpsend.parse_header(id).await.unwrap();
        assert_eq!(first.prodindex, 3);
        assert_eq!(first.seqnum, 1448);
        assert_eq!(first.flags, FrameKind::RetxReq);

        let second = tcpsend.parse_header(id).await.unwrap();
        assert_eq!(second.prodindex, 4);
        assert_eq!(second.flags, FrameKind::RetxEnd);
    }

    #[tokio::test]
    async fn test_parse_header_fails_on_closed_stream() {
        let tcpsend = test_tcpsend().await;
        let (near, far) = duplex(1024);
        let id = tcpsend.register(Box::new(far));
        drop(near);

        assert!(matches!(
            tcpsend.parse_header(id).await,
            Err(SendError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_send_writes_header_and_body_contiguously() {
        let tcpsend = test_tcpsend().await;
        let (mut near, far) = duplex(1024);
        let id = tcpsend.register(Box::new(far));

        let header = VcmtpHeader {
            prodindex: 1,
            seqnum: 0,
            payloadlen: 3,
            flags: FrameKind::RetxData,
        };
        tcpsend.send(id, &header, Some(b"abc")).await.unwrap();

        let mut received = [0u8; VCMTP_HEADER_LEN + 3];
        near.read_exact(&mut received).await.unwrap();
        assert_eq!(
            received,
            [0, 0, 0, 1, 0, 0, 0, 0, 0, 3, 0, 0x40, b'a', b'b', b'c']
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver_fails() {
        let tcpsend = test_tcpsend().await;
        let header = VcmtpHeader::control(0, FrameKind::RetxRej);

        assert!(matches!(
            tcpsend.send(ReceiverId::from_raw(17), &header, None).await,
            Err(SendError::System(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_registers_connection() {
        let tcpsend = test_tcpsend().await;
        let port = tcpsend.local_port().unwrap();

        let client = tokio::spawn(async move {
            TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap()
        });
        let id = tcpsend.accept().await.unwrap();
        let _client = client.await.unwrap();

        assert_eq!(tcpsend.connected_ids(), vec![id]);
    }
}
