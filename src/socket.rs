use crate::error::{CastError, Result};
use crate::framing::{self, RingBuffer};
use crate::protocol::CastFrame;
use crate::types::DisconnectReason;
use std::future::poll_fn;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Window for the OS connect plus optional TLS handshake
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for draining the write ring on disconnect
pub(crate) const DISCONNECT_FLUSH_WINDOW: Duration = Duration::from_secs(2);

const READ_RING_CAPACITY: usize = 64 * 1024;
const WRITE_RING_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

/// Identifier the multiplexer assigns to each socket
pub type SocketId = u64;

/// Where to open the device socket.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Transport-level notifications delivered to the owning connection.
#[derive(Debug)]
pub enum SocketEvent {
    /// The socket reached CONNECTED
    Connected(SocketId),
    /// One complete inbound frame
    Frame(SocketId, CastFrame),
    /// Teardown of a socket that never connected
    ConnectFailed(SocketId, DisconnectReason),
    /// Teardown of a connected socket
    Disconnected(SocketId, DisconnectReason),
}

pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxedStream = Box<dyn Stream>;
type ConnectFuture = Pin<Box<dyn std::future::Future<Output = ConnectOutcome> + Send>>;

enum ConnectOutcome {
    Open(BoxedStream),
    Failed(DisconnectReason, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    Connecting,
    Connected,
    Disconnecting,
}

enum Io {
    Connecting(ConnectFuture),
    Open(BoxedStream),
    /// Torn down; the entry is about to be dropped
    Closed,
}

/// What one multiplexer-loop iteration observed on this socket.
pub(crate) enum DriveOutcome {
    ConnectDone,
    ConnectError(DisconnectReason, String),
    /// Bytes appended to the read ring
    Read(usize),
    /// Bytes drained from the write ring
    Wrote(usize),
    Eof,
    IoError(std::io::Error),
}

/// One logical device connection inside the multiplexer.
///
/// Owns the stream and both ring buffers; only the multiplexer task
/// ever touches them. Destroyed on teardown, never reused.
pub(crate) struct Socket {
    id: SocketId,
    state: SocketState,
    io: Io,
    read_ring: RingBuffer,
    write_ring: RingBuffer,
    events: mpsc::UnboundedSender<SocketEvent>,
    connect_deadline: Instant,
    flush_deadline: Option<Instant>,
}

impl Socket {
    /// Construct the socket and begin the non-blocking connect.
    pub(crate) fn connect(
        id: SocketId,
        target: ConnectTarget,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        tracing::info!(
            "socket {}: connecting to {}:{} (tls={})",
            id,
            target.host,
            target.port,
            target.tls
        );
        Self {
            id,
            state: SocketState::Connecting,
            io: Io::Connecting(Box::pin(open_stream(target))),
            read_ring: RingBuffer::new(READ_RING_CAPACITY),
            write_ring: RingBuffer::new(WRITE_RING_CAPACITY),
            events,
            connect_deadline: Instant::now() + CONNECT_TIMEOUT,
            flush_deadline: None,
        }
    }

    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn state(&self) -> SocketState {
        self.state
    }

    /// Mid-connect and mid-disconnect sockets need the bounded poll
    /// tick so their deadlines fire.
    pub(crate) fn needs_poll_tick(&self) -> bool {
        matches!(
            self.state,
            SocketState::Connecting | SocketState::Disconnecting
        )
    }

    /// Interest recomputation: whether this socket belongs in the
    /// iteration's IO set at all.
    pub(crate) fn wants_io(&self) -> bool {
        match self.state {
            SocketState::Connecting => true,
            SocketState::Connected => self.read_ring.free() > 0 || !self.write_ring.is_empty(),
            SocketState::Disconnecting => !self.write_ring.is_empty(),
        }
    }

    /// Serialize `frame` into the write ring.
    ///
    /// Explicit backpressure: a full ring fails the send with
    /// `SendBufferFull` and buffers nothing; a frame that could never
    /// fit fails with `MessageTooLarge`.
    pub(crate) fn queue_frame(&mut self, frame: &CastFrame) -> Result<()> {
        if self.state != SocketState::Connected {
            return Err(CastError::NotConnected);
        }
        let encoded = framing::encode(frame)?;
        if encoded.len() > self.write_ring.capacity() {
            return Err(CastError::MessageTooLarge {
                size: encoded.len(),
            });
        }
        self.write_ring.push_slice(&encoded)?;
        tracing::debug!(
            "socket {}: queued {} bytes for {}",
            self.id,
            encoded.len(),
            frame.namespace
        );
        Ok(())
    }

    /// Extract every complete frame currently in the read ring.
    pub(crate) fn take_frames(&mut self) -> Result<Vec<CastFrame>> {
        let mut frames = Vec::new();
        while let Some(frame) = framing::extract(&mut self.read_ring)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Begin a graceful disconnect: flush the write ring within the
    /// window, then tear down. Returns true when the socket can be
    /// finalized right away.
    pub(crate) fn begin_disconnect(&mut self) -> bool {
        match self.state {
            SocketState::Connecting => true,
            SocketState::Connected => {
                self.state = SocketState::Disconnecting;
                self.flush_deadline = Some(Instant::now() + DISCONNECT_FLUSH_WINDOW);
                self.write_ring.is_empty()
            }
            SocketState::Disconnecting => self.write_ring.is_empty(),
        }
    }

    /// Check connect/flush deadlines. Returns the teardown reason when
    /// one expired.
    pub(crate) fn expired_deadline(&self, now: Instant) -> Option<DisconnectReason> {
        match self.state {
            SocketState::Connecting if now >= self.connect_deadline => {
                Some(DisconnectReason::ConnectTimeout)
            }
            SocketState::Disconnecting
                if self.flush_deadline.is_some_and(|d| now >= d) =>
            {
                Some(DisconnectReason::ExplicitClose)
            }
            _ => None,
        }
    }

    /// Drop the stream and emit the teardown event. A socket that was
    /// still CONNECTING reports a connect failure; one that reached
    /// CONNECTED reports a disconnect.
    pub(crate) fn teardown(&mut self, reason: DisconnectReason) {
        let was_connecting = self.state == SocketState::Connecting;
        self.io = Io::Closed;
        let event = if was_connecting {
            tracing::info!("socket {}: connect failed ({:?})", self.id, reason);
            SocketEvent::ConnectFailed(self.id, reason)
        } else {
            tracing::info!("socket {}: disconnected ({:?})", self.id, reason);
            SocketEvent::Disconnected(self.id, reason)
        };
        let _ = self.events.send(event);
    }

    /// Complete the connect after the stream opened.
    pub(crate) fn mark_connected(&mut self) {
        self.state = SocketState::Connected;
        tracing::info!("socket {}: connected", self.id);
        let _ = self.events.send(SocketEvent::Connected(self.id));
    }

    pub(crate) fn send_event_frame(&self, frame: CastFrame) {
        let _ = self.events.send(SocketEvent::Frame(self.id, frame));
    }

    pub(crate) fn write_ring_empty(&self) -> bool {
        self.write_ring.is_empty()
    }

    /// Perform at most one IO step.
    ///
    /// Ring mutations happen inside the final poll, so dropping this
    /// future when it loses the multiplexer's select loses nothing.
    pub(crate) async fn drive(&mut self) -> DriveOutcome {
        match &mut self.io {
            Io::Connecting(fut) => match fut.as_mut().await {
                ConnectOutcome::Open(stream) => {
                    self.io = Io::Open(stream);
                    DriveOutcome::ConnectDone
                }
                ConnectOutcome::Failed(reason, detail) => DriveOutcome::ConnectError(reason, detail),
            },
            Io::Open(stream) => {
                let read_ring = &mut self.read_ring;
                let write_ring = &mut self.write_ring;
                let want_read =
                    self.state == SocketState::Connected && read_ring.free() > 0;
                poll_fn(move |cx| {
                    if !write_ring.is_empty() {
                        let chunk_len = write_ring.peek().len();
                        match Pin::new(&mut **stream).poll_write(cx, write_ring.peek()) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(DriveOutcome::IoError(
                                    std::io::ErrorKind::WriteZero.into(),
                                ))
                            }
                            Poll::Ready(Ok(n)) => {
                                debug_assert!(n <= chunk_len);
                                write_ring.consume(n);
                                return Poll::Ready(DriveOutcome::Wrote(n));
                            }
                            Poll::Ready(Err(e)) => {
                                return Poll::Ready(DriveOutcome::IoError(e))
                            }
                            Poll::Pending => {}
                        }
                    }
                    if want_read {
                        let mut scratch = [0u8; READ_CHUNK];
                        let cap = scratch.len().min(read_ring.free());
                        let mut buf = ReadBuf::new(&mut scratch[..cap]);
                        match Pin::new(&mut **stream).poll_read(cx, &mut buf) {
                            Poll::Ready(Ok(())) => {
                                let filled = buf.filled();
                                if filled.is_empty() {
                                    return Poll::Ready(DriveOutcome::Eof);
                                }
                                // Fits: cap was bounded by ring free space
                                read_ring
                                    .push_slice(filled)
                                    .expect("read chunk exceeds ring free space");
                                return Poll::Ready(DriveOutcome::Read(filled.len()));
                            }
                            Poll::Ready(Err(e)) => {
                                return Poll::Ready(DriveOutcome::IoError(e))
                            }
                            Poll::Pending => {}
                        }
                    }
                    Poll::Pending
                })
                .await
            }
            Io::Closed => std::future::pending::<DriveOutcome>().await,
        }
    }
}

/// Open the TCP stream, then the TLS session when the target asks for
/// one. Receivers commonly present self-signed certificates, so chain
/// validation is relaxed; peers are authenticated at the protocol
/// layer.
async fn open_stream(target: ConnectTarget) -> ConnectOutcome {
    let tcp = match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(tcp) => tcp,
        Err(e) => return ConnectOutcome::Failed(DisconnectReason::IoError, e.to_string()),
    };
    if let Err(e) = tcp.set_nodelay(true) {
        return ConnectOutcome::Failed(DisconnectReason::IoError, e.to_string());
    }
    if !target.tls {
        return ConnectOutcome::Open(Box::new(tcp));
    }

    let connector = match native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
    {
        Ok(c) => tokio_native_tls::TlsConnector::from(c),
        Err(e) => return ConnectOutcome::Failed(DisconnectReason::TlsError, e.to_string()),
    };
    match connector.connect(&target.host, tcp).await {
        Ok(tls) => ConnectOutcome::Open(Box::new(tls)),
        Err(e) => ConnectOutcome::Failed(DisconnectReason::TlsError, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{heartbeat, NS_HEARTBEAT};
    use serde_json::json;

    fn test_socket() -> (Socket, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = ConnectTarget {
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: false,
        };
        (Socket::connect(1, target, tx), rx)
    }

    fn ping() -> CastFrame {
        CastFrame::text("sender-0", "receiver-0", NS_HEARTBEAT, &heartbeat::ping())
    }

    #[tokio::test]
    async fn queue_rejected_while_connecting() {
        let (mut socket, _rx) = test_socket();
        assert!(matches!(
            socket.queue_frame(&ping()),
            Err(CastError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_never_touches_the_ring() {
        let (mut socket, _rx) = test_socket();
        socket.state = SocketState::Connected;

        let huge = CastFrame::text(
            "sender-0",
            "receiver-0",
            NS_HEARTBEAT,
            &json!({ "blob": "x".repeat(WRITE_RING_CAPACITY) }),
        );
        assert!(matches!(
            socket.queue_frame(&huge),
            Err(CastError::MessageTooLarge { .. })
        ));
        assert!(socket.write_ring_empty());
    }

    #[tokio::test]
    async fn full_ring_signals_backpressure() {
        let (mut socket, _rx) = test_socket();
        socket.state = SocketState::Connected;

        // Fill until the ring pushes back; the failed send buffers
        // nothing and earlier frames stay intact
        let frame = ping();
        let mut queued = 0usize;
        let fill = loop {
            match socket.queue_frame(&frame) {
                Ok(()) => queued += 1,
                Err(CastError::SendBufferFull) => break socket.write_ring.len(),
                Err(other) => panic!("unexpected error: {other}"),
            }
        };
        assert!(queued > 0);
        assert_eq!(socket.write_ring.len(), fill);
    }
}
