use std::future::Future;
use std::io;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::trace;

use crate::buffer::ByteBuffer;
use crate::transport::tls::{TlsChannel, TlsContext, TlsError};

/// Socket readiness a blocked operation must wait for before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Result of one nonblocking I/O attempt.
#[derive(Debug)]
pub enum IoOutcome {
    /// Bytes moved across the caller's buffer boundary. Zero only when
    /// the transport had queued internal work and finished it.
    Progress(usize),
    /// The peer closed its end of the connection.
    PeerClosed,
    /// No progress possible until the socket is ready in the given
    /// direction. For TLS this may differ from the attempted direction.
    WouldBlock(Direction),
    /// The call was interrupted by a signal; retry immediately.
    Interrupted,
    /// Unrecoverable I/O or TLS failure.
    Fatal(io::Error),
}

/// Progress of an in-flight TLS handshake.
#[derive(Debug)]
pub enum HandshakeStatus {
    Done,
    WouldBlock(Direction),
    Failed(io::Error),
}

/// A nonblocking byte source/sink over one client socket.
///
/// Implemented by [`Channel`] in production; tests drive the connection
/// state machine through a scripted implementation.
pub trait Wire: Send {
    /// Reads into the free tail of `buf`. Never blocks.
    fn read_into(&mut self, buf: &mut ByteBuffer) -> IoOutcome;

    /// Writes from the unflushed content of `buf`, consuming what was
    /// accepted. Never blocks.
    fn write_from(&mut self, buf: &mut ByteBuffer) -> IoOutcome;

    /// True while the transport holds outbound bytes of its own that have
    /// not reached the socket (TLS record buffering). A flush is not
    /// complete until this clears.
    fn has_pending_write(&self) -> bool;

    /// Suspends until the socket is ready in the given direction.
    fn wait(&mut self, dir: Direction) -> impl Future<Output = io::Result<()>> + Send;

    /// Swaps the cleartext transport for a TLS session derived from the
    /// process-wide context. Valid exactly once, before any TLS bytes.
    fn begin_tls(&mut self, ctx: &TlsContext) -> Result<(), TlsError>;

    /// Advances the TLS handshake as far as the socket allows.
    fn handshake_step(&mut self) -> HandshakeStatus;

    fn is_encrypted(&self) -> bool;

    /// Graceful, idempotent close. For TLS this sends close_notify on a
    /// best-effort basis; the socket itself is released on drop.
    fn close(&mut self);
}

/// Maps an `io::Error` from a plain socket attempt into an [`IoOutcome`],
/// with would-block pointing at the direction that was attempted.
fn outcome_from_error(err: io::Error, attempted: Direction) -> IoOutcome {
    match err.kind() {
        io::ErrorKind::WouldBlock => IoOutcome::WouldBlock(attempted),
        io::ErrorKind::Interrupted => IoOutcome::Interrupted,
        _ => IoOutcome::Fatal(err),
    }
}

/// Cleartext TCP channel.
#[derive(Debug)]
pub struct PlainChannel {
    socket: TcpStream,
}

impl PlainChannel {
    pub fn new(socket: TcpStream) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub fn into_socket(self) -> TcpStream {
        self.socket
    }

    fn read_into(&mut self, buf: &mut ByteBuffer) -> IoOutcome {
        match self.socket.try_read(buf.unfilled()) {
            Ok(0) => IoOutcome::PeerClosed,
            Ok(n) => {
                buf.add_filled(n);
                trace!(bytes = n, "socket read");
                IoOutcome::Progress(n)
            }
            Err(e) => outcome_from_error(e, Direction::Read),
        }
    }

    fn write_from(&mut self, buf: &mut ByteBuffer) -> IoOutcome {
        match self.socket.try_write(buf.filled()) {
            Ok(0) => IoOutcome::WouldBlock(Direction::Write),
            Ok(n) => {
                buf.consume(n);
                trace!(bytes = n, "socket write");
                IoOutcome::Progress(n)
            }
            Err(e) => outcome_from_error(e, Direction::Write),
        }
    }
}

/// The production transport: plain until upgraded, TLS afterwards.
///
/// `Detached` is a transitional placeholder that exists only while the
/// upgrade takes ownership of the socket; no I/O ever observes it.
pub enum Channel {
    Plain(PlainChannel),
    Tls(TlsChannel),
    Detached,
}

impl Channel {
    pub fn plain(socket: TcpStream) -> Self {
        Channel::Plain(PlainChannel::new(socket))
    }

    fn socket(&self) -> &TcpStream {
        match self {
            Channel::Plain(plain) => plain.socket(),
            Channel::Tls(tls) => tls.socket(),
            Channel::Detached => unreachable!("channel detached mid-upgrade"),
        }
    }
}

impl Wire for Channel {
    fn read_into(&mut self, buf: &mut ByteBuffer) -> IoOutcome {
        match self {
            Channel::Plain(plain) => plain.read_into(buf),
            Channel::Tls(tls) => tls.read_into(buf),
            Channel::Detached => unreachable!("channel detached mid-upgrade"),
        }
    }

    fn write_from(&mut self, buf: &mut ByteBuffer) -> IoOutcome {
        match self {
            Channel::Plain(plain) => plain.write_from(buf),
            Channel::Tls(tls) => tls.write_from(buf),
            Channel::Detached => unreachable!("channel detached mid-upgrade"),
        }
    }

    fn has_pending_write(&self) -> bool {
        match self {
            Channel::Plain(_) => false,
            Channel::Tls(tls) => tls.has_pending_write(),
            Channel::Detached => false,
        }
    }

    fn wait(&mut self, dir: Direction) -> impl Future<Output = io::Result<()>> + Send {
        let interest = match dir {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        let socket = self.socket();
        async move { socket.ready(interest).await.map(|_| ()) }
    }

    fn begin_tls(&mut self, ctx: &TlsContext) -> Result<(), TlsError> {
        match std::mem::replace(self, Channel::Detached) {
            Channel::Plain(plain) => {
                let session = ctx.new_session()?;
                *self = Channel::Tls(TlsChannel::new(plain.into_socket(), session));
                Ok(())
            }
            other => {
                // Restore whatever was there; upgrading twice is a
                // protocol violation on the caller's side.
                *self = other;
                Err(TlsError::AlreadyEncrypted)
            }
        }
    }

    fn handshake_step(&mut self) -> HandshakeStatus {
        match self {
            Channel::Tls(tls) => tls.handshake_step(),
            _ => HandshakeStatus::Failed(io::Error::other("handshake on a cleartext channel")),
        }
    }

    fn is_encrypted(&self) -> bool {
        matches!(self, Channel::Tls(_))
    }

    fn close(&mut self) {
        if let Channel::Tls(tls) = self {
            tls.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_plain_read_would_block_when_empty() {
        let (_client, server) = socket_pair().await;
        let mut channel = Channel::plain(server);
        let mut buf = ByteBuffer::with_capacity(64);

        match channel.read_into(&mut buf) {
            IoOutcome::WouldBlock(Direction::Read) => {}
            other => panic!("expected read would-block, got {:?}", other),
        }
        assert_eq!(buf.read_available(), 0);
    }

    #[tokio::test]
    async fn test_plain_read_progress_and_peer_close() {
        let (mut client, server) = socket_pair().await;
        let mut channel = Channel::plain(server);
        let mut buf = ByteBuffer::with_capacity(64);

        client.write_all(b"hello").await.unwrap();
        channel.wait(Direction::Read).await.unwrap();
        match channel.read_into(&mut buf) {
            IoOutcome::Progress(5) => {}
            other => panic!("expected 5 bytes, got {:?}", other),
        }
        assert_eq!(buf.filled(), b"hello");

        drop(client);
        // Peer close surfaces as a zero-byte read once the FIN arrives.
        loop {
            channel.wait(Direction::Read).await.unwrap();
            match channel.read_into(&mut buf) {
                IoOutcome::PeerClosed => break,
                IoOutcome::WouldBlock(_) => continue,
                other => panic!("expected peer close, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_plain_write_consumes_buffer() {
        let (client, server) = socket_pair().await;
        let mut channel = Channel::plain(server);
        let mut buf = ByteBuffer::with_capacity(64);
        buf.append(b"response");

        channel.wait(Direction::Write).await.unwrap();
        match channel.write_from(&mut buf) {
            IoOutcome::Progress(8) => {}
            other => panic!("expected 8 bytes, got {:?}", other),
        }
        assert_eq!(buf.read_available(), 0);
        drop(client);
    }
}
