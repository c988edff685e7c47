//! TLS channel and the process-wide TLS context.
//!
//! The context wraps the server configuration (certificate chain and key)
//! built once at startup; every upgraded connection derives its own
//! session from it. The channel pumps TLS records between the socket and
//! the sans-IO session, which is what makes the cross-coupled readiness
//! directions expressible: the session reports whether it needs socket
//! bytes in or out independently of whether the caller asked to read or
//! write.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::{ServerConfig, ServerConnection};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::buffer::ByteBuffer;
use crate::transport::channel::{Direction, HandshakeStatus, IoOutcome};

/// TLS configuration or session failure.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("no private key found in key file")]
    MissingPrivateKey,
    #[error("connection is already encrypted")]
    AlreadyEncrypted,
}

/// Process-wide TLS configuration, built once at startup.
///
/// Dropping the context at shutdown releases the key material; sessions
/// already derived from it keep their own reference.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Builds the context from PEM certificate-chain and private-key files.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let mut cert_reader = BufReader::new(File::open(cert_path)?);
        let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

        let mut key_reader = BufReader::new(File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::MissingPrivateKey)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self::new(Arc::new(config)))
    }

    /// Derives a fresh server session for one connection.
    pub(crate) fn new_session(&self) -> Result<ServerConnection, TlsError> {
        Ok(ServerConnection::new(self.config.clone())?)
    }
}

/// Nonblocking `io::Read` over the socket, for feeding TLS records in.
struct SocketReader<'a>(&'a TcpStream);

impl Read for SocketReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

/// Nonblocking `io::Write` over the socket, for pushing TLS records out.
struct SocketWriter<'a>(&'a TcpStream);

impl Write for SocketWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Result of draining the session's queued outbound records.
enum PumpOutcome {
    Drained,
    Blocked,
    Failed(io::Error),
}

/// An upgraded connection: the socket plus its TLS session.
pub struct TlsChannel {
    socket: TcpStream,
    session: ServerConnection,
    closed: bool,
}

impl TlsChannel {
    pub(crate) fn new(socket: TcpStream, session: ServerConnection) -> Self {
        Self {
            socket,
            session,
            closed: false,
        }
    }

    pub(crate) fn socket(&self) -> &TcpStream {
        &self.socket
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        self.session.wants_write()
    }

    pub(crate) fn read_into(&mut self, buf: &mut ByteBuffer) -> IoOutcome {
        // Plaintext already decrypted inside the session is invisible to
        // socket readiness; drain it before touching the socket.
        if let Some(outcome) = self.read_plaintext(buf) {
            return outcome;
        }

        // An unsent flight (handshake reply, key update) must reach the
        // socket before the peer will send the records we are waiting
        // for. Blocking here leaves this *read* waiting on writability.
        if self.session.wants_write() {
            match self.pump_writes() {
                PumpOutcome::Drained => {}
                PumpOutcome::Blocked => return IoOutcome::WouldBlock(Direction::Write),
                PumpOutcome::Failed(e) => return IoOutcome::Fatal(e),
            }
        }

        match self.session.read_tls(&mut SocketReader(&self.socket)) {
            Ok(0) => IoOutcome::PeerClosed,
            Ok(n) => {
                trace!(bytes = n, "tls records read");
                if let Err(e) = self.session.process_new_packets() {
                    // Best effort: let the alert out before giving up.
                    let _ = self.session.write_tls(&mut SocketWriter(&self.socket));
                    return IoOutcome::Fatal(io::Error::other(e));
                }
                match self.read_plaintext(buf) {
                    Some(outcome) => outcome,
                    // The records carried no application data yet.
                    None => IoOutcome::WouldBlock(Direction::Read),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                IoOutcome::WouldBlock(Direction::Read)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => IoOutcome::Interrupted,
            Err(e) => IoOutcome::Fatal(e),
        }
    }

    pub(crate) fn write_from(&mut self, buf: &mut ByteBuffer) -> IoOutcome {
        // Records queued by a previous attempt drain first.
        match self.pump_writes() {
            PumpOutcome::Drained => {}
            PumpOutcome::Blocked => return IoOutcome::WouldBlock(Direction::Write),
            PumpOutcome::Failed(e) => return IoOutcome::Fatal(e),
        }
        if buf.read_available() == 0 {
            return IoOutcome::Progress(0);
        }

        let n = match self.session.writer().write(buf.filled()) {
            Ok(n) => n,
            Err(e) => return IoOutcome::Fatal(e),
        };
        buf.consume(n);
        trace!(bytes = n, "tls plaintext buffered");

        match self.pump_writes() {
            PumpOutcome::Drained => IoOutcome::Progress(n),
            // The plaintext is inside the session either way; report the
            // bytes accepted so the caller's cursor stays honest and let
            // the next attempt finish the socket flush.
            PumpOutcome::Blocked if n > 0 => IoOutcome::Progress(n),
            PumpOutcome::Blocked => IoOutcome::WouldBlock(Direction::Write),
            PumpOutcome::Failed(e) => IoOutcome::Fatal(e),
        }
    }

    /// Drives the handshake until it completes or the socket pushes back.
    pub(crate) fn handshake_step(&mut self) -> HandshakeStatus {
        while self.session.is_handshaking() {
            if self.session.wants_write() {
                match self.session.write_tls(&mut SocketWriter(&self.socket)) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStatus::WouldBlock(Direction::Write);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return HandshakeStatus::Failed(e),
                }
            }
            match self.session.read_tls(&mut SocketReader(&self.socket)) {
                Ok(0) => {
                    return HandshakeStatus::Failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during TLS handshake",
                    ));
                }
                Ok(n) => {
                    trace!(bytes = n, "tls handshake records read");
                    if let Err(e) = self.session.process_new_packets() {
                        let _ = self.session.write_tls(&mut SocketWriter(&self.socket));
                        return HandshakeStatus::Failed(io::Error::other(e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return HandshakeStatus::WouldBlock(Direction::Read);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return HandshakeStatus::Failed(e),
            }
        }

        // Push out the tail of the final flight before application bytes.
        match self.pump_writes() {
            PumpOutcome::Drained => {
                debug!("tls handshake complete");
                HandshakeStatus::Done
            }
            PumpOutcome::Blocked => HandshakeStatus::WouldBlock(Direction::Write),
            PumpOutcome::Failed(e) => HandshakeStatus::Failed(e),
        }
    }

    /// Best-effort graceful shutdown; idempotent.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.send_close_notify();
        match self.pump_writes() {
            PumpOutcome::Drained => debug!("tls close_notify sent"),
            PumpOutcome::Blocked => debug!("socket not writable at close; close_notify dropped"),
            PumpOutcome::Failed(e) => debug!(error = %e, "tls shutdown failed"),
        }
    }

    /// Copies decrypted plaintext out of the session, if any.
    ///
    /// `None` means the session holds no plaintext right now; the other
    /// outcomes are terminal for this attempt.
    fn read_plaintext(&mut self, buf: &mut ByteBuffer) -> Option<IoOutcome> {
        if buf.write_available() == 0 {
            return None;
        }
        match self.session.reader().read(buf.unfilled()) {
            Ok(0) => Some(IoOutcome::PeerClosed),
            Ok(n) => {
                buf.add_filled(n);
                trace!(bytes = n, "tls plaintext read");
                Some(IoOutcome::Progress(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => Some(IoOutcome::Fatal(e)),
        }
    }

    fn pump_writes(&mut self) -> PumpOutcome {
        while self.session.wants_write() {
            match self.session.write_tls(&mut SocketWriter(&self.socket)) {
                Ok(n) => trace!(bytes = n, "tls records written"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return PumpOutcome::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return PumpOutcome::Failed(e),
            }
        }
        PumpOutcome::Drained
    }
}
