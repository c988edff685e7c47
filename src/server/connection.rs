//! Per-connection state machine.
//!
//! Each accepted socket is driven by an explicit machine:
//!
//! ```text
//!        +--------- MoreDataNeeded ----------+
//!        v                                   |
//!      READ ---> PROCESS ---> WRITE ---> READ ...
//!        |          |  \         \
//!        |          |   Processing\--- not ready ---> WAIT
//!        |          |        v
//!        |          |    GET_RESULT --(manual wake)--> WRITE
//!        |          v
//!        +------> CLOSED  (peer close, fatal I/O, Terminate)
//! ```
//!
//! Work inside a state is synchronous and runs to the next would-block
//! or terminal outcome; the task suspends only in WAIT (armed socket
//! readiness) and GET_RESULT (the manual-wake event, with the socket
//! read direction deliberately left disarmed). The whole machine runs on
//! the one task that owns the connection, so no per-connection locking
//! exists anywhere below this point.

mod error;

pub use error::ConnectionError;

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::buffer::{ByteBuffer, SOCKET_BUFFER_SIZE};
use crate::protocol::handler::{
    HandlerKind, ProcessResult, ProtocolHandler, StartupOutcome, create,
};
use crate::protocol::packet::{InboundPacket, OutboundPacket, PacketStatus};
use crate::protocol::startup::ClientIdentity;
use crate::query::{QueryBackend, QueryRouter};
use crate::tasks::{WakeHandle, WorkerPool};
use crate::transport::{Direction, HandshakeStatus, IoOutcome, TlsContext, Wire};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Fill the read buffer from the socket.
    Read,
    /// Frame packets and drive the protocol handler.
    Process,
    /// Serialize the response queue and flush.
    Write,
    /// Parked on armed socket readiness.
    Wait,
    /// Parked on the manual-wake event while the pool executes.
    GetResult,
    /// Terminal.
    Closed,
}

/// Outcome of one state's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Proceed,
    NeedData,
    Defer,
    Finish,
    Error,
}

/// Outcome of driving the response queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Complete,
    NotReady,
    Error,
}

/// One step of serialization against the write buffer.
enum WriteStep {
    Done,
    NotReady(Direction),
    Error,
}

/// A single client connection, generic over the transport so tests can
/// drive the machine through a scripted wire.
pub struct Connection<W: Wire> {
    id: u64,
    wire: W,
    state: ConnState,
    /// State to re-enter once the armed readiness fires.
    resume: ConnState,
    /// Readiness the next retry must wait for. For TLS this can be the
    /// opposite of the operation being retried.
    wait_on: Direction,
    read_buffer: ByteBuffer,
    write_buffer: ByteBuffer,
    /// In-progress startup-phase packet (headerless framing).
    pending: InboundPacket,
    handler: Option<Box<dyn ProtocolHandler>>,
    handler_kind: HandlerKind,
    backend: Arc<dyn QueryBackend>,
    pool: WorkerPool,
    tls: Option<TlsContext>,
    wake: WakeHandle,
    /// Cursor into the handler's response queue; entries before it are
    /// fully serialized.
    next_response: usize,
    /// Set once a real StartupMessage completes. Gates regular framing
    /// and, per the historical wire quirk, length emission on responses.
    startup_done: bool,
    /// An accepted SSLRequest whose handshake has not finished yet.
    ssl_pending: bool,
    identity: Option<ClientIdentity>,
    fatal: Option<ConnectionError>,
}

impl<W: Wire> Connection<W> {
    pub fn new(
        wire: W,
        id: u64,
        handler_kind: HandlerKind,
        backend: Arc<dyn QueryBackend>,
        pool: WorkerPool,
        tls: Option<TlsContext>,
    ) -> Self {
        Self {
            id,
            wire,
            state: ConnState::Read,
            resume: ConnState::Read,
            wait_on: Direction::Read,
            read_buffer: ByteBuffer::with_capacity(SOCKET_BUFFER_SIZE),
            write_buffer: ByteBuffer::with_capacity(SOCKET_BUFFER_SIZE),
            pending: InboundPacket::new(),
            handler: None,
            handler_kind,
            backend,
            pool,
            tls,
            wake: WakeHandle::new(),
            next_response: 0,
            startup_done: false,
            ssl_pending: false,
            identity: None,
            fatal: None,
        }
    }

    /// The client identity from the startup packet, once present.
    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Drives the connection until it closes. Always runs the CLOSED
    /// cleanup before returning; the error, if any, is what forced the
    /// close.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            trace!(id = self.id, state = ?self.state, "state entry");
            match self.state {
                ConnState::Read => match self.fill_read_buffer() {
                    Transition::Proceed => self.state = ConnState::Process,
                    Transition::NeedData => self.park(ConnState::Read),
                    Transition::Finish => {
                        debug!(id = self.id, "peer closed the connection");
                        self.state = ConnState::Closed;
                    }
                    _ => self.state = ConnState::Closed,
                },

                ConnState::Process => {
                    if self.ssl_pending && !self.step_tls_upgrade() {
                        continue;
                    }
                    match self.process_packets() {
                        Transition::Proceed => self.state = ConnState::Write,
                        Transition::NeedData => self.state = ConnState::Read,
                        Transition::Defer => {
                            // Read interest stays disarmed until the
                            // execution result has been collected.
                            debug!(id = self.id, "query deferred; waiting for the pool");
                            self.state = ConnState::GetResult;
                        }
                        Transition::Finish => self.state = ConnState::Closed,
                        Transition::Error => self.state = ConnState::Closed,
                    }
                }

                ConnState::Write => match self.write_responses() {
                    WriteState::Complete => {
                        // An accepted SSLRequest handshakes immediately
                        // after its answer is flushed; no plain read may
                        // intervene once TLS bytes are on the wire.
                        self.state = if self.ssl_pending {
                            ConnState::Process
                        } else {
                            ConnState::Read
                        };
                    }
                    WriteState::NotReady => self.park(ConnState::Write),
                    WriteState::Error => self.state = ConnState::Closed,
                },

                ConnState::Wait => match self.wire.wait(self.wait_on).await {
                    Ok(()) => self.state = self.resume,
                    Err(e) => {
                        error!(id = self.id, error = %e, "readiness wait failed");
                        self.fatal = Some(e.into());
                        self.state = ConnState::Closed;
                    }
                },

                ConnState::GetResult => {
                    self.wake.woken().await;
                    if let Some(handler) = self.handler.as_mut() {
                        handler.get_result();
                    }
                    self.state = ConnState::Write;
                }

                ConnState::Closed => {
                    self.shutdown();
                    return match self.fatal.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    fn park(&mut self, resume: ConnState) {
        self.resume = resume;
        self.state = ConnState::Wait;
    }

    /// Starts or resumes the TLS upgrade. Returns true when the channel
    /// is ready for application bytes; false means the state was changed
    /// (parked or closed) and the caller should loop.
    fn step_tls_upgrade(&mut self) -> bool {
        if !self.wire.is_encrypted() {
            // 'S' was only ever sent with a context configured.
            let Some(ctx) = self.tls.clone() else {
                error!(id = self.id, "tls accepted without a tls context");
                self.state = ConnState::Closed;
                return false;
            };
            if let Err(e) = self.wire.begin_tls(&ctx) {
                error!(id = self.id, error = %e, "tls upgrade failed");
                self.fatal = Some(e.into());
                self.state = ConnState::Closed;
                return false;
            }
            debug!(id = self.id, "tls upgrade started");
        }
        match self.wire.handshake_step() {
            HandshakeStatus::Done => {
                info!(id = self.id, "tls established");
                self.ssl_pending = false;
                true
            }
            HandshakeStatus::WouldBlock(dir) => {
                self.wait_on = dir;
                self.park(ConnState::Process);
                false
            }
            HandshakeStatus::Failed(e) => {
                error!(id = self.id, error = %e, "tls handshake failed");
                self.fatal = Some(ConnectionError::Io(e));
                self.state = ConnState::Closed;
                false
            }
        }
    }

    /// READ: pulls bytes until the buffer fills or the socket pushes
    /// back. Any progress at all is enough to try processing.
    fn fill_read_buffer(&mut self) -> Transition {
        if self.read_buffer.read_available() == 0 {
            self.read_buffer.reset();
        }
        // A full buffer with processed bytes at the front compacts so
        // the next packet header stays at the cursor.
        self.read_buffer.compact();

        let mut progressed = false;
        while self.read_buffer.write_available() > 0 {
            match self.wire.read_into(&mut self.read_buffer) {
                IoOutcome::Progress(n) => {
                    progressed |= n > 0;
                }
                IoOutcome::WouldBlock(dir) => {
                    self.wait_on = dir;
                    return if progressed {
                        Transition::Proceed
                    } else {
                        Transition::NeedData
                    };
                }
                IoOutcome::Interrupted => continue,
                IoOutcome::PeerClosed => return Transition::Finish,
                IoOutcome::Fatal(e) => {
                    error!(id = self.id, error = %e, "fatal read error");
                    self.fatal = Some(e.into());
                    return Transition::Error;
                }
            }
        }
        Transition::Proceed
    }

    /// PROCESS: frames at most one packet and drives the handler.
    fn process_packets(&mut self) -> Transition {
        if self.startup_done {
            // Invariant: startup completion created the handler.
            let Some(handler) = self.handler.as_mut() else {
                error!(id = self.id, "startup finished without a protocol handler");
                return Transition::Error;
            };
            return match handler.process(&mut self.read_buffer, self.id) {
                ProcessResult::MoreDataNeeded => Transition::NeedData,
                ProcessResult::Complete => Transition::Proceed,
                ProcessResult::Processing => Transition::Defer,
                ProcessResult::Terminate => Transition::Finish,
            };
        }

        // Startup phase: headerless framing, handler created on the
        // first successfully framed packet.
        match self.pending.advance(&mut self.read_buffer, true) {
            Err(e) => {
                warn!(id = self.id, error = %e, "malformed startup packet");
                self.fatal = Some(e.into());
                return Transition::Error;
            }
            Ok(PacketStatus::MoreDataNeeded) => return Transition::NeedData,
            Ok(PacketStatus::Ready) => {}
        }

        if self.handler.is_none() {
            let router = QueryRouter::new(Arc::clone(&self.backend), self.pool.clone());
            let mut handler = create(self.handler_kind, router, self.id);
            handler.set_wake_handle(self.wake.clone());
            self.handler = Some(handler);
        }
        let ssl_supported = self.tls.is_some() && !self.wire.is_encrypted();
        let Some(handler) = self.handler.as_mut() else {
            return Transition::Error;
        };
        let outcome = handler.process_startup(&mut self.pending, ssl_supported);
        self.pending.reset();

        match outcome {
            StartupOutcome::Terminate => Transition::Finish,
            StartupOutcome::Proceed {
                identity,
                begin_tls,
                startup_complete,
            } => {
                if let Some(identity) = identity {
                    self.identity = Some(identity);
                }
                self.ssl_pending = begin_tls;
                if startup_complete {
                    self.startup_done = true;
                }
                Transition::Proceed
            }
        }
    }

    /// WRITE: serializes queued packets in order and flushes.
    ///
    /// A packet leaves the queue only when fully serialized; a partial
    /// flush resumes exactly where it stopped, with `skip_header` and
    /// `write_ptr` preventing any byte from being emitted twice.
    fn write_responses(&mut self) -> WriteState {
        let Self {
            id,
            wire,
            write_buffer,
            handler,
            next_response,
            startup_done,
            wait_on,
            ..
        } = self;
        let Some(handler) = handler.as_mut() else {
            return WriteState::Complete;
        };

        let queue = handler.responses();
        while *next_response < queue.len() {
            let packet = &mut queue[*next_response];
            trace!(
                id = *id,
                msg_type = packet.msg_type,
                len = packet.payload.len(),
                "serializing response packet"
            );
            match Self::buffer_header(wire, write_buffer, *startup_done, packet) {
                WriteStep::Done => {}
                WriteStep::NotReady(dir) => {
                    *wait_on = dir;
                    return WriteState::NotReady;
                }
                WriteStep::Error => return WriteState::Error,
            }
            match Self::buffer_content(wire, write_buffer, packet) {
                WriteStep::Done => {}
                WriteStep::NotReady(dir) => {
                    *wait_on = dir;
                    return WriteState::NotReady;
                }
                WriteStep::Error => return WriteState::Error,
            }
            *next_response += 1;
        }

        // Everything serialized: the queue clears wholesale.
        queue.clear();
        *next_response = 0;

        if handler.flush_requested() {
            match Self::flush_buffer(wire, write_buffer) {
                WriteStep::Done => handler.set_flush_requested(false),
                WriteStep::NotReady(dir) => {
                    *wait_on = dir;
                    return WriteState::NotReady;
                }
                WriteStep::Error => return WriteState::Error,
            }
        }
        WriteState::Complete
    }

    /// Emits a packet's type byte and length field into the write
    /// buffer. The length field is emitted only once startup has
    /// completed; that historical wire quirk is preserved here, and it
    /// is what lets the SSL negotiation answer reach the client as a
    /// single naked byte.
    fn buffer_header(
        wire: &mut W,
        write_buffer: &mut ByteBuffer,
        startup_done: bool,
        packet: &mut OutboundPacket,
    ) -> WriteStep {
        if packet.skip_header {
            return WriteStep::Done;
        }
        // Type byte plus length must land contiguously.
        if write_buffer.write_available() < 5 {
            match Self::flush_buffer(wire, write_buffer) {
                WriteStep::Done => {}
                other => return other,
            }
        }
        if packet.msg_type != 0 {
            write_buffer.append(&[packet.msg_type]);
        }
        if startup_done {
            let length = packet.payload.len() as u32 + 4;
            write_buffer.append(&length.to_be_bytes());
        }
        packet.skip_header = true;
        WriteStep::Done
    }

    /// Copies payload bytes into the write buffer, flushing whenever the
    /// buffer fills, resuming at the packet's own cursor.
    fn buffer_content(
        wire: &mut W,
        write_buffer: &mut ByteBuffer,
        packet: &mut OutboundPacket,
    ) -> WriteStep {
        while packet.write_ptr < packet.payload.len() {
            let copied = write_buffer.append(&packet.payload[packet.write_ptr..]);
            packet.write_ptr += copied;
            if packet.write_ptr < packet.payload.len() {
                match Self::flush_buffer(wire, write_buffer) {
                    WriteStep::Done => {}
                    other => return other,
                }
            }
        }
        WriteStep::Done
    }

    /// Pushes the write buffer to the socket until empty or blocked.
    fn flush_buffer(wire: &mut W, write_buffer: &mut ByteBuffer) -> WriteStep {
        while write_buffer.read_available() > 0 || wire.has_pending_write() {
            match wire.write_from(write_buffer) {
                IoOutcome::Progress(_) => {}
                IoOutcome::WouldBlock(dir) => return WriteStep::NotReady(dir),
                IoOutcome::Interrupted => continue,
                IoOutcome::PeerClosed => return WriteStep::Error,
                IoOutcome::Fatal(e) => {
                    error!(error = %e, "fatal write error");
                    return WriteStep::Error;
                }
            }
        }
        write_buffer.reset();
        WriteStep::Done
    }

    /// CLOSED: the single release point. Transport shutdown (TLS
    /// close_notify, socket released on drop), handler destroyed,
    /// buffers cleared.
    fn shutdown(&mut self) {
        debug!(id = self.id, "closing connection");
        self.wire.close();
        if let Some(mut handler) = self.handler.take() {
            handler.reset();
        }
        self.read_buffer.reset();
        self.write_buffer.reset();
        self.pending.reset();
    }
}
