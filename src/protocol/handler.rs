//! The protocol-handler port.
//!
//! The connection engine knows nothing about any particular protocol: it
//! frames startup packets, then hands everything to a [`ProtocolHandler`]
//! created through [`create`]. Adding a second protocol means adding a
//! [`HandlerKind`] variant and a handler implementation; the engine is
//! untouched.

use crate::buffer::ByteBuffer;
use crate::protocol::packet::{InboundPacket, OutboundPacket};
use crate::protocol::postgres::PostgresHandler;
use crate::protocol::startup::ClientIdentity;
use crate::query::QueryRouter;
use crate::tasks::WakeHandle;

/// Wire protocols this server can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Postgres,
}

/// What the handler made of the inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// A packet is still incomplete; read more.
    MoreDataNeeded,
    /// A packet was processed and responses are queued.
    Complete,
    /// The packet's work was handed to the execution pool; collect the
    /// result once the wake handle fires.
    Processing,
    /// The client asked to end the connection, or broke the protocol
    /// badly enough that continuing is pointless.
    Terminate,
}

/// Result of processing one startup-phase packet.
#[derive(Debug)]
pub enum StartupOutcome {
    Proceed {
        /// Present once a real StartupMessage completed.
        identity: Option<ClientIdentity>,
        /// The client asked for TLS and we agreed; the transport must be
        /// upgraded before the next inbound packet.
        begin_tls: bool,
        /// The startup exchange is finished; regular framing (and length
        /// emission on responses) applies from here on.
        startup_complete: bool,
    },
    Terminate,
}

/// The interface the connection state machine drives.
///
/// One handler exists per connection, created on the first successfully
/// framed startup packet and destroyed when the connection closes.
pub trait ProtocolHandler: Send {
    /// Processes a completed startup-phase packet (SSLRequest,
    /// CancelRequest or StartupMessage).
    fn process_startup(&mut self, packet: &mut InboundPacket, ssl_supported: bool)
    -> StartupOutcome;

    /// Consumes bytes from the read buffer, framing and dispatching at
    /// most one regular packet per call.
    fn process(&mut self, buf: &mut ByteBuffer, worker_id: u64) -> ProcessResult;

    /// Collects the outcome of deferred work into the response queue.
    /// Called only after [`ProcessResult::Processing`], once the wake
    /// handle has fired.
    fn get_result(&mut self);

    /// Installs the handle the execution pool uses to wake this
    /// connection when deferred work completes.
    fn set_wake_handle(&mut self, wake: WakeHandle);

    /// The ordered outbound queue. The serializer borrows entries in
    /// order and clears the queue wholesale once everything is written.
    fn responses(&mut self) -> &mut Vec<OutboundPacket>;

    /// Whether the handler wants the write buffer pushed to the socket
    /// after the queue drains.
    fn flush_requested(&self) -> bool;

    fn set_flush_requested(&mut self, on: bool);

    /// Drops all per-connection protocol state. Called at close.
    fn reset(&mut self);
}

/// Builds a handler for the given protocol.
///
/// `connection_id` becomes the backend process id the protocol reports
/// to the client.
pub fn create(kind: HandlerKind, router: QueryRouter, connection_id: u64) -> Box<dyn ProtocolHandler> {
    match kind {
        HandlerKind::Postgres => Box::new(PostgresHandler::new(router, connection_id)),
    }
}
