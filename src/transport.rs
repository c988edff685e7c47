//! Transport channels: a socket abstracted into a uniform nonblocking
//! byte source/sink.
//!
//! Two variants share one contract: a plain TCP channel and a TLS channel
//! layered over the same socket after a cleartext upgrade. Every I/O
//! attempt is nonblocking and reports an [`IoOutcome`]; when an attempt
//! cannot make progress, the outcome names the socket readiness
//! ([`Direction`]) the caller must wait for before retrying. For TLS that
//! direction is independent of the attempted operation: a read in the
//! middle of a handshake can block on socket *writability* and vice versa.

pub mod channel;
pub mod tls;

pub use channel::{Channel, Direction, HandshakeStatus, IoOutcome, PlainChannel, Wire};
pub use tls::{TlsChannel, TlsContext, TlsError};
