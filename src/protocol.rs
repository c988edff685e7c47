//! PostgreSQL wire protocol: framing, startup handling, and the
//! protocol-handler port the connection engine drives.
//!
//! ## Architecture
//!
//! ```text
//! socket bytes --> ByteBuffer --> InboundPacket --> ProtocolHandler
//!                                                        |
//! socket bytes <-- ByteBuffer <-- OutboundPacket <-- responses
//! ```
//!
//! ## Terminology
//!
//! - **Startup packet**: the first client message; length-prefixed with
//!   no type byte (StartupMessage, SSLRequest, CancelRequest).
//! - **Regular packet**: `[type:u8][length:u32_be][payload]` where the
//!   length includes itself but not the type byte.
//! - **Extended payload**: an out-of-line allocation used when a single
//!   payload exceeds the socket buffer capacity.

pub mod backend;
pub mod error;
pub mod handler;
pub mod packet;
pub mod postgres;
pub mod startup;

pub use backend::{BackendMessage, ErrorField, FieldDescription, TransactionStatus, sql_state};
pub use error::ProtocolError;
pub use handler::{HandlerKind, ProcessResult, ProtocolHandler, StartupOutcome, create};
pub use packet::{InboundPacket, OutboundPacket, PacketStatus};
pub use startup::{ClientIdentity, StartupRequest};
