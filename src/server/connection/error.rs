use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TlsError;

/// What forced a connection to close.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}
