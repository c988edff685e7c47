use thiserror::Error;

/// Protocol parsing errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message")]
    InvalidMessage,
    #[error("message of {0} bytes exceeds the maximum message size")]
    OversizedMessage(usize),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(i32),
    #[error("invalid UTF-8 in message")]
    InvalidUtf8,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
