//! Startup-phase message parsing.
//!
//! The first packets on a connection carry no type byte; they are
//! discriminated by a 32-bit code at the start of the payload:
//! SSLRequest, GSSENCRequest and CancelRequest use reserved magic
//! numbers, anything with a major version of 3 is a StartupMessage.

use std::collections::HashMap;

use crate::protocol::ProtocolError;

/// SSLRequest magic number.
pub const SSL_REQUEST_CODE: i32 = (1234 << 16) | 5679; // 80877103

/// GSSENCRequest magic number.
pub const GSSENC_REQUEST_CODE: i32 = (1234 << 16) | 5680; // 80877104

/// CancelRequest magic number.
pub const CANCEL_REQUEST_CODE: i32 = (1234 << 16) | 5678; // 80877102

/// A parsed startup-phase request.
#[derive(Debug)]
pub enum StartupRequest {
    /// Client asks to negotiate TLS before anything else.
    Ssl,
    /// Client asks for GSSAPI encryption.
    GssEnc,
    /// Client asks to cancel an in-flight query on another connection.
    Cancel { process_id: i32, secret_key: i32 },
    /// Normal connection startup.
    Startup {
        protocol_version: i32,
        identity: ClientIdentity,
    },
}

/// Who connected: populated from the startup parameters, read-only for
/// the rest of the connection's life.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub user: String,
    pub database: Option<String>,
    pub application_name: Option<String>,
    pub other: HashMap<String, String>,
}

impl StartupRequest {
    /// Parses a completed startup packet payload (the bytes after the
    /// length field).
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::InvalidMessage);
        }
        let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let rest = &payload[4..];

        match code {
            SSL_REQUEST_CODE if rest.is_empty() => Ok(StartupRequest::Ssl),
            GSSENC_REQUEST_CODE if rest.is_empty() => Ok(StartupRequest::GssEnc),
            CANCEL_REQUEST_CODE if rest.len() == 8 => {
                let process_id = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let secret_key = i32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
                Ok(StartupRequest::Cancel {
                    process_id,
                    secret_key,
                })
            }
            SSL_REQUEST_CODE | GSSENC_REQUEST_CODE | CANCEL_REQUEST_CODE => {
                Err(ProtocolError::InvalidMessage)
            }
            version if (version >> 16) == 3 => Ok(StartupRequest::Startup {
                protocol_version: version,
                identity: parse_parameters(rest)?,
            }),
            other => Err(ProtocolError::UnsupportedProtocolVersion(other)),
        }
    }
}

/// Parses the name/value parameter list: NUL-terminated pairs, ended by
/// an empty name. A bare protocol-version packet with no parameters is
/// accepted; the user then stays empty.
fn parse_parameters(mut rest: &[u8]) -> Result<ClientIdentity, ProtocolError> {
    let mut identity = ClientIdentity::default();

    loop {
        if rest.is_empty() {
            break;
        }
        let name = take_cstring(&mut rest)?;
        if name.is_empty() {
            break;
        }
        let value = take_cstring(&mut rest)?;

        match name.as_str() {
            "user" => identity.user = value,
            "database" => identity.database = Some(value),
            "application_name" => identity.application_name = Some(value),
            _ => {
                identity.other.insert(name, value);
            }
        }
    }

    Ok(identity)
}

/// Splits one NUL-terminated string off the front of `rest`.
fn take_cstring(rest: &mut &[u8]) -> Result<String, ProtocolError> {
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::InvalidMessage)?;
    let s = std::str::from_utf8(&rest[..nul]).map_err(|_| ProtocolError::InvalidUtf8)?;
    *rest = &rest[nul + 1..];
    Ok(s.to_string())
}
