//! Backend (server → client) message encoding.
//!
//! Messages encode only their *body* here; the frame serializer owns the
//! type byte and the length field, because header emission depends on
//! per-connection state (a partially flushed packet must not repeat its
//! header, and length emission is gated until startup completes).

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::packet::OutboundPacket;

/// SQLSTATE codes this server emits.
///
/// Reference: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
pub mod sql_state {
    /// Connection exception (generic).
    pub const CONNECTION_EXCEPTION: &str = "08000";
    /// Protocol violation.
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    /// Feature not supported.
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    /// Internal error.
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Transaction status indicator carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' - idle (not in a transaction block).
    Idle,
    /// 'T' - in a transaction block.
    InTransaction,
    /// 'E' - in a failed transaction block.
    Failed,
}

impl TransactionStatus {
    fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// One field of an ErrorResponse, keyed by the protocol's field-type byte.
#[derive(Debug)]
pub struct ErrorField {
    pub code: u8,
    pub value: String,
}

impl ErrorField {
    pub fn new(code: u8, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.code);
        put_cstring(dst, &self.value);
    }
}

/// Column metadata for RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    /// Type OID; 25 (text) unless the executor says otherwise.
    pub type_oid: i32,
}

impl FieldDescription {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: 25,
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        put_cstring(dst, &self.name);
        dst.put_i32(0); // table OID
        dst.put_i16(0); // attribute number
        dst.put_i32(self.type_oid);
        dst.put_i16(-1); // type length (variable)
        dst.put_i32(-1); // type modifier
        dst.put_i16(0); // format code: text
    }
}

/// Messages sent by the backend (server) to the client.
#[derive(Debug)]
pub enum BackendMessage {
    /// 'R' - authentication response (AuthenticationOk).
    AuthenticationOk,
    /// 'K' - backend key data for cancel requests.
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// 'S' - parameter status notification.
    ParameterStatus { name: String, value: String },
    /// 'Z' - ready for query.
    ReadyForQuery { status: TransactionStatus },
    /// 'E' - error response.
    ErrorResponse { fields: Vec<ErrorField> },
    /// 'T' - row description (column metadata).
    RowDescription { fields: Vec<FieldDescription> },
    /// 'D' - data row; `None` is SQL NULL, values travel in text format.
    DataRow { values: Vec<Option<String>> },
    /// 'C' - command complete.
    CommandComplete { tag: String },
    /// 'I' - empty query response.
    EmptyQueryResponse,
}

impl BackendMessage {
    /// Builds a well-formed ErrorResponse with the required fields.
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        BackendMessage::ErrorResponse {
            fields: vec![
                ErrorField::new(b'S', "ERROR"),
                ErrorField::new(b'V', "ERROR"),
                ErrorField::new(b'C', code),
                ErrorField::new(b'M', message),
            ],
        }
    }

    /// The message type byte.
    fn ty(&self) -> u8 {
        match self {
            BackendMessage::AuthenticationOk => b'R',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::ErrorResponse { .. } => b'E',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
        }
    }

    /// Encodes the body of this message (no type byte, no length field).
    fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            BackendMessage::AuthenticationOk => {
                dst.put_i32(0); // auth type 0 = Ok
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                dst.put_i32(*process_id);
                dst.put_i32(*secret_key);
            }
            BackendMessage::ParameterStatus { name, value } => {
                put_cstring(dst, name);
                put_cstring(dst, value);
            }
            BackendMessage::ReadyForQuery { status } => {
                dst.put_u8(status.as_byte());
            }
            BackendMessage::ErrorResponse { fields } => {
                for field in fields {
                    field.encode(dst);
                }
                dst.put_u8(0); // terminator
            }
            BackendMessage::RowDescription { fields } => {
                dst.put_i16(fields.len() as i16);
                for field in fields {
                    field.encode(dst);
                }
            }
            BackendMessage::DataRow { values } => {
                dst.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        Some(v) => {
                            dst.put_i32(v.len() as i32);
                            dst.put_slice(v.as_bytes());
                        }
                        None => dst.put_i32(-1),
                    }
                }
            }
            BackendMessage::CommandComplete { tag } => {
                put_cstring(dst, tag);
            }
            BackendMessage::EmptyQueryResponse => {}
        }
    }

    /// Encodes this message into an outbound packet for the response
    /// queue.
    pub fn into_packet(self) -> OutboundPacket {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);
        OutboundPacket::new(self.ty(), body.freeze())
    }
}

/// Writes a NUL-terminated string.
pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Reads a NUL-terminated string off the front of a message body,
/// returning the string and the remainder.
pub fn get_cstring(src: &[u8]) -> Option<(&str, &[u8])> {
    let nul = src.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&src[..nul]).ok()?;
    Some((s, &src[nul + 1..]))
}

/// A single-byte response with no header at all, used for the SSL
/// negotiation answer. It rides the ordinary response queue: while
/// startup is incomplete the serializer emits no length field, so the
/// packet reaches the wire as exactly one byte.
pub fn encryption_answer(supported: bool) -> OutboundPacket {
    OutboundPacket::new(if supported { b'S' } else { b'N' }, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_for_query_body() {
        let mut dst = BytesMut::new();
        BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        }
        .encode_body(&mut dst);
        assert_eq!(&dst[..], b"I");
    }

    #[test]
    fn test_authentication_ok_packet() {
        let pkt = BackendMessage::AuthenticationOk.into_packet();
        assert_eq!(pkt.msg_type, b'R');
        assert_eq!(&pkt.payload[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_error_response_has_terminator() {
        let pkt = BackendMessage::error(sql_state::FEATURE_NOT_SUPPORTED, "nope").into_packet();
        assert_eq!(pkt.msg_type, b'E');
        assert_eq!(*pkt.payload.last().unwrap(), 0);
        // Contains the SQLSTATE field.
        let needle = b"C0A000\0";
        assert!(
            pkt.payload
                .windows(needle.len())
                .any(|window| window == needle)
        );
    }

    #[test]
    fn test_data_row_null_encoding() {
        let mut dst = BytesMut::new();
        BackendMessage::DataRow {
            values: vec![Some("1".into()), None],
        }
        .encode_body(&mut dst);
        // count=2, "1" with length 1, then NULL marker -1.
        assert_eq!(
            &dst[..],
            &[0, 2, 0, 0, 0, 1, b'1', 0xff, 0xff, 0xff, 0xff][..]
        );
    }

    #[test]
    fn test_cstring_round_trip() {
        let mut dst = BytesMut::new();
        put_cstring(&mut dst, "hello");
        let (s, rest) = get_cstring(&dst).unwrap();
        assert_eq!(s, "hello");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_encryption_answer_is_headerless_payload() {
        let pkt = encryption_answer(true);
        assert_eq!(pkt.msg_type, b'S');
        assert!(pkt.payload.is_empty());
    }
}
