//! Packet framing over the fixed socket buffers.
//!
//! Inbound parsing is a restartable two-phase affair: first the header
//! (type byte plus big-endian length; startup packets have no type byte),
//! then the payload, copied out incrementally as bytes arrive. The parse
//! can stop after any byte and resume on the next fill, which is what
//! lets the engine tolerate arbitrary fragmentation.

use bytes::{Bytes, BytesMut};

use crate::buffer::ByteBuffer;
use crate::protocol::ProtocolError;

/// Maximum accepted payload size (16 MiB). PostgreSQL itself allows up
/// to 1 GB; this is a saner bound for the workloads this server sees.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Result of one framing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// The current buffer content is exhausted mid-packet.
    MoreDataNeeded,
    /// Header and payload are complete; consume with
    /// [`InboundPacket::take_payload`] and [`InboundPacket::reset`].
    Ready,
}

/// A partially or fully received inbound packet.
///
/// The payload is an owned allocation reserved to the exact declared
/// size once the header is parsed; payloads larger than the socket
/// buffer capacity simply make that allocation large (the "extended"
/// path). The read buffer itself never grows.
#[derive(Debug, Default)]
pub struct InboundPacket {
    msg_type: u8,
    declared_len: usize,
    payload: BytesMut,
    header_parsed: bool,
    initialized: bool,
    extended: bool,
}

impl InboundPacket {
    pub fn new() -> Self {
        Self::default()
    }

    /// The packet type byte; 0 for startup packets.
    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// Declared payload length (the wire length field minus itself).
    pub fn declared_len(&self) -> usize {
        self.declared_len
    }

    pub fn header_parsed(&self) -> bool {
        self.header_parsed
    }

    /// True when the payload did not fit the socket buffer and went to
    /// an out-of-line allocation.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Advances the parse as far as the buffer content allows.
    ///
    /// `startup` selects the headerless framing of the startup phase.
    /// Returns [`PacketStatus::Ready`] exactly once per packet; the
    /// caller must [`reset`](Self::reset) before parsing the next one.
    pub fn advance(
        &mut self,
        buf: &mut ByteBuffer,
        startup: bool,
    ) -> Result<PacketStatus, ProtocolError> {
        if !self.header_parsed && !self.parse_header(buf, startup)? {
            return Ok(PacketStatus::MoreDataNeeded);
        }
        if !self.initialized && !self.fill_payload(buf) {
            return Ok(PacketStatus::MoreDataNeeded);
        }
        Ok(PacketStatus::Ready)
    }

    /// Takes ownership of the completed payload.
    pub fn take_payload(&mut self) -> Bytes {
        debug_assert!(self.initialized);
        std::mem::take(&mut self.payload).freeze()
    }

    /// Clears all parse state, releasing any extended allocation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Header phase. Consumes nothing until the full header is present;
    /// on success the cursor has moved past the header and the payload
    /// allocation is reserved.
    fn parse_header(&mut self, buf: &mut ByteBuffer, startup: bool) -> Result<bool, ProtocolError> {
        let header_len = if startup { 4 } else { 5 };
        if buf.read_available() < header_len {
            return Ok(false);
        }

        if !startup {
            self.msg_type = buf.consume_u8().unwrap_or_default();
        }
        let length_field = buf.consume_u32_be().unwrap_or_default() as usize;

        // The length field includes itself; anything smaller is garbage.
        if length_field < 4 {
            return Err(ProtocolError::InvalidMessage);
        }
        let payload_len = length_field - 4;
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::OversizedMessage(payload_len));
        }

        self.declared_len = payload_len;
        self.extended = payload_len > buf.capacity();
        self.payload = BytesMut::with_capacity(payload_len);
        self.header_parsed = true;
        Ok(true)
    }

    /// Payload phase. Copies whatever is available, returning true once
    /// the declared length has been received.
    fn fill_payload(&mut self, buf: &mut ByteBuffer) -> bool {
        let missing = self.declared_len - self.payload.len();
        let n = missing.min(buf.read_available());
        if n > 0 {
            self.payload.extend_from_slice(&buf.filled()[..n]);
            buf.consume(n);
        }
        if self.payload.len() == self.declared_len {
            self.initialized = true;
        }
        self.initialized
    }
}

/// An outbound response packet produced by the protocol handler.
///
/// The serializer owns header emission (type byte and length field);
/// `skip_header` and `write_ptr` let a packet survive a mid-packet flush
/// without duplicating bytes.
#[derive(Debug)]
pub struct OutboundPacket {
    /// Message type byte; 0 means no type byte is emitted.
    pub msg_type: u8,
    /// Message body, excluding type and length.
    pub payload: Bytes,
    /// Set once the header has been copied into the write buffer.
    pub skip_header: bool,
    /// Payload bytes already copied into the write buffer.
    pub write_ptr: usize,
}

impl OutboundPacket {
    pub fn new(msg_type: u8, payload: Bytes) -> Self {
        Self {
            msg_type,
            payload,
            skip_header: false,
            write_ptr: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;

    fn buffer_with(bytes: &[u8]) -> ByteBuffer {
        let mut buf = ByteBuffer::with_capacity(64);
        buf.append(bytes);
        buf
    }

    #[test]
    fn test_startup_header_needs_four_bytes() {
        let mut pkt = InboundPacket::new();
        let mut buf = ByteBuffer::with_capacity(64);

        // One length byte per call: three short attempts, no consumption.
        for byte in [0x00, 0x00, 0x00] {
            buf.append(&[byte]);
            assert_eq!(
                pkt.advance(&mut buf, true).unwrap(),
                PacketStatus::MoreDataNeeded
            );
            assert!(!pkt.header_parsed());
        }
        assert_eq!(buf.read_available(), 3);

        // Fourth byte completes the header: length 8 => 4-byte payload.
        buf.append(&[0x08]);
        assert_eq!(
            pkt.advance(&mut buf, true).unwrap(),
            PacketStatus::MoreDataNeeded
        );
        assert!(pkt.header_parsed());
        assert_eq!(pkt.declared_len(), 4);
        assert_eq!(buf.read_available(), 0);
    }

    #[test]
    fn test_startup_packet_complete() {
        let mut pkt = InboundPacket::new();
        // length=8, protocol 3.0
        let mut buf = buffer_with(&[0x00, 0x00, 0x00, 0x08, 0x00, 0x03, 0x00, 0x00]);

        assert_eq!(pkt.advance(&mut buf, true).unwrap(), PacketStatus::Ready);
        assert_eq!(pkt.msg_type(), 0);
        assert!(!pkt.is_extended());
        assert_eq!(&pkt.take_payload()[..], &[0x00, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_regular_packet_header_and_payload() {
        let mut pkt = InboundPacket::new();
        let mut buf = buffer_with(b"Q\x00\x00\x00\x0ahello\0");

        assert_eq!(pkt.advance(&mut buf, false).unwrap(), PacketStatus::Ready);
        assert_eq!(pkt.msg_type(), b'Q');
        assert_eq!(&pkt.take_payload()[..], b"hello\0");
    }

    #[test]
    fn test_payload_arrives_in_fragments() {
        let mut pkt = InboundPacket::new();
        let mut buf = buffer_with(b"Q\x00\x00\x00\x0aab");

        assert_eq!(
            pkt.advance(&mut buf, false).unwrap(),
            PacketStatus::MoreDataNeeded
        );
        buf.append(b"cdef");
        assert_eq!(pkt.advance(&mut buf, false).unwrap(), PacketStatus::Ready);
        assert_eq!(&pkt.take_payload()[..], b"abcdef");
    }

    #[test]
    fn test_extended_payload_allocates_declared_size() {
        let mut pkt = InboundPacket::new();
        let mut buf = ByteBuffer::with_capacity(16);
        // Payload of capacity + 100 bytes.
        let payload_len = 16 + 100;
        buf.append(&((payload_len as u32 + 4).to_be_bytes()));

        assert_eq!(
            pkt.advance(&mut buf, true).unwrap(),
            PacketStatus::MoreDataNeeded
        );
        assert!(pkt.is_extended());
        assert_eq!(pkt.declared_len(), payload_len);

        // Feed the payload through the small buffer in chunks.
        let mut remaining = payload_len;
        while remaining > 0 {
            let chunk = remaining.min(buf.write_available());
            buf.append(&vec![0xAB; chunk]);
            remaining -= chunk;
            let status = pkt.advance(&mut buf, true).unwrap();
            if remaining > 0 {
                assert_eq!(status, PacketStatus::MoreDataNeeded);
            } else {
                assert_eq!(status, PacketStatus::Ready);
            }
        }
        assert_eq!(pkt.take_payload().len(), payload_len);
    }

    #[test]
    fn test_length_below_minimum_is_rejected() {
        let mut pkt = InboundPacket::new();
        let mut buf = buffer_with(&[0x00, 0x00, 0x00, 0x03]);
        assert!(pkt.advance(&mut buf, true).is_err());
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut pkt = InboundPacket::new();
        let huge = (MAX_MESSAGE_SIZE as u32) + 5;
        let mut buf = buffer_with(&huge.to_be_bytes());
        assert!(matches!(
            pkt.advance(&mut buf, true),
            Err(ProtocolError::OversizedMessage(_))
        ));
    }

    #[test]
    fn test_reset_releases_state() {
        let mut pkt = InboundPacket::new();
        let mut buf = buffer_with(&[0x00, 0x00, 0x00, 0x08, 0x00, 0x03, 0x00, 0x00]);
        assert_eq!(pkt.advance(&mut buf, true).unwrap(), PacketStatus::Ready);

        pkt.reset();
        assert!(!pkt.header_parsed());
        assert_eq!(pkt.declared_len(), 0);
    }
}
