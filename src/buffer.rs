//! Fixed-capacity socket buffers.
//!
//! Each connection owns one read buffer and one write buffer of
//! [`SOCKET_BUFFER_SIZE`] bytes. The buffer is a single contiguous
//! allocation with two cursors: `cursor` marks the next byte to consume
//! (or flush), `size` marks one past the last valid byte. Keeping the
//! allocation fixed avoids allocator traffic on the per-packet hot path;
//! packets larger than the buffer go through an out-of-line payload
//! allocation instead (see `protocol::packet`).
//!
//! Invariant, always: `0 <= cursor <= size <= capacity`.

/// Capacity of the per-connection read and write buffers.
///
/// Stable per build: message framing decides whether a payload needs an
/// out-of-line allocation by comparing against this capacity.
pub const SOCKET_BUFFER_SIZE: usize = 8192;

/// A fixed-capacity contiguous byte buffer with consume/fill cursors.
#[derive(Debug)]
pub struct ByteBuffer {
    data: Box<[u8]>,
    /// Next byte to consume (read side) or flush (write side).
    cursor: usize,
    /// One past the last valid byte.
    size: usize,
}

impl ByteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Discards all content and rewinds both cursors.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.size = 0;
    }

    /// Bytes available to consume: `size - cursor`.
    pub fn read_available(&self) -> usize {
        self.size - self.cursor
    }

    /// Bytes of free space at the tail: `capacity - size`.
    pub fn write_available(&self) -> usize {
        self.capacity() - self.size
    }

    /// The valid, not-yet-consumed content: `[cursor, size)`.
    pub fn filled(&self) -> &[u8] {
        &self.data[self.cursor..self.size]
    }

    /// The free tail of the buffer: `[size, capacity)`.
    pub fn unfilled(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.data[size..]
    }

    /// Records `n` bytes written into [`Self::unfilled`].
    pub fn add_filled(&mut self, n: usize) {
        debug_assert!(n <= self.write_available());
        self.size += n;
    }

    /// Consumes `n` bytes from the front of the valid content.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.read_available());
        self.cursor += n;
    }

    /// Moves unconsumed content to the head of the buffer.
    ///
    /// Only acts when the buffer is full but partially consumed; this
    /// keeps the next inbound packet header starting at `cursor` while
    /// making the tail available for the next fill. Content up to
    /// `cursor` has been fully processed and is overwritten.
    pub fn compact(&mut self) {
        if self.cursor < self.size && self.size == self.capacity() && self.cursor > 0 {
            self.data.copy_within(self.cursor..self.size, 0);
            self.size -= self.cursor;
            self.cursor = 0;
        }
    }

    /// Reads a big-endian u32 at `cursor` without consuming it.
    pub fn peek_u32_be(&self) -> Option<u32> {
        let bytes = self.filled().get(..4)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }

    /// Consumes a big-endian u32 from the front of the valid content.
    pub fn consume_u32_be(&mut self) -> Option<u32> {
        let value = self.peek_u32_be()?;
        self.cursor += 4;
        Some(value)
    }

    /// Consumes a single byte from the front of the valid content.
    pub fn consume_u8(&mut self) -> Option<u8> {
        let value = *self.filled().first()?;
        self.cursor += 1;
        Some(value)
    }

    /// Appends as much of `src` as fits, returning the number of bytes
    /// copied. A short return means the buffer is full and must be
    /// flushed before the rest can be appended.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.write_available());
        let size = self.size;
        self.data[size..size + n].copy_from_slice(&src[..n]);
        self.size += n;
        n
    }
}
