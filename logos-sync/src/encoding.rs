//! Variable-length binary encoding primitives.
//!
//! Wire format (lib0-compatible, shared with every Yjs client):
//! ```text
//! varuint    7 payload bits per byte, least significant group first,
//!            high bit set on every byte except the last
//! byteArray  varuint length ++ raw bytes
//! varString  varuint byte length ++ UTF-8 bytes
//! ```
//!
//! Decoding never recovers: the first malformed field fails the whole read
//! and the caller drops the frame.

/// Errors raised while reading an encoded buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before the field was complete.
    UnexpectedEof,
    /// A varuint ran past 64 bits.
    VarIntOverflow,
    /// A varString did not hold valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "Unexpected end of input"),
            Self::VarIntOverflow => write!(f, "Variable-length integer overflow"),
            Self::InvalidUtf8 => write!(f, "Invalid UTF-8 in string"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Growable output buffer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append a LEB128 variable-length unsigned integer.
    #[inline]
    pub fn write_var_u64(&mut self, mut n: u64) {
        while n >= 0x80 {
            self.buf.push((n as u8 & 0x7F) | 0x80);
            n >>= 7;
        }
        self.buf.push(n as u8);
    }

    /// Append a length-prefixed byte array.
    pub fn write_buf(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) {
        self.write_buf(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-tracked reader over a borrowed input buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Read a LEB128 variable-length unsigned integer.
    pub fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
            self.pos += 1;

            let bits = (byte & 0x7F) as u64;
            if shift >= 64 || (shift == 63 && bits > 1) {
                return Err(DecodeError::VarIntOverflow);
            }
            result |= bits << shift;

            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read exactly `len` raw bytes.
    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a length-prefixed byte array.
    pub fn read_buf(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEof)?;
        self.read_exact(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let bytes = self.read_buf()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}
