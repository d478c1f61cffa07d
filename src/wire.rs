//! # Wire Codec Module
//!
//! Big-endian encoding and decoding of the scalars and fixed-length strings
//! that make up every control-channel message. The codec is deliberately
//! frameless: both peers know the exact wire length of each message from the
//! protocol state, so there is nothing to negotiate here.
//!
//! ## Design
//!
//! - **Push-style encoder**: `Encoder` appends fields to a growable buffer
//!   and is consumed by `finish()`.
//! - **Pull-style decoder**: `Decoder` walks a byte slice field by field.
//!   Reading past the end is an error; leaving trailing bytes unconsumed is
//!   not, which is what lets a receiver tolerate additive minor-version
//!   fields it does not know about.
//! - **Integers**: the low `n` bytes of the value, most significant byte
//!   first, zero-extended on decode. Widths 1, 2, 4 and 8 are supported.
//! - **Strings**: a fixed field width, null padded, with the last byte
//!   always null so the peer can treat the field as a C string.

use thiserror::Error;

/// Errors produced while decoding a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    /// The message ended before the requested field could be read.
    #[error("message truncated: wanted {wanted} more bytes, {left} left")]
    Truncated { wanted: usize, left: usize },

    /// An integer width outside the supported set was requested.
    #[error("unsupported integer width: {0}")]
    BadWidth(usize),
}

/// Push-style big-endian encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an encoder with capacity for a message of `len` bytes.
    pub fn with_capacity(len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(len),
        }
    }

    /// Append the low `n` bytes of `v`, most significant byte first.
    pub fn put_int(&mut self, v: u64, n: usize) {
        debug_assert!(matches!(n, 1 | 2 | 4 | 8));
        for i in (0..n).rev() {
            self.buf.push((v >> (i * 8)) as u8);
        }
    }

    /// Append a string into a fixed `width`-byte field, null padded.
    ///
    /// At most `width - 1` bytes of the string are written; the field always
    /// ends with at least one null byte.
    pub fn put_str(&mut self, s: &str, width: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(width.saturating_sub(1));
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + (width - n), 0);
    }

    /// Number of bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been encoded yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the encoder and return the wire bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Pull-style big-endian decoder over a received byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let left = self.buf.len() - self.pos;
        if n > left {
            return Err(WireError::Truncated { wanted: n, left });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Read an `n`-byte big-endian integer, zero-extended to 64 bits.
    pub fn get_int(&mut self, n: usize) -> Result<u64, WireError> {
        if !matches!(n, 1 | 2 | 4 | 8) {
            return Err(WireError::BadWidth(n));
        }
        let bytes = self.take(n)?;
        let mut v = 0u64;
        for &b in bytes {
            v = (v << 8) | u64::from(b);
        }
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        Ok(self.get_int(2)? as u16)
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(self.get_int(4)? as u32)
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        self.get_int(8)
    }

    /// Read a fixed `width`-byte string field, truncating at the first null.
    ///
    /// Non-UTF-8 bytes are replaced rather than rejected; identifier and rate
    /// strings are ASCII in practice and a garbled peer string should show up
    /// in a diagnostic, not kill the decode.
    pub fn get_str(&mut self, width: usize) -> Result<String, WireError> {
        let bytes = self.take(width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Bytes not yet consumed. Trailing bytes from a newer minor version are
    /// legal and simply ignored by the caller.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Codec round-trip for every supported width and a spread of values.
    #[test]
    fn test_int_round_trip() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (0xab, 1),
            (0xffff, 2),
            (0x1234, 2),
            (0xdeadbeef, 4),
            (1, 4),
            (0x0123_4567_89ab_cdef, 8),
            (u64::MAX, 8),
        ];
        for &(v, n) in cases {
            let mut enc = Encoder::default();
            enc.put_int(v, n);
            let bytes = enc.finish();
            assert_eq!(bytes.len(), n);
            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.get_int(n).unwrap(), v, "width {}", n);
            assert_eq!(dec.remaining(), 0);
        }
    }

    /// The encoder stores the low n bytes MSB-first.
    #[test]
    fn test_int_is_big_endian() {
        let mut enc = Encoder::default();
        enc.put_int(0x0102_0304, 4);
        assert_eq!(enc.finish(), vec![1, 2, 3, 4]);

        // Only the low bytes of a wider value survive a narrow encode.
        let mut enc = Encoder::default();
        enc.put_int(0xaabb_ccdd, 2);
        assert_eq!(enc.finish(), vec![0xcc, 0xdd]);
    }

    /// Strings round-trip up to the first null and always carry a trailing null.
    #[test]
    fn test_str_round_trip() {
        let mut enc = Encoder::default();
        enc.put_str("mlx5_0:1", 64);
        let bytes = enc.finish();
        assert_eq!(bytes.len(), 64);
        assert_eq!(bytes[8], 0);
        assert_eq!(bytes[63], 0);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_str(64).unwrap(), "mlx5_0:1");
    }

    /// Over-long strings are truncated so that the trailing null survives.
    #[test]
    fn test_str_truncates() {
        let long = "x".repeat(100);
        let mut enc = Encoder::default();
        enc.put_str(&long, 8);
        let bytes = enc.finish();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[7], 0);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_str(8).unwrap(), "x".repeat(7));
    }

    /// Reading past the end of a message is an error; trailing bytes are not.
    #[test]
    fn test_truncation_and_trailing() {
        let bytes = [0u8; 6];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_u32().unwrap(), 0);
        assert!(dec.get_u32().is_err());

        // A decoder may stop early: unknown trailing bytes are tolerated.
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_u16().unwrap(), 0);
        assert_eq!(dec.remaining(), 4);
    }

    #[test]
    fn test_bad_width_rejected() {
        let bytes = [0u8; 16];
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(dec.get_int(3), Err(WireError::BadWidth(3))));
    }
}
