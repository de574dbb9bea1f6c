//! Bounds-checked reader over a received record.
//!
//! Every read states how many bytes it needs and fails with
//! [`DecodeError::Truncated`] instead of crossing the end of the record, so a
//! length field on the wire can never steer a read out of bounds.

use super::DecodeError;

/// Forward-only cursor over an untrusted record buffer.
#[derive(Debug, Clone)]
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset from the start of the record.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Look at the next `len` bytes without consuming them.
    #[must_use]
    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        self.buf.get(self.pos..end)
    }

    /// Consume exactly `len` bytes.
    pub fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], DecodeError> {
        let bytes = self.peek(len).ok_or(DecodeError::Truncated {
            field,
            wanted: len,
            remaining: self.remaining(),
        })?;
        self.pos += len;
        Ok(bytes)
    }

    /// Consume a native-endian `u32`.
    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(field, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_ne_bytes(raw))
    }

    /// Consume a NUL-terminated string of at most `max` bytes and return it
    /// without its terminator.
    pub fn take_nul_terminated(&mut self, max: usize) -> Result<&'a [u8], DecodeError> {
        let rest = &self.buf[self.pos..];
        let window = &rest[..rest.len().min(max.saturating_add(1))];

        let Some(len) = window.iter().position(|&b| b == 0) else {
            return Err(if rest.len() > max {
                DecodeError::ConfigPathTooLong { max }
            } else {
                DecodeError::UnterminatedConfigPath
            });
        };

        self.pos += len + 1;
        Ok(&rest[..len])
    }

    /// Consume everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_within_bounds() {
        let mut cursor = RecordCursor::new(b"abcdef");
        assert_eq!(cursor.take("a", 2).unwrap(), b"ab");
        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.remaining(), 4);
        assert_eq!(cursor.rest(), b"cdef");
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_take_past_end_is_rejected_without_advancing() {
        let mut cursor = RecordCursor::new(b"abc");
        let err = cursor.take("header block", 4).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                field: "header block",
                wanted: 4,
                remaining: 3,
            }
        );
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_take_huge_length_does_not_overflow() {
        let mut cursor = RecordCursor::new(b"abc");
        cursor.take("a", 1).unwrap();
        assert!(cursor.take("huge", usize::MAX).is_err());
        assert!(cursor.peek(usize::MAX).is_none());
    }

    #[test]
    fn test_read_u32_native_endian() {
        let bytes = 0x0102_0304u32.to_ne_bytes();
        let mut cursor = RecordCursor::new(&bytes);
        assert_eq!(cursor.read_u32("n").unwrap(), 0x0102_0304);
        assert!(cursor.read_u32("n").is_err());
    }

    #[test]
    fn test_nul_terminated() {
        let mut cursor = RecordCursor::new(b"/etc/x\0rest");
        assert_eq!(cursor.take_nul_terminated(16).unwrap(), b"/etc/x");
        assert_eq!(cursor.rest(), b"rest");
    }

    #[test]
    fn test_nul_terminated_missing_terminator() {
        let mut cursor = RecordCursor::new(b"/etc/x");
        assert_eq!(
            cursor.take_nul_terminated(16),
            Err(DecodeError::UnterminatedConfigPath)
        );
    }

    #[test]
    fn test_nul_terminated_too_long() {
        let mut cursor = RecordCursor::new(b"0123456789\0");
        assert_eq!(
            cursor.take_nul_terminated(4),
            Err(DecodeError::ConfigPathTooLong { max: 4 })
        );

        // Exactly `max` bytes plus the terminator is accepted.
        let mut cursor = RecordCursor::new(b"0123\0");
        assert_eq!(cursor.take_nul_terminated(4).unwrap(), b"0123");
    }
}
