//! Telemetry record wire format.
//!
//! A record is a self-contained byte sequence sent once per connection by an
//! on-host reporting client. It is framed by a 4-byte size prefix that the
//! daemon's receiver consumes before the rest of the record is buffered.
//!
//! # Wire Format
//!
//! ```text
//! +---------------------------+
//! | record_size (u32)         |  total length including this field
//! +---------------------------+
//! | "_cfg_file=" + path + NUL |  optional, detected by the "_cfg" magic
//! +---------------------------+
//! | header_size (u32)         |
//! +---------------------------+
//! | header block              |  NUM_HEADERS "Name: value" lines
//! +---------------------------+
//! | body                      |  opaque, NUL terminated by clients
//! +---------------------------+
//! ```
//!
//! All integers are in native byte order. The protocol is local IPC only and
//! client and daemon always share a host, so no endianness tag is carried.
//!
//! # Security Considerations
//!
//! - The record size is validated BEFORE any body buffer is allocated
//! - Every field is read through [`RecordCursor`], which refuses to cross the
//!   end of the record
//! - The header block is parsed without mutating the received buffer

pub mod cursor;
mod decoder;
mod encoder;
pub mod headers;

use thiserror::Error;

pub use cursor::RecordCursor;
pub use decoder::{DecodedRecord, decode};
pub use encoder::{EncodeError, RecordBuilder};
pub use headers::{
    DEFAULT_HEADER_NAMES, Header, HeaderLine, HeaderRegistry, HeaderSet, MACHINE_ID_HEADER,
    RegistryError,
};

/// Length of the record size prefix in bytes.
pub const RECORD_SIZE_LEN: usize = 4;

/// Length of the header size field in bytes.
pub const HEADER_SIZE_LEN: usize = 4;

/// Config prefix slot that precedes an optional config file path.
pub const CFG_PREFIX: &[u8] = b"_cfg_file=";

/// Width of the config prefix slot in bytes.
pub const CFG_PREFIX_LENGTH: usize = CFG_PREFIX.len();

/// Magic value marking the presence of a config prefix: the first four bytes
/// of [`CFG_PREFIX`].
pub const CFG_MAGIC: [u8; 4] = [b'_', b'c', b'f', b'g'];

/// Longest config file path accepted, excluding the NUL terminator.
pub const PATH_MAX: usize = 4096;

/// Default upper bound on the payload carried by one record.
pub const DEFAULT_MAX_PAYLOAD_LENGTH: usize = 8192;

/// Widest header line assumed when bounding the header block.
pub const MAX_HEADER_LINE_LEN: usize = 80;

/// Size bounds shared by the receiver and the decoder.
///
/// The worst case record carries both size fields, a full config prefix
/// slot, a path of [`PATH_MAX`] bytes, a maximal payload, and one
/// [`MAX_HEADER_LINE_LEN`] line per registered header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    num_headers: usize,
    max_payload_length: usize,
}

impl RecordLimits {
    /// Create limits for a registry of `num_headers` headers.
    #[must_use]
    pub const fn new(num_headers: usize, max_payload_length: usize) -> Self {
        Self {
            num_headers,
            max_payload_length,
        }
    }

    /// Limits derived from a header registry.
    #[must_use]
    pub fn for_registry(registry: &HeaderRegistry, max_payload_length: usize) -> Self {
        Self::new(registry.len(), max_payload_length)
    }

    /// Number of headers every record must carry.
    #[must_use]
    pub const fn num_headers(&self) -> usize {
        self.num_headers
    }

    /// Largest accepted payload length.
    #[must_use]
    pub const fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    /// Largest accepted `record_size`, prefix included.
    #[must_use]
    pub const fn max_record_size(&self) -> usize {
        RECORD_SIZE_LEN
            + HEADER_SIZE_LEN
            + CFG_PREFIX_LENGTH
            + PATH_MAX
            + self.max_payload_length
            + self.num_headers * MAX_HEADER_LINE_LEN
    }

    /// Validate a declared record size and return the length of the body
    /// buffer that must be allocated for it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::RecordSizeOutOfBounds`] unless
    /// `RECORD_SIZE_LEN < size <= max_record_size()`.
    pub fn check_record_size(&self, size: u32) -> Result<usize, DecodeError> {
        let max = self.max_record_size();
        match usize::try_from(size) {
            Ok(size) if size > RECORD_SIZE_LEN && size <= max => Ok(size - RECORD_SIZE_LEN),
            _ => Err(DecodeError::RecordSizeOutOfBounds { size, max }),
        }
    }
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_NAMES.len(), DEFAULT_MAX_PAYLOAD_LENGTH)
    }
}

/// Errors raised while validating or decomposing a record.
///
/// Every variant describes a malformed or adversarial record. None of them
/// is fatal to the daemon: the offending connection is dropped and nothing is
/// staged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The size prefix lies outside the accepted bounds.
    #[error("record size {size} outside accepted range (4, {max}]")]
    RecordSizeOutOfBounds {
        /// Declared record size.
        size: u32,
        /// Largest accepted record size.
        max: usize,
    },

    /// A field would extend past the end of the record.
    #[error("truncated record: {field} needs {wanted} bytes, {remaining} remain")]
    Truncated {
        /// Field being read.
        field: &'static str,
        /// Bytes the field requires.
        wanted: usize,
        /// Bytes left in the record.
        remaining: usize,
    },

    /// The config path has no NUL terminator inside the record.
    #[error("config path is not NUL terminated")]
    UnterminatedConfigPath,

    /// The config path exceeds [`PATH_MAX`].
    #[error("config path exceeds {max} bytes")]
    ConfigPathTooLong {
        /// Longest accepted path.
        max: usize,
    },

    /// A header line is not of the form `Name: value`.
    #[error("header line {position} is malformed")]
    MalformedHeader {
        /// Zero-based position of the line.
        position: usize,
    },

    /// The header block does not carry exactly one line per registered
    /// header.
    #[error("expected {expected} headers, found {found}")]
    HeaderCount {
        /// Registry size.
        expected: usize,
        /// Lines present in the block.
        found: usize,
    },

    /// A header name does not match the registry at its position.
    #[error("header {position} is {found:?}, expected {expected:?}")]
    HeaderMismatch {
        /// Zero-based position of the header.
        position: usize,
        /// Name the registry requires at this position.
        expected: String,
        /// Name found on the wire.
        found: String,
    },
}
