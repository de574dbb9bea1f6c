//! Record decoder.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use tracing::debug;

use super::cursor::RecordCursor;
use super::headers::{HeaderRegistry, HeaderSet, split_header_block};
use super::{CFG_MAGIC, CFG_PREFIX, CFG_PREFIX_LENGTH, DecodeError, PATH_MAX};

/// A record decomposed into config tag, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Config file path from the optional config prefix.
    pub config_path: Option<PathBuf>,
    /// Validated headers in registry order.
    pub headers: HeaderSet,
    /// Opaque payload.
    pub body: Vec<u8>,
}

impl DecodedRecord {
    /// The staged config line, `_cfg_file=<path>`, if the record carried one.
    #[must_use]
    pub fn config_line(&self) -> Option<Vec<u8>> {
        self.config_path.as_deref().map(|path| {
            let path = path.as_os_str().as_bytes();
            let mut line = Vec::with_capacity(CFG_PREFIX.len() + path.len());
            line.extend_from_slice(CFG_PREFIX);
            line.extend_from_slice(path);
            line
        })
    }
}

/// Decode a fully received record.
///
/// `record` is everything after the 4-byte size prefix. The function is pure:
/// it neither mutates the buffer nor touches the identity header, which the
/// caller rewrites afterwards with [`HeaderSet::rewrite_identity`].
///
/// # Errors
///
/// Returns a [`DecodeError`] if the config path is unterminated or too long,
/// the header block does not fit the record, or the header lines do not match
/// the registry. Header values and the config path are opaque bytes and never
/// cause a rejection. Nothing is partially returned.
pub fn decode(record: &[u8], registry: &HeaderRegistry) -> Result<DecodedRecord, DecodeError> {
    let mut cursor = RecordCursor::new(record);

    let config_path = if cursor.peek(CFG_MAGIC.len()) == Some(&CFG_MAGIC[..]) {
        cursor.take("config prefix", CFG_PREFIX_LENGTH)?;
        let raw = cursor.take_nul_terminated(PATH_MAX)?;
        Some(PathBuf::from(OsStr::from_bytes(raw)))
    } else {
        None
    };
    let cfg_info_size = cursor.position();

    let header_size = cursor.read_u32("header size")?;
    // A header size that does not fit is rejected by the cursor before any
    // message size could underflow.
    let header_len = usize::try_from(header_size).map_err(|_| DecodeError::Truncated {
        field: "header block",
        wanted: usize::MAX,
        remaining: cursor.remaining(),
    })?;
    let block = cursor.take("header block", header_len)?;
    let message_size = record.len() - cfg_info_size - header_len;

    debug!(
        record_size = record.len(),
        cfg_info_size, header_size, message_size, "Decoding record"
    );

    let lines = split_header_block(until_nul(block))?;
    registry.validate(&lines)?;
    let headers = HeaderSet::from_validated(&lines, registry);

    let body = until_nul(cursor.rest()).to_vec();

    Ok(DecodedRecord {
        config_path,
        headers,
        body,
    })
}

/// Clients NUL-terminate text fields; everything from the first NUL on is
/// padding.
fn until_nul(bytes: &[u8]) -> &[u8] {
    bytes
        .iter()
        .position(|&b| b == 0)
        .map_or(bytes, |end| &bytes[..end])
}
