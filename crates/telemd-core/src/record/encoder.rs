//! Client-side record encoding.

use thiserror::Error;

use super::headers::Header;
use super::{CFG_PREFIX, HEADER_SIZE_LEN, RECORD_SIZE_LEN};

/// Errors encoding a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The record does not fit the 32-bit size prefix.
    #[error("record of {0} bytes does not fit a 32-bit size prefix")]
    TooLarge(usize),

    /// A config path contains a NUL byte and cannot be terminated.
    #[error("config path contains a NUL byte")]
    NulInConfigPath,
}

/// Builds records in the layout the daemon's receiver expects.
///
/// # Example
///
/// ```
/// use telemd_core::record::RecordBuilder;
///
/// let bytes = RecordBuilder::new()
///     .header("Machine-ID", "ignored-value")
///     .header("App", "demo")
///     .body("payload-data")
///     .encode()
///     .unwrap();
///
/// let size = u32::from_ne_bytes(bytes[..4].try_into().unwrap());
/// assert_eq!(size as usize, bytes.len());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    config_path: Option<String>,
    headers: Vec<Vec<u8>>,
    body: Vec<u8>,
}

impl RecordBuilder {
    /// Start an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the record with a config file path.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Append a `Name: value` header line. The value is written verbatim.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.headers.push(Header::new(name, value).line().to_vec());
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body = body.as_ref().to_vec();
        self
    }

    /// Encode the record, size prefix included.
    ///
    /// # Errors
    ///
    /// Returns an error if the config path holds a NUL byte or the record
    /// exceeds `u32::MAX` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut block = Vec::new();
        for line in &self.headers {
            block.extend_from_slice(line);
            block.push(b'\n');
        }

        let cfg_len = match &self.config_path {
            Some(path) if path.contains('\0') => return Err(EncodeError::NulInConfigPath),
            Some(path) => CFG_PREFIX.len() + path.len() + 1,
            None => 0,
        };
        let total =
            RECORD_SIZE_LEN + cfg_len + HEADER_SIZE_LEN + block.len() + self.body.len() + 1;
        let record_size = u32::try_from(total).map_err(|_| EncodeError::TooLarge(total))?;
        let header_size =
            u32::try_from(block.len()).map_err(|_| EncodeError::TooLarge(total))?;

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&record_size.to_ne_bytes());
        if let Some(path) = &self.config_path {
            out.extend_from_slice(CFG_PREFIX);
            out.extend_from_slice(path.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&header_size.to_ne_bytes());
        out.extend_from_slice(&block);
        out.extend_from_slice(&self.body);
        out.push(0);

        Ok(out)
    }
}
