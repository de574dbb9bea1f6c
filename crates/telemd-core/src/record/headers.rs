//! Header registry and header block parsing.
//!
//! A record's header block is a strict schema, not a key-value bag: it must
//! carry exactly one `Name: value` line per registered header, in registry
//! order. Parsing happens in two pure steps. [`split_header_block`] turns the
//! block into ordered [`HeaderLine`]s, then [`HeaderRegistry::validate`]
//! checks the sequence against the registry.

use std::fmt;

use thiserror::Error;

use super::DecodeError;

/// Name of the header that carries the machine identity.
pub const MACHINE_ID_HEADER: &str = "machine_id";

/// Headers every record carries, in wire order.
pub const DEFAULT_HEADER_NAMES: [&str; 15] = [
    "record_format_version",
    "classification",
    "severity",
    MACHINE_ID_HEADER,
    "creation_timestamp",
    "arch",
    "host_type",
    "build",
    "kernel_version",
    "payload_format_version",
    "system_name",
    "board_name",
    "cpu_model",
    "bios_version",
    "event_id",
];

/// Errors building a [`HeaderRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has no headers.
    #[error("header registry is empty")]
    Empty,

    /// The identity header is not among the registered names.
    #[error("identity header {0:?} is not registered")]
    MissingIdentityHeader(String),

    /// A name appears more than once.
    #[error("header {0:?} is registered twice")]
    Duplicate(String),

    /// A name is empty or contains a character that cannot appear in a
    /// header line.
    #[error("header name {0:?} is invalid")]
    InvalidName(String),
}

/// Fixed, ordered set of header names a record must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRegistry {
    names: Vec<String>,
    identity_index: usize,
}

impl HeaderRegistry {
    /// Create a registry from ordered names and the name of the identity
    /// header.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty, holds duplicates or invalid
    /// names, or lacks `identity_header`.
    pub fn new<I, S>(names: I, identity_header: &str) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(RegistryError::Empty);
        }

        for (i, name) in names.iter().enumerate() {
            if name.is_empty() || name.contains([':', '\n', '\0']) {
                return Err(RegistryError::InvalidName(name.clone()));
            }
            if names[..i].contains(name) {
                return Err(RegistryError::Duplicate(name.clone()));
            }
        }

        let identity_index = names
            .iter()
            .position(|n| n == identity_header)
            .ok_or_else(|| RegistryError::MissingIdentityHeader(identity_header.to_string()))?;

        Ok(Self {
            names,
            identity_index,
        })
    }

    /// Number of registered headers (`NUM_HEADERS`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always `false`; construction rejects empty registries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Registered names in wire order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Position of the identity header.
    #[must_use]
    pub const fn identity_index(&self) -> usize {
        self.identity_index
    }

    /// Name of the identity header.
    #[must_use]
    pub fn identity_header(&self) -> &str {
        &self.names[self.identity_index]
    }

    /// Check parsed header lines against the registry.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::HeaderCount`] if the line count differs from the
    ///   registry size
    /// - [`DecodeError::HeaderMismatch`] for the first line whose name differs
    ///   from the registered name at its position
    pub fn validate(&self, lines: &[HeaderLine<'_>]) -> Result<(), DecodeError> {
        if lines.len() != self.names.len() {
            return Err(DecodeError::HeaderCount {
                expected: self.names.len(),
                found: lines.len(),
            });
        }

        for (position, (line, expected)) in lines.iter().zip(&self.names).enumerate() {
            if line.name != expected.as_bytes() {
                return Err(DecodeError::HeaderMismatch {
                    position,
                    expected: expected.clone(),
                    found: String::from_utf8_lossy(line.name).into_owned(),
                });
            }
        }

        Ok(())
    }
}

impl Default for HeaderRegistry {
    fn default() -> Self {
        Self {
            names: DEFAULT_HEADER_NAMES.iter().map(ToString::to_string).collect(),
            identity_index: 3,
        }
    }
}

/// One `Name: value` line borrowed from a header block.
///
/// Lines are kept as bytes: only the name is checked against the registry,
/// values are staged exactly as the client sent them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLine<'a> {
    /// Bytes before the first colon.
    pub name: &'a [u8],
    /// Bytes after the colon and its single separating space.
    pub value: &'a [u8],
    /// The full line as received.
    pub raw: &'a [u8],
}

impl<'a> HeaderLine<'a> {
    /// Parse a single line.
    ///
    /// Returns `None` if the line has no colon or an empty name.
    #[must_use]
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        let colon = raw.iter().position(|&b| b == b':')?;
        if colon == 0 {
            return None;
        }
        let rest = &raw[colon + 1..];
        Some(Self {
            name: &raw[..colon],
            value: rest.strip_prefix(b" ").unwrap_or(rest),
            raw,
        })
    }
}

/// Split a header block into ordered lines.
///
/// Empty lines are skipped, so a trailing newline or doubled separators do
/// not count as headers. The block itself is never modified.
///
/// # Errors
///
/// Returns [`DecodeError::MalformedHeader`] for the first non-empty line that
/// is not of the form `Name: value`.
pub fn split_header_block(block: &[u8]) -> Result<Vec<HeaderLine<'_>>, DecodeError> {
    block
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(position, line)| {
            HeaderLine::parse(line).ok_or(DecodeError::MalformedHeader { position })
        })
        .collect()
}

/// An owned header line ready to be staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    line: Vec<u8>,
}

impl Header {
    /// Build a header rendered as `"<name>: <value>"`.
    #[must_use]
    pub fn new(name: &str, value: impl AsRef<[u8]>) -> Self {
        let value = value.as_ref();
        let mut line = Vec::with_capacity(name.len() + 2 + value.len());
        line.extend_from_slice(name.as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value);
        Self {
            name: name.to_string(),
            line,
        }
    }

    /// Header name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Header value.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        let rest = &self.line[self.name.len() + 1..];
        rest.strip_prefix(b" ").unwrap_or(rest)
    }

    /// The line exactly as it will be staged.
    #[must_use]
    pub fn line(&self) -> &[u8] {
        &self.line
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.line))
    }
}

/// Validated headers of one record, in registry order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<Header>,
    identity_index: usize,
}

impl HeaderSet {
    /// Own lines that passed [`HeaderRegistry::validate`]. Each wire name
    /// equals the registered name at its position.
    pub(crate) fn from_validated(lines: &[HeaderLine<'_>], registry: &HeaderRegistry) -> Self {
        Self {
            headers: lines
                .iter()
                .zip(registry.names())
                .map(|(line, name)| Header {
                    name: name.to_string(),
                    line: line.raw.to_vec(),
                })
                .collect(),
            identity_index: registry.identity_index(),
        }
    }

    /// Replace the identity header's value, discarding whatever the client
    /// sent.
    pub fn rewrite_identity(&mut self, machine_id: &str) {
        let header = &mut self.headers[self.identity_index];
        *header = Header::new(header.name(), machine_id);
    }

    /// The identity header.
    #[must_use]
    pub fn identity(&self) -> &Header {
        &self.headers[self.identity_index]
    }

    /// Look up a header by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.name() == name)
    }

    /// Headers in registry order.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.headers.iter()
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl<'a> IntoIterator for &'a HeaderSet {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
