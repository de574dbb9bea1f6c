//! Per-client receive state and the table that owns it.
//!
//! A [`Client`] tracks how far one connection has progressed through its
//! single record: the 4-byte size prefix is accumulated first, then a body
//! buffer of exactly `record_size - 4` bytes is allocated and filled. The
//! [`ConnectionTable`] owns every client; dropping a client frees its buffer
//! and closes its socket.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use telemd_core::record::RECORD_SIZE_LEN;

use super::error::FatalError;

/// Identifies one accepted connection for its whole lifetime.
///
/// Identifiers are monotonic and never reused, so a stale poll token cannot
/// alias a newer client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// One connected reporter.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    stream: UnixStream,
    prefix: [u8; RECORD_SIZE_LEN],
    prefix_len: usize,
    buf: Option<Vec<u8>>,
    offset: usize,
    record_size: usize,
    last_activity: Instant,
}

impl Client {
    fn new(id: ClientId, stream: UnixStream) -> Self {
        Self {
            id,
            stream,
            prefix: [0; RECORD_SIZE_LEN],
            prefix_len: 0,
            buf: None,
            offset: 0,
            record_size: 0,
            last_activity: Instant::now(),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// The client socket.
    #[must_use]
    pub const fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// True until the first byte of the record has been consumed.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.prefix_len == 0 && self.buf.is_none()
    }

    /// True once the full size prefix has been read.
    #[must_use]
    pub const fn has_prefix(&self) -> bool {
        self.prefix_len == RECORD_SIZE_LEN
    }

    /// Socket and unfilled tail of the prefix accumulator, borrowed together.
    pub(crate) fn prefix_target(&mut self) -> (&UnixStream, &mut [u8]) {
        (&self.stream, &mut self.prefix[self.prefix_len..])
    }

    /// Record `n` more prefix bytes as read.
    pub(crate) fn advance_prefix(&mut self, n: usize) {
        self.prefix_len = (self.prefix_len + n).min(RECORD_SIZE_LEN);
        self.touch();
    }

    /// Declared `record_size`, once the prefix is complete.
    #[must_use]
    pub fn declared_size(&self) -> Option<u32> {
        self.has_prefix().then(|| u32::from_ne_bytes(self.prefix))
    }

    /// Install the zeroed body buffer for a validated record size.
    pub(crate) fn begin_body(&mut self, buf: Vec<u8>) {
        self.record_size = buf.len() + RECORD_SIZE_LEN;
        self.offset = 0;
        self.buf = Some(buf);
    }

    /// Whether a body buffer is allocated.
    #[must_use]
    pub const fn has_body(&self) -> bool {
        self.buf.is_some()
    }

    /// Socket and unfilled part of the body buffer, borrowed together.
    pub(crate) fn body_target(&mut self) -> Option<(&UnixStream, &mut [u8])> {
        let offset = self.offset;
        let buf = self.buf.as_mut()?;
        Some((&self.stream, &mut buf[offset..]))
    }

    /// Record `n` more body bytes as read.
    pub(crate) fn advance_body(&mut self, n: usize) {
        self.offset += n;
        self.touch();
    }

    /// True when the body buffer is full.
    #[must_use]
    pub fn body_complete(&self) -> bool {
        self.buf.as_ref().is_some_and(|buf| self.offset == buf.len())
    }

    /// Take the completed body, leaving the client without a buffer.
    pub(crate) fn take_body(&mut self) -> Option<Vec<u8>> {
        if self.body_complete() {
            self.buf.take()
        } else {
            None
        }
    }

    /// Bytes received so far, prefix included.
    #[must_use]
    pub const fn received(&self) -> usize {
        if self.buf.is_some() {
            RECORD_SIZE_LEN + self.offset
        } else {
            self.prefix_len
        }
    }

    /// Bytes expected in total; the prefix length until it is complete.
    #[must_use]
    pub const fn expected(&self) -> usize {
        if self.buf.is_some() {
            self.record_size
        } else {
            RECORD_SIZE_LEN
        }
    }

    /// Mark the client as having made progress.
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last received byte, or since accept.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

impl AsFd for Client {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Owns every live client.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    clients: HashMap<ClientId, Client>,
    next_id: u64,
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly accepted stream.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::OutOfMemory`] if the table cannot grow.
    pub fn insert(&mut self, stream: UnixStream) -> Result<ClientId, FatalError> {
        self.clients
            .try_reserve(1)
            .map_err(|_| FatalError::OutOfMemory {
                what: "connection table",
                size: self.clients.len() + 1,
            })?;

        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(id, Client::new(id, stream));
        Ok(id)
    }

    /// Remove a client, closing its socket and freeing its buffer.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// Look up a client.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Look up a client mutably.
    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Number of live clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True when no clients remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Iterate over live clients in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }
}
