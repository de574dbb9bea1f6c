//! Record framing receiver.
//!
//! Each readiness event on a client socket advances that client's record by
//! as many bytes as are available, without ever blocking:
//!
//! ```text
//! fresh ──peek──> prefix (0..4 bytes) ──size ok──> body (0..size-4) ──full──> decode + stage
//!   │                  │                  │                 │
//!   └── EOF/error ─────┴── EOF/error ─────┴── out of range ─┴── EOF/error ──> terminated
//! ```
//!
//! # Security Considerations
//!
//! - The declared size is validated against the record limits BEFORE the
//!   body buffer is allocated, so a hostile prefix cannot trigger a large
//!   allocation.
//! - An out-of-range size is a hard rejection. The framing of the stream
//!   cannot be trusted afterward, so the connection is dropped.
//! - A connection carries exactly one record.

use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv};
use telemd_core::RecordLimits;
use telemd_core::record::RECORD_SIZE_LEN;
use tracing::{debug, warn};

use super::connection::Client;
use super::error::{FatalError, TerminationReason};
use crate::handlers::decode_and_stage;
use crate::state::DaemonContext;

/// Result of one receive step.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// The record was received, decoded and staged at this path.
    Processed(PathBuf),
    /// More bytes are required; keep the client registered.
    NeedsMore,
    /// The connection must be dropped.
    Terminated(TerminationReason),
}

impl ReceiveOutcome {
    /// Whether the client should be removed after this outcome.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        !matches!(self, Self::NeedsMore)
    }
}

/// Progress of the framing layer alone, before any decoding.
#[derive(Debug)]
pub enum Fill {
    /// The full record body (everything after the size prefix).
    Complete(Vec<u8>),
    /// Waiting for more bytes.
    Pending,
    /// The connection must be dropped.
    Closed(TerminationReason),
}

/// Advance `client` and, once its record is complete, decode and stage it.
///
/// # Errors
///
/// Returns [`FatalError::OutOfMemory`] if the body buffer cannot be
/// allocated. Every other failure is reported as
/// [`ReceiveOutcome::Terminated`].
pub fn receive(client: &mut Client, ctx: &DaemonContext) -> Result<ReceiveOutcome, FatalError> {
    let record = match fill(client, ctx.limits())? {
        Fill::Complete(record) => record,
        Fill::Pending => return Ok(ReceiveOutcome::NeedsMore),
        Fill::Closed(reason) => return Ok(ReceiveOutcome::Terminated(reason)),
    };

    debug!(
        client = %client.id(),
        size = record.len() + RECORD_SIZE_LEN,
        "Record received"
    );

    // One record per connection: the client is terminated either way.
    Ok(match decode_and_stage(ctx, &record) {
        Ok(path) => ReceiveOutcome::Processed(path),
        Err(reason) => ReceiveOutcome::Terminated(reason),
    })
}

/// Read whatever is available for `client` without blocking.
///
/// # Errors
///
/// Returns [`FatalError::OutOfMemory`] if the body buffer cannot be
/// allocated.
pub fn fill(client: &mut Client, limits: &RecordLimits) -> Result<Fill, FatalError> {
    if client.is_fresh() {
        if let Some(outcome) = peek_for_data(client) {
            return Ok(outcome);
        }
    }

    while !client.has_prefix() {
        let (stream, target) = client.prefix_target();
        match read_step(stream, target) {
            Step::Read(n) => client.advance_prefix(n),
            Step::WouldBlock => return Ok(Fill::Pending),
            Step::Closed => return Ok(closed(client)),
            Step::Failed(e) => return Ok(Fill::Closed(TerminationReason::Io(e))),
        }
    }

    if !client.has_body() {
        let Some(size) = client.declared_size() else {
            return Ok(Fill::Pending);
        };
        let len = match limits.check_record_size(size) {
            Ok(len) => len,
            Err(e) => {
                warn!(client = %client.id(), size, error = %e, "Rejecting record size");
                return Ok(Fill::Closed(TerminationReason::RecordSize(e)));
            },
        };
        client.begin_body(alloc_zeroed(len)?);
    }

    loop {
        if let Some(record) = client.take_body() {
            return Ok(Fill::Complete(record));
        }
        let Some((stream, target)) = client.body_target() else {
            return Ok(Fill::Pending);
        };
        match read_step(stream, target) {
            Step::Read(n) => client.advance_body(n),
            Step::WouldBlock => return Ok(Fill::Pending),
            Step::Closed => return Ok(closed(client)),
            Step::Failed(e) => return Ok(Fill::Closed(TerminationReason::Io(e))),
        }
    }
}

/// Peek at the prefix of a fresh client without consuming it.
///
/// Returns `None` when data is available and reading should proceed.
fn peek_for_data(client: &Client) -> Option<Fill> {
    let mut probe = [0u8; RECORD_SIZE_LEN];
    let flags = MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT;
    match recv(client.stream().as_raw_fd(), &mut probe, flags) {
        Ok(0) => Some(closed(client)),
        Ok(_) => None,
        Err(Errno::EAGAIN | Errno::EINTR) => Some(Fill::Pending),
        Err(e) => Some(Fill::Closed(TerminationReason::Io(e.into()))),
    }
}

fn closed(client: &Client) -> Fill {
    Fill::Closed(TerminationReason::PeerClosed {
        received: client.received(),
        expected: client.expected(),
    })
}

/// Allocate a zeroed body buffer of exactly `len` bytes.
fn alloc_zeroed(len: usize) -> Result<Vec<u8>, FatalError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| FatalError::OutOfMemory {
            what: "receive buffer",
            size: len,
        })?;
    buf.resize(len, 0);
    Ok(buf)
}

enum Step {
    Read(usize),
    WouldBlock,
    Closed,
    Failed(io::Error),
}

/// One non-blocking read, retried on `EINTR`.
fn read_step(mut stream: &UnixStream, buf: &mut [u8]) -> Step {
    loop {
        match stream.read(buf) {
            Ok(0) => return Step::Closed,
            Ok(n) => return Step::Read(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::WouldBlock,
            Err(e) => return Step::Failed(e),
        }
    }
}
