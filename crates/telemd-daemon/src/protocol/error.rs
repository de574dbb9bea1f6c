//! Error types for the ingestion protocol layer.
//!
//! # Error Hierarchy
//!
//! - [`TerminationReason`]: why one client connection was torn down. These
//!   never escape the per-client handler.
//! - [`FatalError`]: conditions the daemon cannot continue from (allocation
//!   failure, a broken multiplexer). These propagate to `main`.
//! - [`ProtocolError`]: listening socket setup.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use telemd_core::{DecodeError, StagingError};
use thiserror::Error;

/// Why a client connection was terminated.
#[derive(Debug, Error)]
pub enum TerminationReason {
    /// The peer closed the connection before a full record arrived.
    #[error("peer closed connection after {received} of {expected} bytes")]
    PeerClosed {
        /// Bytes received so far, prefix included.
        received: usize,
        /// Bytes expected, prefix included; 4 while the prefix is incomplete.
        expected: usize,
    },

    /// Reading from the socket failed.
    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),

    /// The size prefix is outside the accepted range.
    #[error("rejected record size: {0}")]
    RecordSize(DecodeError),

    /// The record was received in full but is malformed.
    #[error("malformed record: {0}")]
    Decode(DecodeError),

    /// The record could not be staged.
    #[error("staging failed: {0}")]
    Staging(#[from] StagingError),

    /// The client made no progress within the idle timeout.
    #[error("client idle for {idle_secs}s")]
    IdleTimeout {
        /// Seconds since the last received byte.
        idle_secs: u64,
    },

    /// The connection table was full when the client connected.
    #[error("connection limit of {max} reached")]
    AtCapacity {
        /// Configured connection limit.
        max: usize,
    },
}

/// Conditions that stop the daemon.
#[derive(Debug, Error)]
pub enum FatalError {
    /// An allocation the daemon cannot run without failed.
    #[error("out of memory allocating {what} ({size} bytes)")]
    OutOfMemory {
        /// What was being allocated.
        what: &'static str,
        /// Requested size in bytes or elements.
        size: usize,
    },

    /// `poll(2)` failed with something other than `EINTR`.
    #[error("poll failed: {0}")]
    Poll(#[source] Errno),

    /// The listening socket became unusable.
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
}

/// Errors setting up or tearing down the listening socket.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error with path context.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The socket path exists and is something other than a socket.
    #[error("path {path} exists but is not a socket")]
    NotASocket {
        /// Offending path.
        path: PathBuf,
    },

    /// The socket directory is a symlink.
    #[error("refusing to use symlink {path} as socket directory")]
    SymlinkDirectory {
        /// Offending path.
        path: PathBuf,
    },
}

/// Result type for socket setup.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_messages() {
        let reason = TerminationReason::PeerClosed {
            received: 4,
            expected: 57,
        };
        assert_eq!(
            reason.to_string(),
            "peer closed connection after 4 of 57 bytes"
        );

        let reason = TerminationReason::RecordSize(DecodeError::RecordSizeOutOfBounds {
            size: 3,
            max: 100,
        });
        assert!(reason.to_string().starts_with("rejected record size"));
    }

    #[test]
    fn test_fatal_messages() {
        let err = FatalError::OutOfMemory {
            what: "receive buffer",
            size: 1024,
        };
        assert_eq!(
            err.to_string(),
            "out of memory allocating receive buffer (1024 bytes)"
        );
        assert_eq!(
            FatalError::Poll(Errno::EBADF).to_string(),
            format!("poll failed: {}", Errno::EBADF)
        );
    }
}
