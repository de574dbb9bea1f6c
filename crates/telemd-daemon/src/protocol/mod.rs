//! Local ingestion protocol.
//!
//! Reporters connect to a Unix stream socket, write exactly one record and
//! disconnect. The daemon never replies.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        decode + identity + stage         │  handlers
//! ├─────────────────────────────────────────┤
//! │            Record framing                │  receiver
//! ├─────────────────────────────────────────┤
//! │   Connection table + poll multiplexer    │  connection, poll
//! ├─────────────────────────────────────────┤
//! │            UDS transport                 │  socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`connection`]: Per-client receive state ([`Client`],
//!   [`ConnectionTable`])
//! - [`error`]: [`TerminationReason`], [`FatalError`], [`ProtocolError`]
//! - [`poll`]: Readiness multiplexer ([`Multiplexer`], [`PollSet`])
//! - [`receiver`]: Non-blocking record framing ([`receive`])
//! - [`socket`]: Listening socket setup and teardown
//!
//! # Wire Format
//!
//! ```text
//! +---------------------------+---------------------------------------+
//! | record_size (4 bytes, NE) | record_size - 4 bytes of record body  |
//! +---------------------------+---------------------------------------+
//! ```
//!
//! Integers are in native byte order: client and daemon share a host.

pub mod connection;
pub mod error;
pub mod poll;
pub mod receiver;
pub mod socket;

pub use connection::{Client, ClientId, ConnectionTable};
pub use error::{FatalError, ProtocolError, ProtocolResult, TerminationReason};
pub use poll::{Accepted, Multiplexer, PollEntry, PollSet, Token};
pub use receiver::{ReceiveOutcome, receive};
pub use socket::{bind_listener, remove_socket};
