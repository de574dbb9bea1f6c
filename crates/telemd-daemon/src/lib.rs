//! telemd-daemon - Local telemetry ingestion daemon
//!
//! Accepts length-prefixed telemetry records from local reporters over a
//! Unix socket, stamps each with the host's machine identity and stages it in
//! the spool directory for the uploader.
//!
//! # Modules
//!
//! - [`protocol`]: Socket setup, connection table, poll multiplexer and
//!   record framing
//! - [`handlers`]: Decode, identity rewrite and staging of a received record
//! - [`server`]: The single-threaded event loop ([`server::Collector`])
//! - [`state`]: Daemon context shared by handlers

pub mod handlers;
pub mod protocol;
pub mod server;
pub mod state;

pub use server::{Collector, ExitReason};
pub use state::DaemonContext;
