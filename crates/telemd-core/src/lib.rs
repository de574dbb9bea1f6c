//! telemd-core - Record handling for the telemd collector
//!
//! This crate holds everything about a telemetry record that does not depend
//! on sockets: the wire format and its decoder, the header registry, the
//! machine identity that the collector stamps into every record, and the
//! staging writer that hands records over to the uploader through a spool
//! directory.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration for the daemon
//! - [`record`]: Wire format, bounds-checked decoder and record builder
//! - [`identity`]: Persistent, expiring machine identifier with override
//! - [`staging`]: Atomic publication of decoded records into the spool

pub mod config;
pub mod identity;
pub mod record;
pub mod staging;

pub use config::{CollectorConfig, ConfigError};
pub use identity::{IdentityError, IdentityState, MachineIdentity};
pub use record::{
    DecodeError, DecodedRecord, HeaderRegistry, HeaderSet, RecordBuilder, RecordLimits, decode,
};
pub use staging::{Stager, StagingError};
