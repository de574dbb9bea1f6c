//! Machine identity management.
//!
//! The collector, not the reporting client, is authoritative for host
//! identity. Every staged record carries the identifier managed here.
//!
//! # Lifecycle
//!
//! ```text
//!            maintain()                    age > expiry
//!  Absent ─────────────► Valid ───────────────────────► Expired
//!                          ▲                               │
//!                          └────────── maintain() ─────────┘
//! ```
//!
//! The identifier lives in a small text file whose modification time drives
//! expiry. [`MachineIdentity::maintain`] regenerates it when it is missing or
//! older than the configured expiry.
//!
//! An optional override file, read once at startup, permanently supersedes
//! the persisted identifier for the daemon's lifetime. The persisted file
//! keeps rotating underneath; its value is simply not used.
//!
//! # Degraded Operation
//!
//! Failing to read the identity file never blocks the record pipeline: the
//! placeholder [`PLACEHOLDER_MACHINE_ID`] is stamped instead and the failure
//! is logged.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::IdentityConfig;

/// Longest identifier accepted from the identity or override file.
pub const MACHINE_ID_LEN: usize = 32;

/// Identifier stamped when no identity can be read.
pub const PLACEHOLDER_MACHINE_ID: &str = "0";

/// Default lifetime of a generated identifier (3 days).
pub const DEFAULT_MACHINE_ID_EXPIRY: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Default location of the persisted identifier.
pub const DEFAULT_MACHINE_ID_FILE: &str = "/var/lib/telemetry/machine_id";

/// Default location of the static override.
pub const DEFAULT_OVERRIDE_FILE: &str = "/etc/telemetrics/opt-in-static-machine-id";

/// State of the persisted identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// No identity file exists.
    Absent,
    /// The identity file exists and is younger than the expiry.
    Valid,
    /// The identity file is older than the expiry.
    Expired,
}

impl IdentityState {
    /// Returns `true` if a new identifier must be generated.
    #[must_use]
    pub const fn needs_rotation(self) -> bool {
        matches!(self, Self::Absent | Self::Expired)
    }
}

/// Identity file errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The identity file could not be inspected.
    #[error("failed to stat machine id file {path}: {source}")]
    Stat {
        /// Identity file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The identity file could not be read.
    #[error("failed to read machine id file {path}: {source}")]
    Read {
        /// Identity file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A new identifier could not be persisted.
    #[error("failed to write machine id file {path}: {source}")]
    Write {
        /// Identity file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Persistent, expiring machine identifier with an optional static override.
#[derive(Debug, Clone)]
pub struct MachineIdentity {
    id_file: PathBuf,
    expiry: Duration,
    override_id: Option<String>,
}

impl MachineIdentity {
    /// Manage the identifier stored at `id_file`, without an override.
    #[must_use]
    pub fn new(id_file: impl Into<PathBuf>, expiry: Duration) -> Self {
        Self {
            id_file: id_file.into(),
            expiry,
            override_id: None,
        }
    }

    /// Build from configuration, reading the override file once.
    #[must_use]
    pub fn load(config: &IdentityConfig) -> Self {
        let override_id = read_override(&config.override_file);
        if let Some(id) = &override_id {
            info!(
                override_file = %config.override_file.display(),
                machine_id = %id,
                "Using static machine id override"
            );
        }
        Self::new(&config.machine_id_file, config.expiry()).with_override(override_id)
    }

    /// Set or clear the override.
    #[must_use]
    pub fn with_override(mut self, override_id: Option<String>) -> Self {
        self.override_id = override_id;
        self
    }

    /// The active override, if any.
    #[must_use]
    pub fn override_id(&self) -> Option<&str> {
        self.override_id.as_deref()
    }

    /// Path of the persisted identifier.
    #[must_use]
    pub fn id_file(&self) -> &Path {
        &self.id_file
    }

    /// Configured expiry.
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Inspect the persisted identifier as of now.
    pub fn state(&self) -> Result<IdentityState, IdentityError> {
        self.state_at(SystemTime::now())
    }

    /// Inspect the persisted identifier as of `now`.
    pub fn state_at(&self, now: SystemTime) -> Result<IdentityState, IdentityError> {
        let metadata = match fs::metadata(&self.id_file) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IdentityState::Absent),
            Err(source) => {
                return Err(IdentityError::Stat {
                    path: self.id_file.clone(),
                    source,
                });
            },
        };

        let modified = metadata.modified().map_err(|source| IdentityError::Stat {
            path: self.id_file.clone(),
            source,
        })?;

        // A modification time in the future counts as fresh.
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > self.expiry {
            Ok(IdentityState::Expired)
        } else {
            Ok(IdentityState::Valid)
        }
    }

    /// Regenerate the persisted identifier if it is absent or expired.
    ///
    /// Returns `true` if a new identifier was written.
    pub fn maintain(&self) -> Result<bool, IdentityError> {
        let state = self.state()?;
        if !state.needs_rotation() {
            return Ok(false);
        }

        if state == IdentityState::Absent {
            info!(path = %self.id_file.display(), "Machine id file does not exist");
        } else {
            info!(path = %self.id_file.display(), "Machine id file has expired");
        }
        self.rotate()?;
        Ok(true)
    }

    /// Generate and persist a fresh identifier unconditionally.
    pub fn rotate(&self) -> Result<String, IdentityError> {
        let id = generate_machine_id();
        write_atomic(&self.id_file, id.as_bytes()).map_err(|source| IdentityError::Write {
            path: self.id_file.clone(),
            source,
        })?;
        Ok(id)
    }

    /// Read the persisted identifier.
    ///
    /// Returns the first whitespace-delimited token, capped at
    /// [`MACHINE_ID_LEN`] characters, or `None` if the file holds none.
    pub fn read_persisted(&self) -> Result<Option<String>, IdentityError> {
        let content = fs::read_to_string(&self.id_file).map_err(|source| IdentityError::Read {
            path: self.id_file.clone(),
            source,
        })?;
        Ok(content
            .split_whitespace()
            .next()
            .map(|token| token.chars().take(MACHINE_ID_LEN).collect()))
    }

    /// The identifier to stamp into records right now.
    ///
    /// Override if configured, else the persisted identifier, else
    /// [`PLACEHOLDER_MACHINE_ID`].
    #[must_use]
    pub fn current(&self) -> String {
        if let Some(id) = &self.override_id {
            return id.clone();
        }

        match self.read_persisted() {
            Ok(Some(id)) => id,
            Ok(None) => {
                error!(path = %self.id_file.display(), "Machine id file is empty");
                PLACEHOLDER_MACHINE_ID.to_string()
            },
            Err(e) => {
                error!("Could not read machine id: {e}");
                PLACEHOLDER_MACHINE_ID.to_string()
            },
        }
    }
}

/// Generate a random 32-character hexadecimal identifier.
#[must_use]
pub fn generate_machine_id() -> String {
    hex::encode(rand::random::<[u8; MACHINE_ID_LEN / 2]>())
}

/// Read the static override from `path`.
///
/// The override is the file's first line, read from at most
/// [`MACHINE_ID_LEN`] bytes. A missing, unreadable or empty file yields
/// `None`; only errors other than "not found" are logged.
#[must_use]
pub fn read_override(path: &Path) -> Option<String> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "Unable to open static machine id file: {e}");
            return None;
        },
    };

    let mut raw = Vec::with_capacity(MACHINE_ID_LEN);
    if let Err(e) = file.take(MACHINE_ID_LEN as u64).read_to_end(&mut raw) {
        warn!(path = %path.display(), "Error while reading static machine id file: {e}");
        return None;
    }

    let line = raw.split(|&b| b == b'\n').next().unwrap_or_default();
    if line.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(line).into_owned())
}

/// Write `bytes` to `path` via a temp file in the same directory and a
/// rename, so readers never observe a partially written identifier.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
    }

    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
