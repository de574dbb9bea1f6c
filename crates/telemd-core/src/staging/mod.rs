//! Staging of decoded records into the spool directory.
//!
//! Each record becomes one file that the uploader consumes and deletes after
//! transmission. A staged file contains, each newline-terminated:
//!
//! ```text
//! _cfg_file=<path>        only if the record carried a config tag
//! <header line>           NUM_HEADERS lines, registry order
//! <body>
//! ```
//!
//! # Publication
//!
//! The file is first reserved under a hidden name (`.XXXXXX`) with an
//! exclusive create, written in full and synced, then renamed without
//! clobbering to its final name (`XXXXXX`). Any failure before the rename
//! drops the hidden file, so the uploader never observes a truncated record.
//! Uploaders must skip dot-files.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::record::DecodedRecord;

/// Number of random characters substituted for the `XXXXXX` placeholder.
pub const SPOOL_NAME_LEN: usize = 6;

/// Prefix marking a file that is still being written.
pub const IN_PROGRESS_PREFIX: &str = ".";

/// Default spool directory.
pub const DEFAULT_SPOOL_DIR: &str = "/var/spool/telemetry";

/// Spool directory permissions when created by the daemon (owner only).
const SPOOL_DIR_MODE: u32 = 0o700;

/// Staging errors.
///
/// A staging error aborts one record. Nothing is left in the spool.
#[derive(Debug, Error)]
pub enum StagingError {
    /// The spool directory is unusable.
    #[error("spool directory {path}: {source}")]
    SpoolDir {
        /// Spool directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// No unique file could be reserved.
    #[error("failed to reserve staging file in {dir}: {source}")]
    Reserve {
        /// Spool directory.
        dir: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Writing the record failed; the partial file was removed.
    #[error("failed to write staging file {path}: {source}")]
    Write {
        /// In-progress file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The finished file could not be published.
    #[error("failed to publish staging file {path}: {source}")]
    Publish {
        /// Final file name.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Writes decoded records into a spool directory.
#[derive(Debug, Clone)]
pub struct Stager {
    spool_dir: PathBuf,
}

impl Stager {
    /// Stage into `spool_dir`.
    #[must_use]
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    /// The spool directory.
    #[must_use]
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// The name template staged files are drawn from, `<spool>/XXXXXX`.
    #[must_use]
    pub fn template(&self) -> PathBuf {
        self.spool_dir.join("X".repeat(SPOOL_NAME_LEN))
    }

    /// Ensure the spool directory exists.
    ///
    /// Creates it with mode 0700 if missing. An existing directory keeps its
    /// permissions. Symlinks and non-directories are refused.
    pub fn ensure_spool_dir(&self) -> Result<(), StagingError> {
        let path = &self.spool_dir;
        let spool_err = |source| StagingError::SpoolDir {
            path: path.clone(),
            source,
        };

        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_symlink() => Err(spool_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to use a symlink as spool directory",
            ))),
            Ok(metadata) if !metadata.is_dir() => Err(spool_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "exists but is not a directory",
            ))),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(path).map_err(spool_err)?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(path, fs::Permissions::from_mode(SPOOL_DIR_MODE))
                        .map_err(spool_err)?;
                }

                info!(spool_dir = %path.display(), "Created spool directory");
                Ok(())
            },
            Err(e) => Err(spool_err(e)),
        }
    }

    /// Stage one record and return the published path.
    ///
    /// # Errors
    ///
    /// Returns a [`StagingError`] if no file can be reserved, the write or
    /// sync fails, or the final name is taken. The in-progress file is
    /// removed in every case.
    pub fn stage(&self, record: &DecodedRecord) -> Result<PathBuf, StagingError> {
        self.stage_with(record, |file, record| {
            let mut writer = BufWriter::new(file);
            write_record(&mut writer, record)?;
            writer.flush()
        })
    }

    fn stage_with<F>(&self, record: &DecodedRecord, write: F) -> Result<PathBuf, StagingError>
    where
        F: FnOnce(&mut File, &DecodedRecord) -> io::Result<()>,
    {
        let mut staged = tempfile::Builder::new()
            .prefix(IN_PROGRESS_PREFIX)
            .rand_bytes(SPOOL_NAME_LEN)
            .tempfile_in(&self.spool_dir)
            .map_err(|source| StagingError::Reserve {
                dir: self.spool_dir.clone(),
                source,
            })?;

        debug!(path = %staged.path().display(), "Reserved staging file");

        // On error `staged` is dropped here, which unlinks the partial file.
        let in_progress = staged.path().to_path_buf();
        let write_err = |source| StagingError::Write {
            path: in_progress.clone(),
            source,
        };
        write(staged.as_file_mut(), record).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;

        let final_path = published_path(&in_progress);
        // A failed persist hands the temp file back inside the error, and
        // dropping it unlinks the in-progress file.
        staged
            .persist_noclobber(&final_path)
            .map_err(|e| StagingError::Publish {
                path: final_path.clone(),
                source: e.error,
            })?;

        Ok(final_path)
    }
}

/// Final name of an in-progress file: the same name without the hidden
/// prefix.
fn published_path(in_progress: &Path) -> PathBuf {
    let name = in_progress
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_prefix(IN_PROGRESS_PREFIX).unwrap_or(&name);
    in_progress.with_file_name(name)
}

/// Write the staged representation of `record`.
///
/// # Errors
///
/// Propagates any error from `writer`.
pub fn write_record<W: Write>(writer: &mut W, record: &DecodedRecord) -> io::Result<()> {
    if let Some(line) = record.config_line() {
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
    }
    for header in &record.headers {
        writer.write_all(header.line())?;
        writer.write_all(b"\n")?;
    }
    writer.write_all(&record.body)?;
    writer.write_all(b"\n")
}
