//! Listening socket lifecycle.
//!
//! # Security Considerations
//!
//! - The socket directory is created if missing but never re-permissioned
//!   when it already exists.
//! - A symlinked socket directory is refused.
//! - Only a stale *socket* is removed before binding; any other file at the
//!   socket path is an error.
//! - The socket is world-writable (0666) since any local process may report
//!   telemetry. Records carry no privileged operations.

use std::fs;
use std::io;
use std::os::unix::net::UnixListener;
use std::path::Path;

use tracing::{debug, info, warn};

use super::error::{ProtocolError, ProtocolResult};

/// Permissions of the listening socket.
pub const SOCKET_MODE: u32 = 0o666;

/// Permissions of a socket directory created by the daemon.
pub const SOCKET_DIR_MODE: u32 = 0o755;

/// Bind the listening socket at `path`.
///
/// Creates the parent directory if needed and replaces a stale socket left by
/// a previous run.
///
/// # Errors
///
/// Returns an error if the directory or socket cannot be prepared or bound.
pub fn bind_listener(path: &Path) -> ProtocolResult<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }
    cleanup_socket(path)?;

    let listener = UnixListener::bind(path).map_err(|e| {
        ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to bind {}: {e}", path.display()),
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE)).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to set permissions on {}: {e}", path.display()),
            ))
        })?;
    }

    info!(socket = %path.display(), "Listening for telemetry records");
    Ok(listener)
}

/// Remove the socket file on shutdown. Failures are logged.
pub fn remove_socket(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

fn ensure_directory(path: &Path) -> ProtocolResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(ProtocolError::SymlinkDirectory {
                    path: path.to_path_buf(),
                });
            }
            if !metadata.is_dir() {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                )));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|e| {
                ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to create directory {}: {e}", path.display()),
                ))
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_DIR_MODE)).map_err(
                    |e| {
                        ProtocolError::Io(io::Error::new(
                            e.kind(),
                            format!("failed to set permissions on {}: {e}", path.display()),
                        ))
                    },
                )?;
            }

            debug!(path = %path.display(), "Created socket directory");
            Ok(())
        },
        Err(e) => Err(ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to stat {}: {e}", path.display()),
        ))),
    }
}

fn cleanup_socket(path: &Path) -> ProtocolResult<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to stat {}: {e}", path.display()),
            )));
        },
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(ProtocolError::NotASocket {
                path: path.to_path_buf(),
            });
        }
    }

    fs::remove_file(path).map_err(|e| {
        ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to remove stale socket {}: {e}", path.display()),
        ))
    })?;

    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}
