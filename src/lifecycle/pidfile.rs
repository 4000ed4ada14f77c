//! PID record management.
//!
//! The running server writes its process id to a well-known file so that an
//! out-of-process `stop` can find and signal it. The file holds the decimal
//! pid and nothing else.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default PID file location, relative to the working directory.
pub const DEFAULT_PID_FILE: &str = "packagelock.pid";

/// Process id of a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PidRecord(u32);

impl PidRecord {
    /// The calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    pub fn pid(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PidRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Failed to write PID file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove PID file {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("PID file {path:?} not found; is the server running?")]
    Missing { path: PathBuf },

    #[error("Failed to read PID file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("PID file {path:?} does not contain a process id: {content:?}")]
    Invalid { path: PathBuf, content: String },
}

/// Operations on the PID file. Only the lifecycle controller writes or
/// removes it while the server runs.
pub struct PidFile;

impl PidFile {
    /// Record the calling process in `path`, replacing any existing record.
    ///
    /// The content is written to a sibling temp file first and renamed into
    /// place, so a concurrent reader never sees a partial pid.
    pub fn acquire(path: &Path) -> Result<PidRecord, PidFileError> {
        let record = PidRecord::current();
        let write_error = |source| PidFileError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        if path.exists() {
            tracing::warn!(path = ?path, "Overwriting existing PID file");
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, record.to_string()).map_err(write_error)?;
        set_operator_readable(&tmp).map_err(write_error)?;
        fs::rename(&tmp, path).map_err(write_error)?;

        tracing::info!(pid = record.pid(), path = ?path, "PID file written");
        Ok(record)
    }

    /// Remove the PID file if it still names the calling process.
    ///
    /// A newer instance may have acquired the file while this one was
    /// draining; its record is left in place. A missing file is not an error.
    pub fn release(path: &Path) -> Result<(), PidFileError> {
        Self::release_record(path, PidRecord::current())
    }

    /// Remove the PID file if it still holds `record`.
    pub fn release_record(path: &Path, record: PidRecord) -> Result<(), PidFileError> {
        match Self::read(path) {
            Ok(found) if found == record => {}
            Ok(found) => {
                tracing::debug!(path = ?path, owner = found.pid(), "PID file belongs to another process, leaving it");
                return Ok(());
            }
            Err(PidFileError::Missing { .. }) => {
                tracing::debug!(path = ?path, "PID file already absent");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(path = ?path, error = %e, "PID file not ours, leaving it");
                return Ok(());
            }
        }

        match fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(path = ?path, pid = record.pid(), "PID file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse the record in `path`. Used by the out-of-process stop command.
    pub fn read(path: &Path) -> Result<PidRecord, PidFileError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PidFileError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(PidFileError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(PidRecord(pid)),
            _ => Err(PidFileError::Invalid {
                path: path.to_path_buf(),
                content,
            }),
        }
    }
}

#[cfg(unix)]
fn set_operator_readable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_operator_readable(_path: &Path) -> io::Result<()> {
    Ok(())
}
