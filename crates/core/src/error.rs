//! Error kinds shared by the index, matcher, planner and executor.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A strong checksum has no bound node, or an expected path is missing.
    #[error("no node bound to strong checksum {0}")]
    NotFound(String),

    /// A path is not the kind of entry (file vs directory) the caller expected.
    #[error("{}: expected {expected}", path.display())]
    KindMismatch {
        path: PathBuf,
        expected: &'static str,
    },

    /// An underlying OS error, wrapped with the operation and path.
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The command sequence violates the plan's own invariants.
    #[error("malformed patch plan: {0}")]
    PlanMalformed(String),

    /// The root of an index could not be read at all.
    #[error("cannot index root {}: {source}", path.display())]
    IndexUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an OS error with the failing operation and path.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// An `Io` error reporting fewer bytes than the caller required.
    pub fn short_read(path: &Path, want: u64, got: u64) -> Self {
        Self::io(
            "read",
            path,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("wanted {want} bytes, got {got}"),
            ),
        )
    }
}
