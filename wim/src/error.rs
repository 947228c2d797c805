//! Error surface of the writer.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WimError>;

/// Errors produced while writing or updating an archive.
///
/// Most variants are fatal and bubble up after best-effort cleanup (the output file is closed,
/// and an interrupted in-place update is truncated back to the previous archive end). Two are
/// recovered internally: [`WimError::OutOfMemory`] from the parallel compression pipeline
/// downgrades to single-threaded compression, and [`WimError::ResourceOrder`] from an in-place
/// update falls back to a rebuild through a temporary file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WimError {
    /// A caller-supplied argument was rejected.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The image selector does not name an image of this archive.
    #[error("image {0} does not exist in the archive")]
    InvalidImage(u32),

    /// The archive is one part of a split set, which this writer does not modify.
    #[error("cannot write part of a split archive")]
    SplitUnsupported,

    /// The archive has no backing file, so it cannot be overwritten in place.
    #[error("the archive has no backing file name")]
    NoFilename,

    /// A file (output archive or stream source) could not be opened.
    #[error("failed to open {path:?}")]
    Open {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Stream source data could not be read.
    #[error("failed to read stream data")]
    Read(#[source] std::io::Error),

    /// The output archive could not be written.
    #[error("failed to write output archive")]
    Write(#[source] std::io::Error),

    /// Buffers for the parallel compression pipeline could not be allocated.
    #[error("not enough memory for multi-threaded compression")]
    OutOfMemory,

    /// The SHA-1 of the bytes read from a stream source disagrees with the digest recorded in
    /// the lookup table. The source changed while it was being read.
    #[error("stream has incorrect SHA-1 ({context})")]
    HashMismatch {
        /// Description of the offending source.
        context: String,
    },

    /// The archive's layout violates a precondition of the in-place update.
    #[error("archive layout does not permit an in-place update: {0}")]
    ResourceOrder(&'static str),

    /// Another writer holds the advisory lock on the archive.
    #[error("{path:?} is already being modified by another process")]
    AlreadyLocked {
        /// Path of the locked archive.
        path: PathBuf,
    },

    /// The temporary file could not be renamed over the original archive. The temporary file is
    /// left in place for inspection.
    #[error("failed to rename {from:?} to {to:?}")]
    Rename {
        /// The temporary file.
        from: PathBuf,
        /// The rename target.
        to: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be reopened read-only after a rebuild. The renamed archive on disk
    /// is valid; only the in-memory read handle is gone.
    #[error("failed to reopen {path:?} after rename")]
    Reopen {
        /// Path of the renamed archive.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
