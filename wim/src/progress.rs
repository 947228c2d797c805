//! Progress reporting for long-running writes.

use crate::compress::CompressionType;
use std::path::Path;

/// Counters reported while the stream list is being written.
#[derive(Clone, Debug)]
pub struct WriteStreamsProgress {
    /// Uncompressed bytes of all streams to be written.
    pub total_bytes: u64,
    /// Number of streams to be written.
    pub total_streams: u64,
    /// Uncompressed bytes of the streams written so far.
    pub completed_bytes: u64,
    /// Number of streams written so far.
    pub completed_streams: u64,
    /// Number of threads in use (1 for the serial path).
    pub num_threads: u32,
    /// The archive's compression type.
    pub compression: CompressionType,
}

/// Counters reported while the integrity table is being computed.
#[derive(Clone, Debug)]
pub struct IntegrityProgress {
    /// Archive bytes that must be hashed.
    pub total_bytes: u64,
    /// Archive bytes hashed so far.
    pub completed_bytes: u64,
}

/// One progress notification. Delivered to the callback passed to
/// [`Wim::write`](crate::Wim::write) or [`Wim::overwrite`](crate::Wim::overwrite).
///
/// Notifications are advisory; a callback cannot abort the write.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// A stream finished writing.
    WriteStreams(&'a WriteStreamsProgress),
    /// Image metadata resources are about to be written.
    WriteMetadataBegin,
    /// All image metadata resources have been written.
    WriteMetadataEnd,
    /// A region of the archive was hashed for the integrity table.
    CalculateIntegrity(&'a IntegrityProgress),
    /// The rebuilt archive was renamed over the original.
    Rename {
        /// The temporary file that was renamed.
        from: &'a Path,
        /// The archive path it replaced.
        to: &'a Path,
    },
}

/// An optional progress callback, passed down through the writer.
pub(crate) struct Progress<'a> {
    cb: Option<&'a mut dyn FnMut(ProgressEvent<'_>)>,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(cb: Option<&'a mut dyn FnMut(ProgressEvent<'_>)>) -> Self {
        Self { cb }
    }

    pub(crate) fn none() -> Self {
        Self { cb: None }
    }

    pub(crate) fn emit(&mut self, event: ProgressEvent<'_>) {
        if let Some(cb) = self.cb.as_mut() {
            cb(event);
        }
    }
}
