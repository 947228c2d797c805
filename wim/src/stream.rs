//! Streams: the unit of content stored in an archive.

use crate::compress::CompressionType;
use crate::error::{Result, WimError};
use crate::header::{ResourceEntry, ResourceFlags};
use crate::source::{self, Adapters, SourceAdapter, SourceReader, StreamSource};
use crate::{SHA1_HASH_SIZE, WIM_CHUNK_SIZE};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::sync::Arc;

/// One content-addressed blob: file data or an image's metadata resource.
///
/// A stream's identity is the SHA-1 of its uncompressed bytes. A zeroed hash means "not yet
/// known"; the writer computes the digest as it reads the source and records it. A stream
/// whose hash was known up front is verified instead, and a disagreement fails the write,
/// since it means the source changed underneath the reader.
pub struct Stream {
    /// SHA-1 of the uncompressed contents, or all zeroes when not yet computed.
    pub(crate) hash: [u8; SHA1_HASH_SIZE],

    /// Uncompressed size in bytes.
    pub(crate) size: u64,

    /// Stored (encoded) size of the source bytes. Equal to `size` except for compressed
    /// in-archive resources.
    pub(crate) csize: u64,

    /// Compression type of the source's stored form.
    pub(crate) ctype: CompressionType,

    /// Resource flags of the source, carried into the output entry.
    pub(crate) flags: ResourceFlags,

    pub(crate) source: StreamSource,

    /// The open reader, if any. At most one per stream; opened lazily, dropped on completion
    /// or error.
    pub(crate) reader: Option<SourceReader>,

    /// Number of references held by the archive's images.
    pub(crate) refcnt: u32,

    /// Number of references in the output being written. Rebuilt for every write; a stream
    /// with no output references is not emitted.
    pub(crate) out_refcnt: u32,

    /// Where the stream landed in the output, filled in when it is written.
    pub(crate) out_entry: ResourceEntry,
}

impl Stream {
    fn with_source(source: StreamSource, size: u64) -> Self {
        Self {
            hash: [0; SHA1_HASH_SIZE],
            size,
            csize: size,
            ctype: CompressionType::None,
            flags: ResourceFlags::empty(),
            source,
            reader: None,
            refcnt: 0,
            out_refcnt: 0,
            out_entry: ResourceEntry::default(),
        }
    }

    /// A stream backed by a file on disk. The hash is computed when the stream is first
    /// written.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self::with_source(StreamSource::OnDisk { path }, meta.len()))
    }

    /// A stream backed by bytes in memory. The hash is computed eagerly so equal buffers
    /// deduplicate on insert.
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        let mut stream = Self::with_source(StreamSource::InMemory { data: data.clone() }, size);
        stream.hash = Sha1::digest(&data).into();
        stream
    }

    /// A stream backed by a capture adapter.
    pub fn from_adapter(adapter: Arc<dyn SourceAdapter>) -> Result<Self> {
        let size = adapter.size().map_err(WimError::Read)?;
        Ok(Self::with_source(StreamSource::External { adapter }, size))
    }

    /// A stream backed by the platform's raw-encrypted export of `path`. Requires the
    /// raw-encrypted capability in `adapters`.
    pub fn from_encrypted(path: impl Into<PathBuf>, adapters: &Adapters) -> Result<Self> {
        let path = path.into();
        let Some(api) = adapters.encrypted else {
            return Err(WimError::Open {
                path,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "no raw-encrypted API on this platform",
                ),
            });
        };
        let size = (api.size)(&path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self::with_source(StreamSource::Encrypted { path }, size))
    }

    /// A stream pointing at a resource of an existing archive.
    pub(crate) fn from_archive(
        file: Arc<sync_file::RandomAccessFile>,
        entry: ResourceEntry,
        hash: [u8; SHA1_HASH_SIZE],
        refcnt: u32,
        ctype: CompressionType,
    ) -> Self {
        let stored_ctype = if entry.flags.contains(ResourceFlags::COMPRESSED) {
            ctype
        } else {
            CompressionType::None
        };
        Self {
            hash,
            size: entry.original_size,
            csize: entry.size,
            ctype: stored_ctype,
            flags: entry.flags,
            source: StreamSource::InArchive { file, entry },
            reader: None,
            refcnt,
            out_refcnt: 0,
            out_entry: ResourceEntry::default(),
        }
    }

    /// SHA-1 of the uncompressed contents, or all zeroes when not yet computed.
    pub fn hash(&self) -> &[u8; SHA1_HASH_SIZE] {
        &self.hash
    }

    /// Uncompressed size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Where the stream's bytes come from.
    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub(crate) fn is_zero_hash(&self) -> bool {
        self.hash == [0; SHA1_HASH_SIZE]
    }

    pub(crate) fn is_metadata(&self) -> bool {
        self.flags.contains(ResourceFlags::METADATA)
    }

    pub(crate) fn num_chunks(&self) -> u64 {
        self.size.div_ceil(WIM_CHUNK_SIZE as u64)
    }

    /// Opens (or returns the cached) reader for this stream.
    pub(crate) fn open_reader(&mut self, adapters: &Adapters) -> Result<&mut SourceReader> {
        if self.reader.is_none() {
            self.reader = Some(source::open_reader(&self.source, self.csize, adapters)?);
        }
        Ok(self.reader.as_mut().expect("reader was just opened"))
    }

    /// Drops the cached reader, closing any handle it held.
    pub(crate) fn close_reader(&mut self) {
        self.reader = None;
    }

    /// Verifies a computed digest against the recorded hash, or adopts it when the hash was
    /// unknown.
    pub(crate) fn check_or_adopt_hash(&mut self, computed: [u8; SHA1_HASH_SIZE]) -> Result<()> {
        if self.is_zero_hash() {
            self.hash = computed;
            Ok(())
        } else if self.hash == computed {
            Ok(())
        } else {
            Err(WimError::HashMismatch {
                context: self.source.describe(),
            })
        }
    }
}
