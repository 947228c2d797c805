//! Stream sources and their readers.
//!
//! A stream's bytes can live in many places: an existing archive, a file on disk, a memory
//! buffer, an NTFS attribute or other capture back-end behind an adapter, a pre-opened native
//! handle, or a "raw encrypted" file that the operating system only exposes as a push-style
//! whole-file export. The writer reads all of them through one interface: open a reader
//! lazily, read exact spans at offsets, close deterministically.
//!
//! Raw-encrypted sources are the odd one out: they cannot seek, so their reader accepts only
//! strictly sequential reads and the pipeline consumes them in chunk order, which it does
//! anyway.

use crate::error::{Result, WimError};
use crate::header::ResourceEntry;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_file::{RandomAccessFile, ReadAt};
use tracing::trace;

/// A capture back-end's handle for one open stream, created by [`SourceAdapter::open`].
///
/// Dropping the handle closes it.
pub trait SourceHandle: Send {
    /// Reads exactly `buf.len()` bytes at `offset` within the stream.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

/// A caller-supplied stream source, such as an NTFS attribute opened through a volume handle.
///
/// Capture front-ends implement this for sources the writer has no native support for. The
/// writer opens at most one handle per stream at a time and always closes it (by dropping)
/// when the stream has been written or an error occurred.
pub trait SourceAdapter: Send + Sync {
    /// The stream's uncompressed size in bytes.
    fn size(&self) -> std::io::Result<u64>;

    /// Opens a handle for reading.
    fn open(&self) -> std::io::Result<Box<dyn SourceHandle>>;
}

/// Entry points of the platform's raw-encrypted-file API, when it has one.
///
/// The underlying OS facility pushes the whole file through a callback; the opener returned
/// here is expected to adapt that into a pull-style [`Read`], buffering no more than one chunk.
/// Each call to `open` restarts the export from the beginning.
#[derive(Copy, Clone)]
pub struct EncryptedApi {
    /// Starts a raw export of the file and returns a sequential reader over it.
    pub open: fn(&Path) -> std::io::Result<Box<dyn Read + Send>>,
    /// Determines the total size of the raw export.
    pub size: fn(&Path) -> std::io::Result<u64>,
}

/// Platform capabilities probed once when a [`Wim`](crate::Wim) is constructed and passed to
/// the source layer explicitly.
#[derive(Copy, Clone, Default)]
pub struct Adapters {
    /// The raw-encrypted-file API, if the platform provides one.
    pub encrypted: Option<EncryptedApi>,
}

impl Adapters {
    /// Probes the running platform. There is no portable raw-encrypted API, so the default
    /// probe finds nothing; platform front-ends install their own with
    /// [`Wim::set_adapters`](crate::Wim::set_adapters).
    pub fn probe() -> Self {
        Self::default()
    }
}

/// Where a stream's bytes come from.
pub enum StreamSource {
    /// A resource inside an already-written archive. Raw-copyable as stored; readable as
    /// uncompressed data only when stored uncompressed.
    InArchive {
        /// Read handle of the archive file.
        file: Arc<RandomAccessFile>,
        /// The resource's location in that archive.
        entry: ResourceEntry,
    },
    /// A regular file. Opened lazily on first read.
    OnDisk {
        /// Path of the file.
        path: PathBuf,
    },
    /// Bytes already in memory.
    InMemory {
        /// The stream contents.
        data: Arc<[u8]>,
    },
    /// A capture back-end source behind a [`SourceAdapter`].
    External {
        /// The adapter.
        adapter: Arc<dyn SourceAdapter>,
    },
    /// A file already opened by the caller, read positionally.
    Native {
        /// The open handle.
        file: Arc<RandomAccessFile>,
    },
    /// A raw-encrypted file, readable only as a sequential whole-file export.
    Encrypted {
        /// Path of the file.
        path: PathBuf,
    },
    /// The stream has no backing data. Attempting to read it is an error.
    Nonexistent,
}

impl StreamSource {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::InArchive { .. } => "in-archive",
            Self::OnDisk { .. } => "on-disk",
            Self::InMemory { .. } => "in-memory",
            Self::External { .. } => "external",
            Self::Native { .. } => "native-handle",
            Self::Encrypted { .. } => "encrypted",
            Self::Nonexistent => "nonexistent",
        }
    }

    /// A human-readable locator for error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::OnDisk { path } | Self::Encrypted { path } => format!("{:?}", path),
            other => other.kind().to_string(),
        }
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamSource::{}", self.kind())
    }
}

/// Pull-style reader over a source that only supports one forward pass.
pub(crate) struct SequentialReader {
    inner: Box<dyn Read + Send>,
    pos: u64,
}

impl SequentialReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        if offset != self.pos {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "sequential source requires in-order reads",
            ));
        }
        self.inner.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }
}

/// An open reader for one stream. Created by [`open_reader`], cached on the stream, and closed
/// by dropping.
pub(crate) enum SourceReader {
    Archive {
        file: Arc<RandomAccessFile>,
        base: u64,
        len: u64,
    },
    Disk(RandomAccessFile),
    Memory(Arc<[u8]>),
    External(Box<dyn SourceHandle>),
    Native(Arc<RandomAccessFile>),
    Sequential(SequentialReader),
}

impl SourceReader {
    /// Reads exactly `buf.len()` bytes at `offset` within the stream.
    ///
    /// For raw copies of compressed in-archive resources, offsets address the stored (encoded)
    /// bytes; for every other use they address the uncompressed stream.
    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        trace!(offset, len = buf.len(), "read source chunk");
        match self {
            Self::Archive { file, base, len } => {
                if offset + buf.len() as u64 > *len {
                    return Err(WimError::Read(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "read past the end of the archived resource",
                    )));
                }
                file.read_exact_at(buf, *base + offset).map_err(WimError::Read)
            }
            Self::Disk(file) => file.read_exact_at(buf, offset).map_err(WimError::Read),
            Self::Memory(data) => {
                let start = offset as usize;
                let end = start + buf.len();
                let Some(span) = data.get(start..end) else {
                    return Err(WimError::Read(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "read past the end of the in-memory stream",
                    )));
                };
                buf.copy_from_slice(span);
                Ok(())
            }
            Self::External(handle) => handle.read_at(offset, buf).map_err(WimError::Read),
            Self::Native(file) => file.read_exact_at(buf, offset).map_err(WimError::Read),
            Self::Sequential(reader) => reader.read_at(offset, buf).map_err(WimError::Read),
        }
    }
}

/// Opens a reader for a source. Where the source is an already-open handle or buffer, no new
/// handle is created.
pub(crate) fn open_reader(
    source: &StreamSource,
    stored_len: u64,
    adapters: &Adapters,
) -> Result<SourceReader> {
    match source {
        StreamSource::InArchive { file, entry } => Ok(SourceReader::Archive {
            file: Arc::clone(file),
            base: entry.offset,
            len: stored_len,
        }),
        StreamSource::OnDisk { path } => {
            let file = std::fs::File::open(path).map_err(|source| WimError::Open {
                path: path.clone(),
                source,
            })?;
            Ok(SourceReader::Disk(RandomAccessFile::from(file)))
        }
        StreamSource::InMemory { data } => Ok(SourceReader::Memory(Arc::clone(data))),
        StreamSource::External { adapter } => {
            Ok(SourceReader::External(adapter.open().map_err(|source| {
                WimError::Open {
                    path: PathBuf::from("<external source>"),
                    source,
                }
            })?))
        }
        StreamSource::Native { file } => Ok(SourceReader::Native(Arc::clone(file))),
        StreamSource::Encrypted { path } => {
            let Some(api) = adapters.encrypted else {
                return Err(WimError::Open {
                    path: path.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "no raw-encrypted API on this platform",
                    ),
                });
            };
            let inner = (api.open)(path).map_err(|source| WimError::Open {
                path: path.clone(),
                source,
            })?;
            Ok(SourceReader::Sequential(SequentialReader { inner, pos: 0 }))
        }
        StreamSource::Nonexistent => Err(WimError::Read(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "stream has no backing data",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_reader_bounds() {
        let data: Arc<[u8]> = Arc::from(&b"hello world"[..]);
        let mut reader = SourceReader::Memory(data);

        let mut buf = [0u8; 5];
        reader.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let mut buf = [0u8; 6];
        assert!(matches!(reader.read_at(6, &mut buf), Err(WimError::Read(_))));
    }

    #[test]
    fn sequential_reader_rejects_rewinds() {
        let mut reader = SequentialReader {
            inner: Box::new(&b"abcdef"[..]),
            pos: 0,
        };

        let mut buf = [0u8; 3];
        reader.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        // Reading the same span again is a rewind, which the push-style export cannot do.
        assert!(reader.read_at(0, &mut buf).is_err());

        reader.read_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn encrypted_requires_capability() {
        let source = StreamSource::Encrypted {
            path: PathBuf::from("secret.bin"),
        };
        assert!(matches!(
            open_reader(&source, 0, &Adapters::default()),
            Err(WimError::Open { .. })
        ));
    }

    #[test]
    fn encrypted_opens_through_probe() {
        fn open(_: &Path) -> std::io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(&b"\x01\x02\x03\x04"[..]))
        }
        fn size(_: &Path) -> std::io::Result<u64> {
            Ok(4)
        }
        let adapters = Adapters {
            encrypted: Some(EncryptedApi { open, size }),
        };
        let source = StreamSource::Encrypted {
            path: PathBuf::from("secret.bin"),
        };
        let mut reader = open_reader(&source, 4, &adapters).unwrap();
        let mut buf = [0u8; 4];
        reader.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
