//! Writes Windows Imaging (WIM) archive files.
//!
//! WIM is a content-addressed container format. An archive holds a set of _streams_ (file data
//! and per-image metadata), each identified by the SHA-1 digest of its contents. Streams are
//! stored either raw or as a sequence of independently-compressed 32 KiB chunks preceded by a
//! chunk offset table. A lookup table at the end of the archive maps digests to resources, and
//! is followed by an XML information document and an optional integrity table.
//!
//! This crate is the _writer_ for that format. It reads stream data from heterogeneous sources
//! (disk files, memory, an existing archive, caller-supplied adapters), compresses chunks on a
//! pool of worker threads while a single I/O thread owns the output file, and finishes the
//! archive with the lookup table, XML data, integrity table, and a final header rewrite.
//!
//! Two update strategies are supported for existing archives:
//!
//! * **In-place append** ([`Wim::overwrite`] default): new streams are appended past the end of
//!   the previous archive, then the trailing tables are rewritten and the header is updated
//!   last. The file is a valid archive at every instant; an interrupted update is undone by
//!   truncating back to the previous end.
//! * **Rebuild via temporary file**: a complete new archive is written next to the original and
//!   atomically renamed over it.
//!
//! Reading back the *contents* of compressed resources is out of scope; only the header and
//! lookup table of an existing archive are parsed, which is what the update strategies need.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

mod chunk_table;
mod compress;
mod error;
mod header;
mod integrity;
mod lookup;
mod open;
mod overwrite;
mod pipeline;
mod progress;
mod queue;
mod resource;
mod source;
mod stream;
mod write;
mod xml;

#[cfg(test)]
mod tests;

pub use compress::CompressionType;
pub use error::{Result, WimError};
pub use header::{Header, ResourceEntry, ResourceFlags};
pub use progress::{IntegrityProgress, ProgressEvent, WriteStreamsProgress};
pub use source::{Adapters, EncryptedApi, SourceAdapter, SourceHandle, StreamSource};
pub use stream::Stream;
pub use write::WriteFlags;

use lookup::LookupTable;
use std::fs::File;
use std::io::{Cursor, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;
use sync_file::RandomAccessFile;
use xml::XmlInfo;

/// Identifies a WIM file. The value is at offset 0 of every archive.
pub const WIM_MAGIC: [u8; 8] = *b"MSWIM\0\0\0";

/// The format version this writer produces.
pub const WIM_VERSION: u32 = 0x10d00;

/// Size of the compression unit. Every chunk of a compressed resource except the last covers
/// exactly this many uncompressed bytes.
pub const WIM_CHUNK_SIZE: usize = 32768;

/// The on-disk size of the archive header.
pub const WIM_HEADER_DISK_SIZE: usize = 212;

/// Length of a SHA-1 digest, the stream identity used throughout the format.
pub const SHA1_HASH_SIZE: usize = 20;

/// Selects which image (or images) of an archive an operation applies to.
///
/// Image indices are 1-based, matching the `INDEX` attribute of the archive's XML document.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ImageSelector {
    /// Every image in the archive.
    All,
    /// A single image, by 1-based index.
    Index(u32),
}

/// Output sink for the archive writer.
///
/// The writer needs sequential writes, seeks (the chunk table of each compressed resource is
/// reserved first and filled in afterwards, and the header is rewritten last), truncation (a
/// resource that compresses to no smaller than its input is rewound and stored raw), and a
/// durability barrier. [`File`] is the real target; `Cursor<Vec<u8>>` serves in-memory tests.
pub trait WimOutput: Write + Seek {
    /// Truncates the underlying storage to `size` bytes.
    fn truncate_to(&mut self, size: u64) -> std::io::Result<()>;

    /// Flushes buffered data and synchronizes it to durable storage.
    fn sync_data(&mut self) -> std::io::Result<()>;
}

impl WimOutput for File {
    fn truncate_to(&mut self, size: u64) -> std::io::Result<()> {
        self.set_len(size)
    }

    fn sync_data(&mut self) -> std::io::Result<()> {
        File::sync_data(self)
    }
}

impl WimOutput for Cursor<Vec<u8>> {
    fn truncate_to(&mut self, size: u64) -> std::io::Result<()> {
        self.get_mut().truncate(size as usize);
        Ok(())
    }

    fn sync_data(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One image of the archive: a metadata resource plus the set of streams the image references.
///
/// Capture front-ends build the metadata resource (the serialized directory tree) and register
/// each file stream the tree points at. The writer only needs the reference list to compute
/// output reference counts; it never inspects metadata contents.
pub struct ImageInfo {
    /// Image name, carried into the XML document.
    pub name: String,

    /// Index of the image's metadata stream in the lookup table.
    pub(crate) metadata: usize,

    /// Indices of the streams referenced by this image's file tree.
    pub(crate) stream_refs: Vec<usize>,

    /// Set when the image's tree (and therefore its metadata resource) has changed since the
    /// archive was opened or created.
    pub(crate) modified: bool,
}

/// An open WIM archive being built or updated.
///
/// Create an empty archive with [`Wim::new`], or open an existing one with [`Wim::open`].
/// Populate it through [`Wim::add_image`] and [`Wim::add_stream`], then produce a file with
/// [`Wim::write`] or update the backing file with [`Wim::overwrite`].
pub struct Wim {
    pub(crate) hdr: Header,
    pub(crate) lookup: LookupTable,
    pub(crate) images: Vec<ImageInfo>,
    pub(crate) xml: XmlInfo,
    pub(crate) integrity: Option<integrity::IntegrityTable>,

    /// Path of the backing file, if the archive was opened from (or renamed onto) one.
    pub(crate) filename: Option<PathBuf>,

    /// Read handle on the backing file. Shared with in-archive stream sources.
    pub(crate) file: Option<Arc<RandomAccessFile>>,

    pub(crate) adapters: Adapters,

    /// Set when an image has been deleted; an in-place update can no longer reclaim the space,
    /// so the default overwrite strategy switches to a rebuild.
    pub(crate) deletion_occurred: bool,
}

impl Wim {
    /// The number of images in the archive.
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// The compression type applied to resources written into this archive.
    pub fn compression_type(&self) -> CompressionType {
        self.hdr.compression_type()
    }

    /// The path of the backing file, if any.
    pub fn filename(&self) -> Option<&std::path::Path> {
        self.filename.as_deref()
    }

    /// Access to an image by 1-based index.
    pub fn image(&self, index: u32) -> Option<&ImageInfo> {
        self.images.get(index.checked_sub(1)? as usize)
    }

    /// The number of streams in the lookup table, including metadata streams.
    pub fn stream_count(&self) -> usize {
        self.lookup.len()
    }

    /// Looks up a data stream by the SHA-1 of its contents. Returns its index, usable with
    /// [`Wim::reference_stream`].
    pub fn find_stream(&self, hash: &[u8; SHA1_HASH_SIZE]) -> Option<usize> {
        self.lookup.find(hash)
    }

    /// Whether the archive holds an open read handle on its backing file.
    ///
    /// Only a rebuild that failed to reopen the renamed archive leaves an archive with a
    /// filename but no handle.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn validate_image(&self, image: ImageSelector) -> Result<()> {
        match image {
            ImageSelector::All => Ok(()),
            ImageSelector::Index(n) if n >= 1 && n <= self.images.len() as u32 => Ok(()),
            ImageSelector::Index(n) => Err(WimError::InvalidImage(n)),
        }
    }

    pub(crate) fn selected_images(&self, image: ImageSelector) -> std::ops::Range<usize> {
        match image {
            ImageSelector::All => 0..self.images.len(),
            ImageSelector::Index(n) => (n as usize - 1)..(n as usize),
        }
    }
}
