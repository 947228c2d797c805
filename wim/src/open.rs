//! Creating and opening archives.

use crate::compress::CompressionType;
use crate::error::{Result, WimError};
use crate::header::{Header, ResourceFlags};
use crate::integrity::parse_integrity_table;
use crate::lookup::{parse_lookup_table, LookupTable};
use crate::source::Adapters;
use crate::stream::Stream;
use crate::xml::XmlInfo;
use crate::{ImageInfo, Wim};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use sync_file::{RandomAccessFile, ReadAt};
use tracing::{debug, trace_span};

impl Wim {
    /// Creates an empty in-memory archive with the given compression type and a fresh GUID.
    ///
    /// The archive has no backing file until [`Wim::write`] gives it one.
    pub fn new(ctype: CompressionType) -> Self {
        Self {
            hdr: Header::new(ctype),
            lookup: LookupTable::new(),
            images: Vec::new(),
            xml: XmlInfo::default(),
            integrity: None,
            filename: None,
            file: None,
            adapters: Adapters::probe(),
            deletion_occurred: false,
        }
    }

    /// Opens an existing archive.
    ///
    /// The header, lookup table, XML data, and integrity table are read; resource contents are
    /// not. Every stream of the archive becomes an in-archive source, so an update can refer
    /// to it (or raw-copy it into a new file) without decoding it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let _span = trace_span!("Wim::open", ?path).entered();

        let file = File::open(path).map_err(|source| WimError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Arc::new(RandomAccessFile::from(file));

        let mut header_bytes = [0u8; crate::WIM_HEADER_DISK_SIZE];
        file.read_exact_at(&mut header_bytes, 0).map_err(WimError::Read)?;
        let hdr = Header::read_from(&mut Cursor::new(&header_bytes[..]))?;
        let ctype = hdr.compression_type();

        let read_region = |entry: &crate::ResourceEntry| -> Result<Vec<u8>> {
            let mut bytes = vec![0u8; entry.size as usize];
            file.read_exact_at(&mut bytes, entry.offset).map_err(WimError::Read)?;
            Ok(bytes)
        };

        // The lookup table tells us every stream in the archive. Metadata entries double as
        // the image list, in image order.
        let mut lookup = LookupTable::new();
        let mut images = Vec::new();
        if hdr.lookup_table.is_present() {
            let entries = parse_lookup_table(&read_region(&hdr.lookup_table)?)?;
            for (entry, refcnt, hash) in entries {
                let stream = Stream::from_archive(Arc::clone(&file), entry, hash, refcnt, ctype);
                let is_metadata = entry.flags.contains(ResourceFlags::METADATA);
                let index = lookup.insert(stream);
                if is_metadata {
                    images.push(ImageInfo {
                        name: format!("Image {}", images.len() + 1),
                        metadata: index,
                        stream_refs: Vec::new(),
                        modified: false,
                    });
                }
            }
        }

        if images.len() as u32 != hdr.image_count {
            return Err(WimError::InvalidParam(
                "image count disagrees with the lookup table",
            ));
        }

        let xml = XmlInfo {
            total_bytes: 0,
            raw: hdr.xml_data.is_present().then(|| read_region(&hdr.xml_data)).transpose()?,
        };

        let integrity = if hdr.integrity.is_present() {
            Some(parse_integrity_table(&read_region(&hdr.integrity)?)?)
        } else {
            None
        };

        debug!(
            images = images.len(),
            streams = lookup.len(),
            compression = %ctype,
            "opened archive"
        );

        Ok(Self {
            hdr,
            lookup,
            images,
            xml,
            integrity,
            filename: Some(path.to_path_buf()),
            file: Some(file),
            adapters: Adapters::probe(),
            deletion_occurred: false,
        })
    }

    /// Replaces the probed platform capabilities, letting a front-end supply the
    /// raw-encrypted-file API.
    pub fn set_adapters(&mut self, adapters: Adapters) {
        self.adapters = adapters;
    }

    /// Adds a stream to the archive's catalog without referencing it from an image.
    ///
    /// Streams with a known digest deduplicate against existing entries. Returns the stream's
    /// index, usable with [`Wim::add_stream`].
    pub fn add_stream(&mut self, stream: Stream) -> usize {
        self.lookup.insert(stream)
    }

    /// Creates a new image from its serialized metadata resource and returns its 1-based
    /// index.
    pub fn add_image(&mut self, name: impl Into<String>, metadata: Vec<u8>) -> u32 {
        let mut stream = Stream::from_bytes(metadata);
        stream.flags |= ResourceFlags::METADATA;
        let metadata_index = self.lookup.insert(stream);
        // Metadata streams are per-image even when their bytes collide.
        self.lookup.get_mut(metadata_index).refcnt += 1;

        self.images.push(ImageInfo {
            name: name.into(),
            metadata: metadata_index,
            stream_refs: Vec::new(),
            modified: true,
        });
        self.hdr.image_count = self.images.len() as u32;
        self.images.len() as u32
    }

    /// Records that `image` (1-based) references the stream at `stream_index`.
    pub fn reference_stream(&mut self, image: u32, stream_index: usize) -> Result<()> {
        if stream_index >= self.lookup.len() {
            return Err(WimError::InvalidParam("stream index out of range"));
        }
        let Some(info) = self.images.get_mut(image.wrapping_sub(1) as usize) else {
            return Err(WimError::InvalidImage(image));
        };
        info.stream_refs.push(stream_index);
        info.modified = true;
        self.lookup.get_mut(stream_index).refcnt += 1;
        Ok(())
    }

    /// Marks an image (1-based) as bootable, or none with 0.
    pub fn set_boot_index(&mut self, boot: u32) -> Result<()> {
        if boot != 0 && boot > self.images.len() as u32 {
            return Err(WimError::InvalidImage(boot));
        }
        self.hdr.boot_idx = boot;
        Ok(())
    }

    /// Deletes an image (1-based). The image's streams stay in the archive file; the space is
    /// reclaimed the next time the archive is rebuilt, and [`Wim::overwrite`] switches to a
    /// rebuild by default once a deletion happened.
    pub fn delete_image(&mut self, image: u32) -> Result<()> {
        let index = image.wrapping_sub(1) as usize;
        if index >= self.images.len() {
            return Err(WimError::InvalidImage(image));
        }
        let info = self.images.remove(index);
        for &sidx in &info.stream_refs {
            let stream = self.lookup.get_mut(sidx);
            stream.refcnt = stream.refcnt.saturating_sub(1);
        }
        self.hdr.image_count = self.images.len() as u32;
        if self.hdr.boot_idx == image {
            self.hdr.boot_idx = 0;
        } else if self.hdr.boot_idx > image {
            self.hdr.boot_idx -= 1;
        }
        self.deletion_occurred = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_archive_is_empty() {
        let wim = Wim::new(CompressionType::Lzx);
        assert_eq!(wim.image_count(), 0);
        assert_eq!(wim.stream_count(), 0);
        assert_eq!(wim.compression_type(), CompressionType::Lzx);
        assert!(wim.filename().is_none());
    }

    #[test]
    fn add_image_and_reference() {
        let mut wim = Wim::new(CompressionType::Xpress);
        let img = wim.add_image("base", b"metadata bytes".to_vec());
        assert_eq!(img, 1);
        assert_eq!(wim.image_count(), 1);

        let idx = wim.add_stream(Stream::from_bytes(&b"file contents"[..]));
        wim.reference_stream(img, idx).unwrap();
        assert_eq!(wim.lookup.get(idx).refcnt, 1);

        assert!(matches!(
            wim.reference_stream(5, idx),
            Err(WimError::InvalidImage(5))
        ));
    }

    #[test]
    fn delete_image_adjusts_boot_index() {
        let mut wim = Wim::new(CompressionType::None);
        wim.add_image("a", b"a".to_vec());
        wim.add_image("b", b"b".to_vec());
        wim.set_boot_index(2).unwrap();

        wim.delete_image(1).unwrap();
        assert_eq!(wim.hdr.boot_idx, 1);
        assert!(wim.deletion_occurred);
        assert_eq!(wim.image_count(), 1);
    }
}
