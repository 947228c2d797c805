//! The archive header and resource entries, as stored on disk.

use crate::compress::CompressionType;
use crate::error::{Result, WimError};
use crate::{WIM_HEADER_DISK_SIZE, WIM_MAGIC, WIM_VERSION};
use std::io::{Read, Write};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned, LE, U16, U32, U64};

bitflags::bitflags! {
    /// Flag bits of an on-disk resource entry.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct ResourceFlags: u8 {
        /// The resource slot is unused.
        const FREE = 0x01;
        /// The resource is an image's metadata resource.
        const METADATA = 0x02;
        /// The bytes at the resource's offset are a chunk table followed by compressed chunks.
        const COMPRESSED = 0x04;
        /// The resource continues in another part of a split set.
        const SPANNED = 0x08;
    }
}

/// Location and size of one resource in the archive.
///
/// Four of these are embedded in the header (lookup table, XML data, boot metadata, integrity
/// table) and one is stored in each lookup table entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ResourceEntry {
    /// Byte position of the resource in the archive.
    pub offset: u64,
    /// On-disk (encoded) size in bytes. At most 2^56 - 1; the high byte of the on-disk field
    /// holds the flags.
    pub size: u64,
    /// Uncompressed size in bytes.
    pub original_size: u64,
    /// Resource flags.
    pub flags: ResourceFlags,
}

impl ResourceEntry {
    /// Whether the entry points at anything. Absent optional resources (boot metadata,
    /// integrity table) are stored zeroed.
    pub fn is_present(&self) -> bool {
        self.offset != 0 || self.size != 0
    }

    /// End offset of the resource.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// On-disk form of [`ResourceEntry`]: a packed 8-byte size+flags word, then the offset and the
/// original size, all little-endian.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Copy, Clone)]
#[repr(C)]
pub(crate) struct RawResourceEntry {
    /// Bytes 0..7 hold the 56-bit encoded size; byte 7 holds the flags.
    size_and_flags: [u8; 8],
    offset: U64<LE>,
    original_size: U64<LE>,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawResourceEntry>(), 24);

impl RawResourceEntry {
    pub(crate) fn pack(entry: &ResourceEntry) -> Self {
        debug_assert!(entry.size < 1 << 56);
        let mut size_and_flags = entry.size.to_le_bytes();
        size_and_flags[7] = entry.flags.bits();
        Self {
            size_and_flags,
            offset: U64::new(entry.offset),
            original_size: U64::new(entry.original_size),
        }
    }

    pub(crate) fn unpack(&self) -> ResourceEntry {
        let mut size_bytes = self.size_and_flags;
        let flags = ResourceFlags::from_bits_truncate(size_bytes[7]);
        size_bytes[7] = 0;
        ResourceEntry {
            offset: self.offset.get(),
            size: u64::from_le_bytes(size_bytes),
            original_size: self.original_size.get(),
            flags,
        }
    }
}

/// The archive header as stored at offset 0.
///
/// The header is written twice: once as a placeholder when the output file is opened (so body
/// writes land at the right offsets) and once, finalized, after all trailing tables are in
/// place. The second write is what commits the archive.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RawHeader {
    magic: [u8; 8],
    header_size: U32<LE>,
    version: U32<LE>,
    flags: U32<LE>,
    chunk_size: U32<LE>,
    guid: [u8; 16],
    part_number: U16<LE>,
    total_parts: U16<LE>,
    image_count: U32<LE>,
    lookup_table: RawResourceEntry,
    xml_data: RawResourceEntry,
    boot_metadata: RawResourceEntry,
    boot_idx: U32<LE>,
    integrity: RawResourceEntry,
    reserved: [u8; 64],
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawHeader>(), WIM_HEADER_DISK_SIZE);

/// In-memory form of the archive header.
#[derive(Clone, Debug)]
pub struct Header {
    /// Format version.
    pub version: u32,
    /// Header flag bits, including the compression type.
    pub flags: u32,
    /// Compression unit size recorded in the archive.
    pub chunk_size: u32,
    /// Random identity of the archive, assigned at creation.
    pub guid: [u8; 16],
    /// 1-based part number within a split set.
    pub part_number: u16,
    /// Number of parts in the split set. Always 1 for archives this writer produces.
    pub total_parts: u16,
    /// Number of images recorded in the archive.
    pub image_count: u32,
    /// 1-based index of the bootable image, or 0 when none is bootable.
    pub boot_idx: u32,
    /// Entry for the lookup table.
    pub lookup_table: ResourceEntry,
    /// Entry for the XML data.
    pub xml_data: ResourceEntry,
    /// Copy of the bootable image's metadata entry, or zeroed.
    pub boot_metadata: ResourceEntry,
    /// Entry for the integrity table, or zeroed when absent.
    pub integrity: ResourceEntry,
}

impl Header {
    /// A header for a fresh, empty archive with the given compression type and a random GUID.
    pub fn new(ctype: CompressionType) -> Self {
        Self {
            version: WIM_VERSION,
            flags: ctype.to_header_flags(),
            chunk_size: crate::WIM_CHUNK_SIZE as u32,
            guid: rand::random(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            boot_idx: 0,
            lookup_table: ResourceEntry::default(),
            xml_data: ResourceEntry::default(),
            boot_metadata: ResourceEntry::default(),
            integrity: ResourceEntry::default(),
        }
    }

    /// The archive-wide compression type encoded in the header flags.
    pub fn compression_type(&self) -> CompressionType {
        CompressionType::from_header_flags(self.flags)
    }

    /// Serializes the header at the current position.
    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let raw = RawHeader {
            magic: WIM_MAGIC,
            header_size: U32::new(WIM_HEADER_DISK_SIZE as u32),
            version: U32::new(self.version),
            flags: U32::new(self.flags),
            chunk_size: U32::new(self.chunk_size),
            guid: self.guid,
            part_number: U16::new(self.part_number),
            total_parts: U16::new(self.total_parts),
            image_count: U32::new(self.image_count),
            lookup_table: RawResourceEntry::pack(&self.lookup_table),
            xml_data: RawResourceEntry::pack(&self.xml_data),
            boot_metadata: RawResourceEntry::pack(&self.boot_metadata),
            boot_idx: U32::new(self.boot_idx),
            integrity: RawResourceEntry::pack(&self.integrity),
            reserved: [0; 64],
        };
        out.write_all(raw.as_bytes())
    }

    /// Reads and validates a header from the current position.
    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut buf = [0u8; WIM_HEADER_DISK_SIZE];
        input.read_exact(&mut buf).map_err(WimError::Read)?;
        let raw = RawHeader::read_from(&buf[..]).expect("buffer length is the header length");

        if raw.magic != WIM_MAGIC {
            return Err(WimError::InvalidParam("file is not a WIM archive"));
        }
        if raw.header_size.get() as usize != WIM_HEADER_DISK_SIZE {
            return Err(WimError::InvalidParam("unsupported header size"));
        }
        if raw.chunk_size.get() as usize != crate::WIM_CHUNK_SIZE {
            return Err(WimError::InvalidParam("unsupported chunk size"));
        }

        Ok(Self {
            version: raw.version.get(),
            flags: raw.flags.get(),
            chunk_size: raw.chunk_size.get(),
            guid: raw.guid,
            part_number: raw.part_number.get(),
            total_parts: raw.total_parts.get(),
            image_count: raw.image_count.get(),
            boot_idx: raw.boot_idx.get(),
            lookup_table: raw.lookup_table.unpack(),
            xml_data: raw.xml_data.unpack(),
            boot_metadata: raw.boot_metadata.unpack(),
            integrity: raw.integrity.unpack(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn resource_entry_packing_round_trip() {
        let entry = ResourceEntry {
            offset: 0x0123_4567_89ab_cdef,
            size: (1 << 56) - 1,
            original_size: u64::MAX,
            flags: ResourceFlags::COMPRESSED | ResourceFlags::METADATA,
        };
        assert_eq!(RawResourceEntry::pack(&entry).unpack(), entry);
    }

    #[test]
    fn header_round_trip() {
        let mut hdr = Header::new(CompressionType::Lzx);
        hdr.image_count = 3;
        hdr.boot_idx = 2;
        hdr.lookup_table = ResourceEntry {
            offset: 212,
            size: 150,
            original_size: 150,
            flags: ResourceFlags::empty(),
        };

        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), WIM_HEADER_DISK_SIZE);

        let back = Header::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.guid, hdr.guid);
        assert_eq!(back.image_count, 3);
        assert_eq!(back.boot_idx, 2);
        assert_eq!(back.lookup_table, hdr.lookup_table);
        assert_eq!(back.compression_type(), CompressionType::Lzx);
    }

    #[test]
    fn rejects_wrong_magic() {
        let buf = [0u8; WIM_HEADER_DISK_SIZE];
        assert!(matches!(
            Header::read_from(&mut Cursor::new(buf.to_vec())),
            Err(WimError::InvalidParam(_))
        ));
    }
}
