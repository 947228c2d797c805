//! The lookup table: the archive-global catalog of streams.
//!
//! On disk the table is an array of fixed 50-byte entries, one per resource: the 24-byte
//! resource entry, the part number, the reference count, and the 20-byte SHA-1. Metadata
//! resources come first, in image order; data streams follow in insertion order.

use crate::error::{Result, WimError};
use crate::header::{RawResourceEntry, ResourceEntry, ResourceFlags};
use crate::stream::Stream;
use crate::{ImageInfo, SHA1_HASH_SIZE};
use std::collections::HashMap;
use std::io::{Seek, Write};
use tracing::debug;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned, LE, U16, U32};

/// On-disk form of one lookup table entry.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Copy, Clone)]
#[repr(C)]
pub(crate) struct RawLookupEntry {
    pub(crate) resource: RawResourceEntry,
    pub(crate) part_number: U16<LE>,
    pub(crate) refcnt: U32<LE>,
    pub(crate) hash: [u8; SHA1_HASH_SIZE],
}

pub(crate) const LOOKUP_ENTRY_DISK_SIZE: usize = 50;
static_assertions::const_assert_eq!(
    std::mem::size_of::<RawLookupEntry>(),
    LOOKUP_ENTRY_DISK_SIZE
);

/// The in-memory stream catalog. Streams are addressed by index; the index map provides
/// digest-based deduplication for streams whose hash is already known.
#[derive(Default)]
pub(crate) struct LookupTable {
    streams: Vec<Stream>,
    by_hash: HashMap<[u8; SHA1_HASH_SIZE], usize>,
}

impl LookupTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn get(&self, index: usize) -> &Stream {
        &self.streams[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Stream {
        &mut self.streams[index]
    }

    pub(crate) fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub(crate) fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }

    /// Looks up a stream by content digest.
    pub(crate) fn find(&self, hash: &[u8; SHA1_HASH_SIZE]) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    /// Inserts a stream, deduplicating against an existing entry when the hash is known.
    /// Returns the stream's index.
    ///
    /// Metadata resources are per-image and never deduplicate, even when their bytes collide
    /// with a data stream's.
    pub(crate) fn insert(&mut self, stream: Stream) -> usize {
        if !stream.is_zero_hash() && !stream.is_metadata() {
            if let Some(&existing) = self.by_hash.get(&stream.hash) {
                debug!(index = existing, "stream deduplicated by digest");
                return existing;
            }
            self.by_hash.insert(stream.hash, self.streams.len());
        }
        self.streams.push(stream);
        self.streams.len() - 1
    }

    /// Registers a hash that became known after insertion (adopted during a write).
    pub(crate) fn index_hash(&mut self, index: usize) {
        let hash = self.streams[index].hash;
        if hash != [0; SHA1_HASH_SIZE] {
            self.by_hash.entry(hash).or_insert(index);
        }
    }

    /// Total uncompressed bytes of all streams referenced by the output, counting each
    /// reference once.
    pub(crate) fn total_output_bytes(&self) -> u64 {
        self.streams
            .iter()
            .map(|s| s.size * u64::from(s.out_refcnt))
            .sum()
    }
}

/// Writes the lookup table at the current output position and returns its header entry.
///
/// Metadata resources of the written images come first, then every data stream with a nonzero
/// output reference count.
pub(crate) fn write_lookup_table<W: Write + Seek>(
    table: &LookupTable,
    images: &[&ImageInfo],
    out: &mut W,
) -> Result<ResourceEntry> {
    let offset = out.stream_position().map_err(WimError::Write)?;
    let mut written = 0u64;

    let mut write_one = |out: &mut W, stream: &Stream, refcnt: u32| -> Result<()> {
        let raw = RawLookupEntry {
            resource: RawResourceEntry::pack(&stream.out_entry),
            part_number: U16::new(1),
            refcnt: U32::new(refcnt),
            hash: stream.hash,
        };
        out.write_all(raw.as_bytes()).map_err(WimError::Write)?;
        written += LOOKUP_ENTRY_DISK_SIZE as u64;
        Ok(())
    };

    for image in images {
        write_one(out, table.get(image.metadata), 1)?;
    }
    for stream in table.streams() {
        if stream.out_refcnt != 0 && !stream.is_metadata() {
            write_one(out, stream, stream.out_refcnt)?;
        }
    }

    debug!(offset, size = written, "wrote lookup table");
    Ok(ResourceEntry {
        offset,
        size: written,
        original_size: written,
        flags: ResourceFlags::empty(),
    })
}

/// Parses the raw bytes of an archive's lookup table into entries.
pub(crate) fn parse_lookup_table(
    bytes: &[u8],
) -> Result<Vec<(ResourceEntry, u32, [u8; SHA1_HASH_SIZE])>> {
    if bytes.len() % LOOKUP_ENTRY_DISK_SIZE != 0 {
        return Err(WimError::InvalidParam("lookup table size is not a multiple of 50"));
    }
    let mut entries = Vec::with_capacity(bytes.len() / LOOKUP_ENTRY_DISK_SIZE);
    for raw_bytes in bytes.chunks_exact(LOOKUP_ENTRY_DISK_SIZE) {
        let raw = RawLookupEntry::read_from(raw_bytes).expect("chunk length is the entry length");
        entries.push((raw.resource.unpack(), raw.refcnt.get(), raw.hash));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_by_hash() {
        let mut table = LookupTable::new();
        let a = table.insert(Stream::from_bytes(&b"same"[..]));
        let b = table.insert(Stream::from_bytes(&b"same"[..]));
        let c = table.insert(Stream::from_bytes(&b"other"[..]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unknown_hashes_do_not_dedup() {
        let mut table = LookupTable::new();
        let mut a = Stream::from_bytes(&b"x"[..]);
        a.hash = [0; SHA1_HASH_SIZE];
        let mut b = Stream::from_bytes(&b"x"[..]);
        b.hash = [0; SHA1_HASH_SIZE];
        let ia = table.insert(a);
        let ib = table.insert(b);
        assert_ne!(ia, ib);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn serialized_entries_parse_back() {
        let mut table = LookupTable::new();
        let idx = table.insert(Stream::from_bytes(&b"payload"[..]));
        {
            let s = table.get_mut(idx);
            s.out_refcnt = 3;
            s.out_entry = ResourceEntry {
                offset: 212,
                size: 7,
                original_size: 7,
                flags: ResourceFlags::empty(),
            };
        }

        let mut out = std::io::Cursor::new(Vec::new());
        let entry = write_lookup_table(&table, &[], &mut out).unwrap();
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.size, LOOKUP_ENTRY_DISK_SIZE as u64);

        let parsed = parse_lookup_table(out.get_ref()).unwrap();
        assert_eq!(parsed.len(), 1);
        let (res, refcnt, hash) = &parsed[0];
        assert_eq!(res.offset, 212);
        assert_eq!(*refcnt, 3);
        assert_eq!(hash, table.get(idx).hash());
    }
}
