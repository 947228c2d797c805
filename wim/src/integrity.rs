//! The optional integrity table at the tail of the archive.
//!
//! The table holds a SHA-1 digest for each fixed-size region of the archive between the end of
//! the header and the end of the lookup table. It lets a reader detect corruption without
//! trusting the lookup table's own contents. An update that appends to the archive only needs
//! to hash the new regions; digests for regions that existed before are copied from the old
//! table.

use crate::error::{Result, WimError};
use crate::header::{ResourceEntry, ResourceFlags};
use crate::progress::{IntegrityProgress, Progress, ProgressEvent};
use crate::{WimOutput, SHA1_HASH_SIZE, WIM_HEADER_DISK_SIZE};
use sha1::{Digest, Sha1};
use std::io::{Read, SeekFrom};
use tracing::{debug, debug_span};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned, LE, U32};

/// Bytes of archive covered by one digest.
pub(crate) const INTEGRITY_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RawIntegrityHeader {
    /// Total on-disk size of the table, this header included.
    size: U32<LE>,
    num_entries: U32<LE>,
    chunk_size: U32<LE>,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RawIntegrityHeader>(), 12);

/// An integrity table, either parsed from an existing archive or about to be written.
pub(crate) struct IntegrityTable {
    pub(crate) chunk_size: u64,
    pub(crate) digests: Vec<[u8; SHA1_HASH_SIZE]>,
}

/// Computes and writes the integrity table at the current position and returns its header
/// entry.
///
/// The covered region is `WIM_HEADER_DISK_SIZE..new_lookup_end`. When `old_lookup_end` is
/// nonzero, digests of regions lying entirely below it are reused from `old_table` rather than
/// recomputed, which is what makes appending to a large archive cheap.
pub(crate) fn write_integrity_table<W: WimOutput + Read>(
    out: &mut W,
    new_lookup_end: u64,
    old_lookup_end: u64,
    old_table: Option<&IntegrityTable>,
    progress: &mut Progress<'_>,
) -> Result<ResourceEntry> {
    let _span = debug_span!("write_integrity_table", new_lookup_end, old_lookup_end).entered();

    let table_offset = out.stream_position().map_err(WimError::Write)?;
    let covered = new_lookup_end - WIM_HEADER_DISK_SIZE as u64;
    let num_entries = covered.div_ceil(INTEGRITY_CHUNK_SIZE);

    let reusable = |index: u64, region_end: u64| -> Option<[u8; SHA1_HASH_SIZE]> {
        if old_lookup_end == 0 || region_end > old_lookup_end {
            return None;
        }
        let old = old_table?;
        if old.chunk_size != INTEGRITY_CHUNK_SIZE {
            return None;
        }
        old.digests.get(index as usize).copied()
    };

    let mut info = IntegrityProgress {
        total_bytes: covered,
        completed_bytes: 0,
    };

    let mut digests = Vec::with_capacity(num_entries as usize);
    let mut buf = vec![0u8; 64 * 1024];
    for index in 0..num_entries {
        let region_start = WIM_HEADER_DISK_SIZE as u64 + index * INTEGRITY_CHUNK_SIZE;
        let region_end = (region_start + INTEGRITY_CHUNK_SIZE).min(new_lookup_end);

        if let Some(digest) = reusable(index, region_end) {
            digests.push(digest);
            info.completed_bytes += region_end - region_start;
            progress.emit(ProgressEvent::CalculateIntegrity(&info));
            continue;
        }

        out.seek(SeekFrom::Start(region_start)).map_err(WimError::Write)?;
        let mut sha = Sha1::new();
        let mut remaining = region_end - region_start;
        while remaining != 0 {
            let n = buf.len().min(remaining as usize);
            out.read_exact(&mut buf[..n]).map_err(WimError::Write)?;
            sha.update(&buf[..n]);
            remaining -= n as u64;
        }
        digests.push(sha.finalize().into());
        info.completed_bytes += region_end - region_start;
        progress.emit(ProgressEvent::CalculateIntegrity(&info));
    }

    let table_size = std::mem::size_of::<RawIntegrityHeader>() as u64
        + num_entries * SHA1_HASH_SIZE as u64;
    let raw = RawIntegrityHeader {
        size: U32::new(table_size as u32),
        num_entries: U32::new(num_entries as u32),
        chunk_size: U32::new(INTEGRITY_CHUNK_SIZE as u32),
    };

    out.seek(SeekFrom::Start(table_offset)).map_err(WimError::Write)?;
    out.write_all(raw.as_bytes()).map_err(WimError::Write)?;
    for digest in &digests {
        out.write_all(digest).map_err(WimError::Write)?;
    }

    debug!(table_offset, num_entries, "wrote integrity table");
    Ok(ResourceEntry {
        offset: table_offset,
        size: table_size,
        original_size: table_size,
        flags: ResourceFlags::empty(),
    })
}

/// Parses the raw bytes of an archive's integrity table.
pub(crate) fn parse_integrity_table(bytes: &[u8]) -> Result<IntegrityTable> {
    let header_len = std::mem::size_of::<RawIntegrityHeader>();
    let Some(raw) = RawIntegrityHeader::read_from_prefix(bytes) else {
        return Err(WimError::InvalidParam("integrity table is too short"));
    };
    let num_entries = raw.num_entries.get() as usize;
    let body = &bytes[header_len..];
    if body.len() < num_entries * SHA1_HASH_SIZE {
        return Err(WimError::InvalidParam("integrity table is truncated"));
    }

    let mut digests = Vec::with_capacity(num_entries);
    for entry in body.chunks_exact(SHA1_HASH_SIZE).take(num_entries) {
        let mut digest = [0u8; SHA1_HASH_SIZE];
        digest.copy_from_slice(entry);
        digests.push(digest);
    }
    Ok(IntegrityTable {
        chunk_size: u64::from(raw.chunk_size.get()),
        digests,
    })
}
