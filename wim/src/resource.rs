//! Writing one resource end to end.

use crate::chunk_table::{chunk_span, ChunkTable};
use crate::compress::{compress_chunk, CompressionType};
use crate::error::{Result, WimError};
use crate::header::{ResourceEntry, ResourceFlags};
use crate::source::Adapters;
use crate::stream::Stream;
use crate::{WimOutput, WIM_CHUNK_SIZE};
use sha1::{Digest, Sha1};
use std::io::SeekFrom;
use tracing::{debug, trace_span};

bitflags::bitflags! {
    /// Internal flags controlling how one resource is written.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub(crate) struct ResourceWriteFlags: u32 {
        /// Re-encode even when the source's compression type matches the output's.
        const RECOMPRESS = 0x1;
    }
}

pub(crate) fn tell<W: WimOutput>(out: &mut W) -> Result<u64> {
    out.stream_position().map_err(WimError::Write)
}

/// Flags of the output entry for a stream written with compression type `out_ctype`.
///
/// The source's flags are carried over, with the compression bit owned by the writer: set when
/// the output form is chunk-encoded, clear otherwise.
pub(crate) fn output_entry_flags(
    stream_flags: ResourceFlags,
    out_ctype: CompressionType,
) -> ResourceFlags {
    let mut flags = stream_flags - ResourceFlags::COMPRESSED;
    if out_ctype != CompressionType::None {
        flags |= ResourceFlags::COMPRESSED;
    }
    flags
}

/// Writes one stream to the output at the current position.
///
/// The stored form depends on the stream and the requested compression type:
///
/// * empty streams produce no bytes at all;
/// * a stream whose source is already encoded with `out_ctype` is copied raw, without
///   re-encoding or digest verification, unless `RECOMPRESS` is set;
/// * `out_ctype == None` stores the bytes raw while digesting them;
/// * anything else is split into chunks, each chunk compressed (or stored raw when compression
///   does not shrink it), behind a chunk table.
///
/// If the chunk-encoded form ends up at least as large as the original, the resource is
/// rewritten uncompressed at the same offset and the file is truncated back, so a compressed
/// resource on disk is always strictly smaller than its input.
///
/// On success the stream's `out_entry` is updated and returned. The stream's reader is closed
/// in every case, success or error.
pub(crate) fn write_resource<W: WimOutput>(
    stream: &mut Stream,
    out: &mut W,
    out_ctype: CompressionType,
    flags: ResourceWriteFlags,
    adapters: &Adapters,
) -> Result<ResourceEntry> {
    let _span = trace_span!("write_resource", kind = stream.source().kind()).entered();

    let original_size = stream.size;
    let old_csize = stream.csize;
    let file_offset = tell(out)?;

    // Matching compression types mean the encoded bytes can be copied as they are.
    let raw = stream.ctype == out_ctype
        && out_ctype != CompressionType::None
        && !flags.contains(ResourceWriteFlags::RECOMPRESS);

    let bytes_total = if raw { old_csize } else { original_size };
    if bytes_total == 0 {
        let entry = ResourceEntry {
            offset: file_offset,
            ..ResourceEntry::default()
        };
        stream.out_entry = entry;
        return Ok(entry);
    }

    // Reading a compressed in-archive resource as plain data would mean decoding it, which
    // this writer does not do.
    if !raw && stream.ctype != CompressionType::None {
        return Err(WimError::InvalidParam(
            "cannot re-encode a compressed in-archive resource",
        ));
    }

    let result = write_resource_body(stream, out, out_ctype, file_offset, bytes_total, raw, adapters);
    stream.close_reader();
    let new_csize = result?;

    if !raw && out_ctype != CompressionType::None && new_csize >= original_size {
        // Compression made it bigger. Rewind and store the resource raw instead.
        debug!(
            new_csize,
            original_size, "compressed form not smaller; storing uncompressed"
        );
        return write_uncompressed_and_truncate(stream, out, file_offset, adapters);
    }

    let entry = ResourceEntry {
        offset: file_offset,
        size: new_csize,
        original_size,
        flags: output_entry_flags(stream.flags, out_ctype),
    };
    stream.out_entry = entry;
    Ok(entry)
}

/// The chunk loop of [`write_resource`]. Returns the encoded size of what was written.
fn write_resource_body<W: WimOutput>(
    stream: &mut Stream,
    out: &mut W,
    out_ctype: CompressionType,
    file_offset: u64,
    bytes_total: u64,
    raw: bool,
    adapters: &Adapters,
) -> Result<u64> {
    let chunked = out_ctype != CompressionType::None && !raw;
    let mut chunk_tab = if chunked {
        Some(ChunkTable::begin(out, bytes_total, file_offset).map_err(WimError::Write)?)
    } else {
        None
    };

    let mut sha = (!raw).then(Sha1::new);
    let mut buf = vec![0u8; WIM_CHUNK_SIZE.min(bytes_total as usize)];
    let mut cbuf = vec![0u8; WIM_CHUNK_SIZE];

    let mut offset = 0u64;
    let mut remaining = bytes_total;
    while remaining != 0 {
        let to_read = (WIM_CHUNK_SIZE as u64).min(remaining) as usize;
        let chunk = &mut buf[..to_read];
        stream.open_reader(adapters)?.read_at(offset, chunk)?;
        if let Some(sha) = sha.as_mut() {
            sha.update(&chunk[..]);
        }

        if let Some(tab) = chunk_tab.as_mut() {
            match compress_chunk(out_ctype, chunk, &mut cbuf[..to_read - 1]) {
                Some(n) => {
                    out.write_all(&cbuf[..n]).map_err(WimError::Write)?;
                    tab.record(n as u32);
                }
                None => {
                    out.write_all(chunk).map_err(WimError::Write)?;
                    tab.record(to_read as u32);
                }
            }
        } else {
            out.write_all(chunk).map_err(WimError::Write)?;
        }

        offset += to_read as u64;
        remaining -= to_read as u64;
    }

    if let Some(sha) = sha {
        stream.check_or_adopt_hash(sha.finalize().into())?;
    }

    match chunk_tab {
        Some(tab) => tab.finalize(out).map_err(WimError::Write),
        None => Ok(bytes_total),
    }
}

/// Rewinds to `file_offset`, rewrites the stream without compression, and truncates the output
/// so no stale encoded bytes trail the resource.
pub(crate) fn write_uncompressed_and_truncate<W: WimOutput>(
    stream: &mut Stream,
    out: &mut W,
    file_offset: u64,
    adapters: &Adapters,
) -> Result<ResourceEntry> {
    out.seek(SeekFrom::Start(file_offset)).map_err(WimError::Write)?;
    let entry = write_resource(
        stream,
        out,
        CompressionType::None,
        ResourceWriteFlags::empty(),
        adapters,
    )?;
    out.truncate_to(file_offset + stream.size).map_err(WimError::Write)?;
    out.seek(SeekFrom::Start(file_offset + stream.size))
        .map_err(WimError::Write)?;
    Ok(entry)
}
