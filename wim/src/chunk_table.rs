//! The per-resource chunk table.
//!
//! A compressed resource begins with an array of cumulative chunk offsets, followed by the
//! encoded chunks themselves. Offsets are relative to the end of the table; the first offset is
//! always zero and is not stored, so the table holds `num_chunks - 1` entries. Entries are 4
//! bytes wide, or 8 when the uncompressed resource size needs more than 32 bits.
//!
//! The table's on-disk size is known before any chunk is encoded, so the writer reserves the
//! space up front, appends chunks behind it, and seeks back to fill in the offsets once every
//! encoded chunk size is known.

use crate::WIM_CHUNK_SIZE;
use std::io::{Seek, SeekFrom, Write};

/// Builder for one resource's chunk table.
pub(crate) struct ChunkTable {
    /// Archive offset of the reserved table, for the rewind in [`ChunkTable::finalize`].
    file_offset: u64,
    num_chunks: u64,
    bytes_per_entry: u64,
    table_disk_size: u64,
    /// Cumulative start offsets, one per recorded chunk. `offsets[0]` is always 0.
    offsets: Vec<u64>,
    /// Running total of encoded chunk bytes.
    cur_offset: u64,
}

impl ChunkTable {
    /// Computes the table geometry for a resource of `original_size` bytes and reserves
    /// `table_disk_size` bytes at the current output position.
    ///
    /// The reserved bytes are filled with zeroes; their content does not matter until
    /// [`ChunkTable::finalize`] overwrites them.
    pub(crate) fn begin<W: Write + Seek>(
        out: &mut W,
        original_size: u64,
        file_offset: u64,
    ) -> std::io::Result<Self> {
        debug_assert!(original_size != 0, "empty resources have no chunk table");
        let num_chunks = original_size.div_ceil(WIM_CHUNK_SIZE as u64);
        let bytes_per_entry: u64 = if original_size >= 1 << 32 { 8 } else { 4 };
        let table_disk_size = bytes_per_entry * (num_chunks - 1);

        if table_disk_size != 0 {
            out.write_all(&vec![0u8; table_disk_size as usize])?;
        }

        Ok(Self {
            file_offset,
            num_chunks,
            bytes_per_entry,
            table_disk_size,
            offsets: Vec::with_capacity(num_chunks as usize),
            cur_offset: 0,
        })
    }

    /// Records the encoded size of the next chunk. Must be called exactly once per chunk, in
    /// chunk order.
    pub(crate) fn record(&mut self, encoded_chunk_size: u32) {
        debug_assert!((self.offsets.len() as u64) < self.num_chunks);
        self.offsets.push(self.cur_offset);
        self.cur_offset += u64::from(encoded_chunk_size);
    }

    /// Seeks back to the reserved space, serializes offsets `1..num_chunks`, returns to the end
    /// of the output, and reports the total encoded size of the resource (table included).
    pub(crate) fn finalize<W: Write + Seek>(&self, out: &mut W) -> std::io::Result<u64> {
        assert_eq!(self.offsets.len() as u64, self.num_chunks);

        if self.table_disk_size != 0 {
            out.seek(SeekFrom::Start(self.file_offset))?;
            let mut table = Vec::with_capacity(self.table_disk_size as usize);
            for &offset in &self.offsets[1..] {
                if self.bytes_per_entry == 8 {
                    table.extend_from_slice(&offset.to_le_bytes());
                } else {
                    table.extend_from_slice(&(offset as u32).to_le_bytes());
                }
            }
            out.write_all(&table)?;
            out.seek(SeekFrom::End(0))?;
        }

        Ok(self.cur_offset + self.table_disk_size)
    }

    pub(crate) fn num_chunks(&self) -> u64 {
        self.num_chunks
    }
}

/// Uncompressed length of chunk `index` in a resource of `original_size` bytes. Every chunk
/// except the last is exactly [`WIM_CHUNK_SIZE`].
pub(crate) fn chunk_span(original_size: u64, index: u64, num_chunks: u64) -> usize {
    if index + 1 == num_chunks {
        let rem = original_size % WIM_CHUNK_SIZE as u64;
        if rem == 0 {
            WIM_CHUNK_SIZE
        } else {
            rem as usize
        }
    } else {
        WIM_CHUNK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn single_chunk_has_no_table() {
        let mut out = Cursor::new(Vec::new());
        let mut tab = ChunkTable::begin(&mut out, 100, 0).unwrap();
        assert_eq!(tab.num_chunks(), 1);
        assert_eq!(out.get_ref().len(), 0, "no bytes reserved");

        tab.record(42);
        let total = tab.finalize(&mut out).unwrap();
        assert_eq!(total, 42);
        assert_eq!(out.get_ref().len(), 0, "nothing serialized");
    }

    #[test]
    fn two_chunks_serialize_one_entry() {
        let mut out = Cursor::new(Vec::new());
        let size = WIM_CHUNK_SIZE as u64 + 1;
        let mut tab = ChunkTable::begin(&mut out, size, 0).unwrap();
        assert_eq!(tab.num_chunks(), 2);
        assert_eq!(out.get_ref().len(), 4, "one 4-byte entry reserved");

        out.seek(SeekFrom::End(0)).unwrap();
        out.write_all(&[0xEE; 777]).unwrap();
        tab.record(777);
        out.write_all(&[0xEE; 5]).unwrap();
        tab.record(5);

        let total = tab.finalize(&mut out).unwrap();
        assert_eq!(total, 4 + 777 + 5);

        // The stored entry is the cumulative offset of chunk 1, which equals the encoded size
        // of chunk 0.
        let table = &out.get_ref()[..4];
        assert_eq!(u32::from_le_bytes(table.try_into().unwrap()), 777);
        // Finalize leaves the position at the end.
        assert_eq!(out.stream_position().unwrap(), out.get_ref().len() as u64);
    }

    #[test]
    fn wide_entries_for_huge_resources() {
        let mut out = Cursor::new(Vec::new());
        let size = 1u64 << 32;
        let tab = ChunkTable::begin(&mut out, size, 0).unwrap();
        assert_eq!(tab.bytes_per_entry, 8);
        let chunks = size.div_ceil(WIM_CHUNK_SIZE as u64);
        assert_eq!(out.get_ref().len() as u64, (chunks - 1) * 8);
    }

    #[test]
    fn chunk_span_covers_tail() {
        assert_eq!(chunk_span(100, 0, 1), 100);
        assert_eq!(chunk_span(WIM_CHUNK_SIZE as u64, 0, 1), WIM_CHUNK_SIZE);
        let two = WIM_CHUNK_SIZE as u64 + 1;
        assert_eq!(chunk_span(two, 0, 2), WIM_CHUNK_SIZE);
        assert_eq!(chunk_span(two, 1, 2), 1);
    }
}
