//! The chunk compressor contract.
//!
//! Compressors are pure functions over in-memory buffers: `input` is one chunk of at most
//! [`WIM_CHUNK_SIZE`](crate::WIM_CHUNK_SIZE) bytes, `output` is a caller-owned buffer of
//! `input.len() - 1` bytes. A chunk that cannot be encoded into fewer bytes than its input is a
//! normal outcome, not an error; the writer stores such chunks raw.

use flate2::{Compress, Compression, FlushCompress, Status};

/// Per-archive compression algorithm.
///
/// The algorithm is selected when the archive is created and recorded in the header flags;
/// every compressed resource in one archive uses the same algorithm.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum CompressionType {
    /// Resources are stored raw.
    #[default]
    None,
    /// XPRESS: the faster, lighter algorithm.
    Xpress,
    /// LZX: the denser, slower algorithm.
    Lzx,
}

/// Header flag: the archive's resources are compressed.
pub(crate) const HDR_FLAG_COMPRESSION: u32 = 0x0000_0002;
/// Header flag: chunks are encoded with XPRESS.
pub(crate) const HDR_FLAG_COMPRESS_XPRESS: u32 = 0x0002_0000;
/// Header flag: chunks are encoded with LZX.
pub(crate) const HDR_FLAG_COMPRESS_LZX: u32 = 0x0004_0000;

impl CompressionType {
    pub(crate) fn to_header_flags(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Xpress => HDR_FLAG_COMPRESSION | HDR_FLAG_COMPRESS_XPRESS,
            Self::Lzx => HDR_FLAG_COMPRESSION | HDR_FLAG_COMPRESS_LZX,
        }
    }

    pub(crate) fn from_header_flags(flags: u32) -> Self {
        if flags & HDR_FLAG_COMPRESSION == 0 {
            Self::None
        } else if flags & HDR_FLAG_COMPRESS_LZX != 0 {
            Self::Lzx
        } else {
            Self::Xpress
        }
    }

    /// The encoder level behind each codec id. XPRESS trades ratio for speed, LZX the reverse.
    fn level(self) -> Compression {
        match self {
            Self::None => unreachable!("raw resources are not chunk-encoded"),
            Self::Xpress => Compression::fast(),
            Self::Lzx => Compression::best(),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Xpress => "XPRESS",
            Self::Lzx => "LZX",
        })
    }
}

/// Compresses one chunk.
///
/// Returns `Some(encoded_len)` when the chunk fits in `output` (which the writer sizes to
/// `input.len() - 1` bytes), or `None` when it does not. `None` is the routine outcome for
/// incompressible data and never indicates a failure.
///
/// Encoding is deterministic: the same input with the same `ctype` always yields the same
/// bytes, which is what makes repeated writes of an archive byte-identical.
pub(crate) fn compress_chunk(
    ctype: CompressionType,
    input: &[u8],
    output: &mut [u8],
) -> Option<usize> {
    debug_assert!(!input.is_empty());
    if output.is_empty() {
        return None;
    }
    debug_assert!(output.len() >= input.len() - 1);
    let budget = input.len() - 1;

    let mut enc = Compress::new(ctype.level(), false);
    loop {
        let in_pos = enc.total_in() as usize;
        let out_pos = enc.total_out() as usize;
        if out_pos >= budget {
            return None;
        }
        let status = enc
            .compress(
                &input[in_pos..],
                &mut output[out_pos..budget],
                FlushCompress::Finish,
            )
            .ok()?;
        match status {
            Status::StreamEnd => {
                let n = enc.total_out() as usize;
                return (n <= budget).then_some(n);
            }
            // Output budget exhausted, or no forward progress possible within it.
            Status::Ok if enc.total_out() as usize >= budget => return None,
            Status::Ok => continue,
            Status::BufError => return None,
        }
    }
}
