//! Writing a complete archive: the stream-list driver, the trailing tables, and the public
//! [`Wim::write`] entry point.

use crate::compress::CompressionType;
use crate::error::{Result, WimError};
use crate::header::ResourceEntry;
use crate::integrity::write_integrity_table;
use crate::lookup::write_lookup_table;
use crate::pipeline::write_stream_list_parallel;
use crate::progress::{Progress, ProgressEvent, WriteStreamsProgress};
use crate::resource::{write_resource, ResourceWriteFlags};
use crate::source::Adapters;
use crate::stream::Stream;
use crate::xml::write_xml_data;
use crate::{ImageSelector, Wim, WimOutput};
use std::fs::File;
use std::io::{Read, SeekFrom};
use std::path::Path;
use tracing::{debug, debug_span, warn};

bitflags::bitflags! {
    /// Flags accepted by [`Wim::write`] and [`Wim::overwrite`].
    ///
    /// The first six bits are the public surface; the remaining bits are reserved for the
    /// writer's own use and are masked off at the public entry points.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct WriteFlags: u32 {
        /// Append an integrity table.
        const CHECK_INTEGRITY = 0x0000_0001;
        /// Deliver progress notifications for long computations.
        const SHOW_PROGRESS = 0x0000_0002;
        /// Re-encode streams even when their stored compression matches the output's.
        const RECOMPRESS = 0x0000_0004;
        /// Flush and sync the output file before closing it.
        const FSYNC = 0x0000_0008;
        /// Keep deleted images' data in place when overwriting, allowing the in-place
        /// strategy.
        const SOFT_DELETE = 0x0000_0010;
        /// Force [`Wim::overwrite`] to rebuild through a temporary file.
        const REBUILD = 0x0000_0020;

        /// Keep the existing lookup table instead of writing a new one.
        const NO_LOOKUP_TABLE = 0x0001_0000;
        /// Carry digests over from the existing integrity table where the data is unchanged.
        const REUSE_INTEGRITY_TABLE = 0x0002_0000;
        /// Write a temporary header and flush after the XML data, before computing the
        /// integrity table.
        const CHECKPOINT_AFTER_XML = 0x0004_0000;
    }
}

impl WriteFlags {
    pub(crate) fn public(self) -> Self {
        self & (Self::CHECK_INTEGRITY
            | Self::SHOW_PROGRESS
            | Self::RECOMPRESS
            | Self::FSYNC
            | Self::SOFT_DELETE
            | Self::REBUILD)
    }

    pub(crate) fn resource_flags(self) -> ResourceWriteFlags {
        if self.contains(Self::RECOMPRESS) {
            ResourceWriteFlags::RECOMPRESS
        } else {
            ResourceWriteFlags::empty()
        }
    }
}

/// The parallel pipeline is only worth its setup cost past this many bytes of data to
/// compress.
const PARALLEL_COMPRESSION_THRESHOLD: u64 = 1_000_000;

/// Writes every stream in `list`, choosing between the serial writer and the parallel
/// pipeline.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_stream_list<W: WimOutput>(
    streams: &mut [Stream],
    list: &[usize],
    out: &mut W,
    out_ctype: CompressionType,
    write_flags: WriteFlags,
    num_threads: u32,
    progress: &mut Progress<'_>,
    adapters: &Adapters,
) -> Result<()> {
    let _span = debug_span!("write_stream_list", streams = list.len()).entered();
    let flags = write_flags.resource_flags();

    let mut total_bytes = 0u64;
    let mut compression_bytes = 0u64;
    for &idx in list {
        let stream = &streams[idx];
        total_bytes += stream.size;
        if out_ctype != CompressionType::None
            && (stream.ctype != out_ctype || write_flags.contains(WriteFlags::RECOMPRESS))
        {
            compression_bytes += stream.size;
        }
    }

    let mut info = WriteStreamsProgress {
        total_bytes,
        total_streams: list.len() as u64,
        completed_bytes: 0,
        completed_streams: 0,
        num_threads,
        compression: out_ctype,
    };

    if compression_bytes >= PARALLEL_COMPRESSION_THRESHOLD && num_threads != 1 {
        let resolved = if num_threads == 0 {
            match std::thread::available_parallelism() {
                Ok(n) => n.get(),
                Err(err) => {
                    warn!(%err, "could not determine the processor count; compressing serially");
                    return write_stream_list_serial(
                        streams, list, out, out_ctype, flags, &mut info, progress, adapters,
                    );
                }
            }
        } else {
            num_threads as usize
        };

        info.num_threads = resolved as u32;
        progress.emit(ProgressEvent::WriteStreams(&info));
        match write_stream_list_parallel(
            streams, list, out, out_ctype, flags, resolved, &mut info, progress, adapters,
        ) {
            Err(WimError::OutOfMemory) => {
                warn!("falling back to single-threaded compression");
            }
            other => return other,
        }
    }

    write_stream_list_serial(streams, list, out, out_ctype, flags, &mut info, progress, adapters)
}

#[allow(clippy::too_many_arguments)]
fn write_stream_list_serial<W: WimOutput>(
    streams: &mut [Stream],
    list: &[usize],
    out: &mut W,
    out_ctype: CompressionType,
    flags: ResourceWriteFlags,
    info: &mut WriteStreamsProgress,
    progress: &mut Progress<'_>,
    adapters: &Adapters,
) -> Result<()> {
    info.num_threads = 1;
    progress.emit(ProgressEvent::WriteStreams(info));
    // Resume where the parallel attempt left off, if there was one.
    for &idx in &list[info.completed_streams as usize..] {
        write_resource(&mut streams[idx], out, out_ctype, flags, adapters)?;
        info.completed_bytes += streams[idx].size;
        info.completed_streams += 1;
        progress.emit(ProgressEvent::WriteStreams(info));
    }
    Ok(())
}

impl Wim {
    /// Builds the list of stream indices to write for the selected images and rebuilds the
    /// output reference counts.
    ///
    /// Per-image reference lists drive the count. Streams known only through the archive's
    /// lookup table (an opened archive's reference lists are empty, since metadata trees are
    /// not parsed) are carried by their recorded reference counts when every image is being
    /// written.
    pub(crate) fn prepare_stream_list(&mut self, image: ImageSelector) -> Vec<usize> {
        for stream in self.lookup.streams_mut() {
            stream.out_refcnt = 0;
            stream.out_entry = ResourceEntry::default();
        }

        let mut list = Vec::new();
        for image_index in self.selected_images(image) {
            for &sidx in &self.images[image_index].stream_refs {
                let stream = self.lookup.get_mut(sidx);
                if stream.out_refcnt == 0 {
                    list.push(sidx);
                }
                stream.out_refcnt += 1;
            }
            self.lookup.get_mut(self.images[image_index].metadata).out_refcnt = 1;
        }

        if image == ImageSelector::All {
            for index in 0..self.lookup.len() {
                let stream = self.lookup.get_mut(index);
                if stream.out_refcnt == 0 && stream.refcnt != 0 && !stream.is_metadata() {
                    stream.out_refcnt = stream.refcnt;
                    list.push(index);
                }
            }
        }
        list
    }

    /// Opens the destination and writes the placeholder header. Reading back is needed when an
    /// integrity table will be computed over the file.
    pub(crate) fn begin_write(&self, path: &Path, flags: WriteFlags) -> Result<File> {
        let mut options = File::options();
        options.write(true).create(true).truncate(true);
        if flags.contains(WriteFlags::CHECK_INTEGRITY) {
            options.read(true);
        }
        let mut out = options.open(path).map_err(|source| WimError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        self.hdr.write_to(&mut out).map_err(WimError::Write)?;
        Ok(out)
    }

    /// Writes the trailing tables and commits the archive by rewriting the header.
    ///
    /// Order is fixed: lookup table, XML data, optional checkpoint header, optional integrity
    /// table, final header. Nothing before the final header write changes the validity of an
    /// existing archive being updated in place.
    pub(crate) fn finish_write<W: WimOutput + Read>(
        &mut self,
        out: &mut W,
        image: ImageSelector,
        flags: WriteFlags,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let _span = debug_span!("finish_write").entered();
        let mut hdr = self.hdr.clone();

        let images: Vec<&crate::ImageInfo> = self
            .selected_images(image)
            .map(|i| &self.images[i])
            .collect();

        if !flags.contains(WriteFlags::NO_LOOKUP_TABLE) {
            hdr.lookup_table = write_lookup_table(&self.lookup, &images, out)?;
        }

        let total_bytes = if flags.contains(WriteFlags::NO_LOOKUP_TABLE) {
            self.xml.total_bytes
        } else {
            self.lookup.total_output_bytes()
        };
        let reuse_raw = flags.contains(WriteFlags::NO_LOOKUP_TABLE);
        hdr.xml_data = write_xml_data(&self.xml, &images, total_bytes, reuse_raw, out)?;

        if flags.contains(WriteFlags::CHECK_INTEGRITY) {
            if flags.contains(WriteFlags::CHECKPOINT_AFTER_XML) {
                // A crash while the integrity table is being computed must still leave a
                // readable archive, just one without an integrity table.
                let mut checkpoint = hdr.clone();
                checkpoint.integrity = ResourceEntry::default();
                finalize_boot_entries(&mut checkpoint, self, image);
                out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
                checkpoint.write_to(out).map_err(WimError::Write)?;
                out.flush().map_err(WimError::Write)?;
                out.seek(SeekFrom::End(0)).map_err(WimError::Write)?;
                debug!("wrote checkpoint header");
            }

            let old_lookup_end = if flags.contains(WriteFlags::REUSE_INTEGRITY_TABLE) {
                self.hdr.lookup_table.end()
            } else {
                0
            };
            hdr.integrity = write_integrity_table(
                out,
                hdr.lookup_table.end(),
                old_lookup_end,
                self.integrity.as_ref(),
                progress,
            )?;
        } else {
            hdr.integrity = ResourceEntry::default();
        }

        finalize_boot_entries(&mut hdr, self, image);

        out.seek(SeekFrom::Start(0)).map_err(WimError::Write)?;
        hdr.write_to(out).map_err(WimError::Write)?;

        if flags.contains(WriteFlags::FSYNC) {
            out.flush().map_err(WimError::Write)?;
            out.sync_data().map_err(WimError::Write)?;
        }

        self.xml.total_bytes = total_bytes;
        Ok(())
    }

    /// Writes the selected images and every stream they reference into a new archive at
    /// `path`.
    ///
    /// `num_threads` controls the compression pipeline: 0 means one worker per processor, 1
    /// forces the serial path. The progress callback, if any, receives
    /// [`ProgressEvent`](crate::ProgressEvent) notifications throughout.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        image: ImageSelector,
        flags: WriteFlags,
        num_threads: u32,
        progress_cb: Option<&mut dyn FnMut(ProgressEvent<'_>)>,
    ) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(WimError::InvalidParam("output path is empty"));
        }
        self.validate_image(image)?;
        if self.hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported);
        }

        let mut progress = Progress::new(progress_cb);
        self.write_new(path, image, flags.public(), num_threads, &mut progress)
    }

    pub(crate) fn write_new(
        &mut self,
        path: &Path,
        image: ImageSelector,
        flags: WriteFlags,
        num_threads: u32,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let _span = debug_span!("write_new", ?path).entered();

        let mut out = self.begin_write(path, flags)?;
        let list = self.prepare_stream_list(image);
        let out_ctype = self.compression_type();

        write_stream_list(
            self.lookup.streams_mut(),
            &list,
            &mut out,
            out_ctype,
            flags,
            num_threads,
            progress,
            &self.adapters,
        )?;
        for &idx in &list {
            // Digests adopted during the write become usable for deduplication.
            self.lookup.index_hash(idx);
        }

        progress.emit(ProgressEvent::WriteMetadataBegin);
        for image_index in self.selected_images(image) {
            let metadata = self.images[image_index].metadata;
            write_resource(
                self.lookup.get_mut(metadata),
                &mut out,
                out_ctype,
                flags.resource_flags(),
                &self.adapters,
            )?;
        }
        progress.emit(ProgressEvent::WriteMetadataEnd);

        self.finish_write(&mut out, image, flags, progress)
    }
}

/// Sets the image count, boot index, and boot metadata entry for the images actually written.
fn finalize_boot_entries(hdr: &mut crate::Header, wim: &Wim, image: ImageSelector) {
    match image {
        ImageSelector::All => {
            hdr.image_count = wim.images.len() as u32;
        }
        ImageSelector::Index(n) => {
            hdr.image_count = 1;
            hdr.boot_idx = if wim.hdr.boot_idx == n { 1 } else { 0 };
        }
    }

    let range = wim.selected_images(image);
    if hdr.boot_idx == 0 || hdr.boot_idx as usize > range.len() {
        hdr.boot_idx = 0;
        hdr.boot_metadata = ResourceEntry::default();
    } else {
        let boot_image = &wim.images[range.start + hdr.boot_idx as usize - 1];
        hdr.boot_metadata = wim.lookup.get(boot_image.metadata).out_entry;
    }
}
