//! Updating an archive in place, or rebuilding it through a temporary file.
//!
//! An archive's body is immutable history: streams are never moved or rewritten. An in-place
//! update appends new streams after the end of the previous archive, writes new trailing
//! tables after them, and finally rewrites the header. Until that last write the file is
//! byte-for-byte the previous valid archive plus ignorable tail data, so recovery from an
//! interrupted update is a truncation. The cost is a hole where the previous trailing tables
//! were; a rebuild through a temporary file reclaims it.

use crate::error::{Result, WimError};
use crate::progress::{Progress, ProgressEvent};
use crate::source::StreamSource;
use crate::write::{write_stream_list, WriteFlags};
use crate::{ImageSelector, Wim, WimOutput};
use fs2::FileExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_file::RandomAccessFile;
use tracing::{debug, debug_span, warn};

impl Wim {
    /// Writes all pending changes back to the archive's own file.
    ///
    /// The default strategy appends in place. A rebuild through a temporary file is used
    /// instead when the caller asks for it ([`WriteFlags::REBUILD`]), when an image was
    /// deleted without [`WriteFlags::SOFT_DELETE`], or when the archive's layout rules out a
    /// safe append.
    pub fn overwrite(
        &mut self,
        flags: WriteFlags,
        num_threads: u32,
        progress_cb: Option<&mut dyn FnMut(ProgressEvent<'_>)>,
    ) -> Result<()> {
        let flags = flags.public();
        if self.filename.is_none() {
            return Err(WimError::NoFilename);
        }
        if self.hdr.total_parts != 1 {
            return Err(WimError::SplitUnsupported);
        }

        let mut progress = Progress::new(progress_cb);

        let inplace_allowed = (!self.deletion_occurred
            || flags.contains(WriteFlags::SOFT_DELETE))
            && !flags.contains(WriteFlags::REBUILD);
        if inplace_allowed {
            match self.overwrite_inplace(flags, num_threads, &mut progress) {
                Err(WimError::ResourceOrder(reason)) => {
                    warn!(reason, "cannot append in place; rebuilding the archive");
                }
                other => return other,
            }
        }
        self.overwrite_via_tmpfile(flags, num_threads, &mut progress)
    }

    /// Appends new streams and trailing tables past the previous end of the archive.
    fn overwrite_inplace(
        &mut self,
        mut flags: WriteFlags,
        num_threads: u32,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let path = self.filename.clone().expect("checked by overwrite");
        let _span = debug_span!("overwrite_inplace", ?path).entered();

        // The append point is computed from the trailing tables, so anything stored after the
        // XML data (other than the integrity table) would be clobbered.
        if self.hdr.integrity.is_present()
            && self.hdr.integrity.offset < self.hdr.xml_data.offset
        {
            return Err(WimError::ResourceOrder(
                "integrity table lies before the XML data",
            ));
        }
        if self.hdr.lookup_table.offset > self.hdr.xml_data.offset {
            return Err(WimError::ResourceOrder("lookup table lies after the XML data"));
        }

        let mut old_end = if self.hdr.integrity.is_present() {
            self.hdr.integrity.end()
        } else {
            self.hdr.xml_data.end()
        };

        let any_modified = self.images.iter().any(|image| image.modified);
        if !any_modified && !self.deletion_occurred {
            // Stream set and metadata are unchanged; only the XML (and integrity table) need
            // rewriting, over the spot where the old ones were.
            old_end = self.hdr.lookup_table.end();
            flags |= WriteFlags::NO_LOOKUP_TABLE | WriteFlags::CHECKPOINT_AFTER_XML;
        }

        let list = self.prepare_overwrite_streams(old_end)?;

        let mut options = File::options();
        options.read(true).write(true);
        let mut out = options.open(&path).map_err(|source| WimError::Open {
            path: path.clone(),
            source,
        })?;
        lock_archive(&out, &path)?;

        out.seek(SeekFrom::Start(old_end)).map_err(WimError::Write)?;
        let result = self.overwrite_inplace_body(&mut out, &list, flags, num_threads, progress);
        if result.is_err() && !flags.contains(WriteFlags::NO_LOOKUP_TABLE) {
            warn!(old_end, "restoring the archive to its previous size");
            // Failure disposition only; the error that gets reported is the original one.
            let _ = out.truncate_to(old_end);
        }
        result
    }

    fn overwrite_inplace_body(
        &mut self,
        out: &mut File,
        list: &[usize],
        flags: WriteFlags,
        num_threads: u32,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        if !list.is_empty() {
            debug!(streams = list.len(), "writing newly added streams");
            write_stream_list(
                self.lookup.streams_mut(),
                list,
                out,
                self.hdr.compression_type(),
                flags,
                num_threads,
                progress,
                &self.adapters,
            )?;
            for &idx in list {
                self.lookup.index_hash(idx);
            }
        }

        // Metadata resources are rewritten from the first modified image onward, so that
        // image indices in the new lookup table stay contiguous with the old layout.
        let mut rewriting = false;
        progress.emit(ProgressEvent::WriteMetadataBegin);
        for image_index in 0..self.images.len() {
            rewriting = rewriting || self.images[image_index].modified;
            if rewriting {
                let metadata = self.images[image_index].metadata;
                crate::resource::write_resource(
                    self.lookup.get_mut(metadata),
                    out,
                    self.hdr.compression_type(),
                    flags.resource_flags(),
                    &self.adapters,
                )?;
            }
        }
        progress.emit(ProgressEvent::WriteMetadataEnd);

        self.finish_write(
            out,
            ImageSelector::All,
            flags | WriteFlags::REUSE_INTEGRITY_TABLE,
            progress,
        )
    }

    /// Output reference counts and entries for an in-place update, plus the list of streams
    /// that must be appended: everything not already stored in this archive.
    ///
    /// A stream already in the archive but extending past `old_end` means the previous update
    /// left data where the trailing tables belong; appending cannot handle that layout.
    fn prepare_overwrite_streams(&mut self, old_end: u64) -> Result<Vec<usize>> {
        let mut list = Vec::new();
        for index in 0..self.lookup.len() {
            let stream = self.lookup.get_mut(index);
            stream.out_refcnt = stream.refcnt;
            match &stream.source {
                StreamSource::InArchive { entry, .. } => {
                    if entry.end() > old_end {
                        return Err(WimError::ResourceOrder(
                            "a resource lies after the trailing tables",
                        ));
                    }
                    stream.out_entry = *entry;
                }
                _ => {
                    stream.out_entry = Default::default();
                    if !stream.is_metadata() {
                        list.push(index);
                    }
                }
            }
        }
        Ok(list)
    }

    /// Writes a complete new archive beside the original and atomically renames it into
    /// place.
    fn overwrite_via_tmpfile(
        &mut self,
        flags: WriteFlags,
        num_threads: u32,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let path = self.filename.clone().expect("checked by overwrite");
        let _span = debug_span!("overwrite_via_tmpfile", ?path).entered();

        let tmp_path = random_suffix_path(&path);
        let write_result = self.write_new(
            &tmp_path,
            ImageSelector::All,
            flags | WriteFlags::FSYNC,
            num_threads,
            progress,
        );
        if let Err(err) = write_result {
            if let Err(unlink_err) = std::fs::remove_file(&tmp_path) {
                warn!(?tmp_path, %unlink_err, "failed to remove temporary file");
            }
            return Err(err);
        }

        // Some platforms refuse to rename over a file that is still open.
        #[cfg(windows)]
        {
            self.file = None;
        }

        if let Err(source) = std::fs::rename(&tmp_path, &path) {
            // The temporary file holds a complete, valid archive; leave it for inspection.
            return Err(WimError::Rename {
                from: tmp_path,
                to: path,
                source,
            });
        }
        progress.emit(ProgressEvent::Rename {
            from: &tmp_path,
            to: &path,
        });

        self.file = None;
        match File::open(&path) {
            Ok(file) => {
                self.file = Some(Arc::new(RandomAccessFile::from(file)));
                Ok(())
            }
            Err(source) => Err(WimError::Reopen { path, source }),
        }
    }
}

/// Takes the advisory exclusive lock that serializes writers of one archive.
///
/// Held until `file` is closed. Lock contention is fatal for this attempt; any other locking
/// failure is logged and ignored, matching filesystems that do not support advisory locks.
fn lock_archive(file: &File, path: &Path) -> Result<()> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            Err(WimError::AlreadyLocked {
                path: path.to_path_buf(),
            })
        }
        Err(err) => {
            warn!(?path, %err, "could not lock the archive; continuing without a lock");
            Ok(())
        }
    }
}

/// `<path>` with 9 random alphanumeric characters appended, in the same directory so the final
/// rename stays on one filesystem.
fn random_suffix_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmpfile_path_shape() {
        let p = random_suffix_path(Path::new("/tmp/archive.wim"));
        let s = p.to_string_lossy();
        assert!(s.starts_with("/tmp/archive.wim."));
        assert_eq!(s.len(), "/tmp/archive.wim.".len() + 9);
    }

    #[test]
    fn overwrite_without_filename_fails() {
        let mut wim = Wim::new(crate::CompressionType::None);
        assert!(matches!(
            wim.overwrite(WriteFlags::empty(), 1, None),
            Err(WimError::NoFilename)
        ));
    }
}
