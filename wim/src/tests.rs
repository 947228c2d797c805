use super::*;
use crate::header::ResourceFlags;
use crate::resource::{write_resource, ResourceWriteFlags};
use crate::source::Adapters;
use crate::stream::Stream;
use anyhow::Result;
use sha1::{Digest, Sha1};
use std::io::Read;
use tempfile::TempDir;

/// Enables log output for a test when it needs debugging.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Test-side decoder for one resource: parses the chunk table, inflates compressed chunks,
/// and checks the offset invariants along the way.
fn read_resource(archive: &[u8], entry: &ResourceEntry) -> Vec<u8> {
    let start = entry.offset as usize;
    let stored = &archive[start..start + entry.size as usize];
    if !entry.flags.contains(ResourceFlags::COMPRESSED) {
        assert_eq!(entry.size, entry.original_size);
        return stored.to_vec();
    }

    assert!(
        entry.size < entry.original_size,
        "a compressed resource is strictly smaller than its input"
    );

    let num_chunks = entry.original_size.div_ceil(WIM_CHUNK_SIZE as u64) as usize;
    let bytes_per_entry = if entry.original_size >= 1 << 32 { 8 } else { 4 };
    let table_size = (num_chunks - 1) * bytes_per_entry;
    let body = &stored[table_size..];

    let mut offsets = vec![0u64];
    for raw in stored[..table_size].chunks_exact(bytes_per_entry) {
        let offset = if bytes_per_entry == 8 {
            u64::from_le_bytes(raw.try_into().unwrap())
        } else {
            u64::from(u32::from_le_bytes(raw.try_into().unwrap()))
        };
        assert!(offset >= *offsets.last().unwrap(), "offsets never decrease");
        assert!(offset < body.len() as u64, "offsets stay inside the body");
        offsets.push(offset);
    }
    assert_eq!(offsets.len(), num_chunks);

    let mut data = Vec::with_capacity(entry.original_size as usize);
    for i in 0..num_chunks {
        let lo = offsets[i] as usize;
        let hi = if i + 1 < num_chunks {
            offsets[i + 1] as usize
        } else {
            body.len()
        };
        let encoded = &body[lo..hi];

        let span = crate::chunk_table::chunk_span(entry.original_size, i as u64, num_chunks as u64);
        if encoded.len() == span {
            // Stored raw: compression would not have shrunk this chunk.
            data.extend_from_slice(encoded);
        } else {
            assert!(encoded.len() < span);
            let mut chunk = Vec::with_capacity(span);
            flate2::read::DeflateDecoder::new(encoded)
                .read_to_end(&mut chunk)
                .expect("chunk inflates");
            assert_eq!(chunk.len(), span);
            data.extend_from_slice(&chunk);
        }
    }
    assert_eq!(data.len() as u64, entry.original_size);
    data
}

fn patterned(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32).map(|i| ((i * 31 + seed * 7) % 250) as u8).collect()
}

fn sha(data: &[u8]) -> [u8; SHA1_HASH_SIZE] {
    Sha1::digest(data).into()
}

/// Builds a one-image archive over the given stream contents and writes it to `path`.
fn build_archive(
    path: &std::path::Path,
    ctype: CompressionType,
    contents: &[Vec<u8>],
    flags: WriteFlags,
    num_threads: u32,
) -> Wim {
    let mut wim = Wim::new(ctype);
    let image = wim.add_image("test image", patterned(600, 99));
    for data in contents {
        let idx = wim.add_stream(Stream::from_bytes(data.clone()));
        wim.reference_stream(image, idx).unwrap();
    }
    wim.write(path, ImageSelector::All, flags, num_threads, None)
        .unwrap();
    wim
}

/// Looks up the in-archive resource entry for the given contents in a reopened archive.
fn entry_of(wim: &Wim, data: &[u8]) -> ResourceEntry {
    let hash = sha(data);
    for stream in wim.lookup.streams() {
        if *stream.hash() == hash {
            if let source::StreamSource::InArchive { entry, .. } = stream.source() {
                return *entry;
            }
        }
    }
    panic!("stream not found in reopened archive");
}

#[test]
fn empty_stream_has_zeroed_entry_at_header_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("empty.wim");
    build_archive(&path, CompressionType::Lzx, &[Vec::new()], WriteFlags::empty(), 1);

    let wim = Wim::open(&path).unwrap();
    let entry = entry_of(&wim, &[]);
    assert_eq!(entry.offset, WIM_HEADER_DISK_SIZE as u64);
    assert_eq!(entry.size, 0);
    assert_eq!(entry.original_size, 0);
    assert_eq!(entry.flags, ResourceFlags::empty());
}

#[test]
fn small_chunk_compresses_behind_no_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("small.wim");
    let data = vec![0xAAu8; 100];
    build_archive(&path, CompressionType::Lzx, &[data.clone()], WriteFlags::empty(), 1);

    let bytes = std::fs::read(&path).unwrap();
    let wim = Wim::open(&path).unwrap();
    let entry = entry_of(&wim, &data);
    assert_eq!(entry.offset, WIM_HEADER_DISK_SIZE as u64);
    assert!(entry.flags.contains(ResourceFlags::COMPRESSED));
    assert!(entry.size < 100);
    assert_eq!(read_resource(&bytes, &entry), data);
}

#[test]
fn two_chunk_table_holds_first_chunk_size() {
    let data = patterned(WIM_CHUNK_SIZE + 1, 3);
    let mut stream = Stream::from_bytes(data.clone());
    let mut out = std::io::Cursor::new(Vec::new());
    let entry = write_resource(
        &mut stream,
        &mut out,
        CompressionType::Xpress,
        ResourceWriteFlags::empty(),
        &Adapters::default(),
    )
    .unwrap();
    let bytes = out.into_inner();

    assert!(entry.flags.contains(ResourceFlags::COMPRESSED));
    // Two chunks, narrow entries: the serialized table is one 4-byte offset, which equals the
    // encoded size of chunk 0.
    let chunk0_size = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    assert!(chunk0_size < WIM_CHUNK_SIZE);

    let mut chunk0 = Vec::new();
    flate2::read::DeflateDecoder::new(&bytes[4..4 + chunk0_size])
        .read_to_end(&mut chunk0)
        .unwrap();
    assert_eq!(chunk0, data[..WIM_CHUNK_SIZE]);
    assert_eq!(read_resource(&bytes, &entry), data);
}

#[test]
fn parallel_write_preserves_order_and_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("parallel.wim");

    let contents: Vec<Vec<u8>> = (0..50).map(|i| patterned(200 * 1024, i)).collect();
    build_archive(&path, CompressionType::Lzx, &contents, WriteFlags::empty(), 4);

    let bytes = std::fs::read(&path).unwrap();
    let wim = Wim::open(&path).unwrap();
    assert_eq!(wim.image_count(), 1);

    let mut last_offset = 0u64;
    for data in &contents {
        let entry = entry_of(&wim, data);
        assert!(entry.offset > last_offset, "entries in stream-list order");
        last_offset = entry.offset;
        assert_eq!(read_resource(&bytes, &entry), *data, "content round-trips");
    }
}

#[test]
fn mixed_streams_round_trip_through_pipeline() {
    use rand::RngCore;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mixed.wim");

    let mut random = vec![0u8; 600 * 1024];
    rand::thread_rng().fill_bytes(&mut random);
    let contents = vec![
        patterned(900 * 1024, 1),
        Vec::new(),
        random,
        patterned(10, 2),
        patterned(WIM_CHUNK_SIZE, 4),
    ];
    build_archive(&path, CompressionType::Xpress, &contents, WriteFlags::empty(), 3);

    let bytes = std::fs::read(&path).unwrap();
    let wim = Wim::open(&path).unwrap();
    for data in &contents {
        let entry = entry_of(&wim, data);
        assert_eq!(read_resource(&bytes, &entry), *data);
        if !data.is_empty() {
            // Digest recorded in the lookup table matches the bytes.
            assert_eq!(entry.original_size, data.len() as u64);
            assert!(wim.find_stream(&sha(data)).is_some());
        }
    }
}

#[test]
fn repeated_writes_are_byte_identical() {
    let dir = TempDir::new().unwrap();
    let path_a = dir.path().join("a.wim");
    let path_b = dir.path().join("b.wim");

    let contents: Vec<Vec<u8>> = (0..12).map(|i| patterned(300 * 1024, i)).collect();
    let mut wim = Wim::new(CompressionType::Lzx);
    let image = wim.add_image("img", patterned(64, 0));
    for data in &contents {
        let idx = wim.add_stream(Stream::from_bytes(data.clone()));
        wim.reference_stream(image, idx).unwrap();
    }

    wim.write(&path_a, ImageSelector::All, WriteFlags::empty(), 4, None)
        .unwrap();
    wim.write(&path_b, ImageSelector::All, WriteFlags::empty(), 4, None)
        .unwrap();

    assert_eq!(std::fs::read(&path_a).unwrap(), std::fs::read(&path_b).unwrap());
}

#[test]
fn integrity_table_covers_the_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checked.wim");
    build_archive(
        &path,
        CompressionType::Lzx,
        &[patterned(100_000, 5)],
        WriteFlags::CHECK_INTEGRITY,
        1,
    );

    let bytes = std::fs::read(&path).unwrap();
    let wim = Wim::open(&path).unwrap();
    let table = wim.integrity.as_ref().expect("integrity table present");
    assert_eq!(table.digests.len(), 1);

    let end = wim.hdr.lookup_table.end() as usize;
    let expected = sha(&bytes[WIM_HEADER_DISK_SIZE..end]);
    assert_eq!(table.digests[0], expected);
    assert!(wim.hdr.integrity.offset >= wim.hdr.xml_data.end());
}

#[test]
fn boot_image_entry_round_trips() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let path = dir.path().join("boot.wim");

    let mut wim = Wim::new(CompressionType::Xpress);
    let img1 = wim.add_image("one", patterned(128, 1));
    let _img2 = wim.add_image("two", patterned(128, 2));
    wim.set_boot_index(img1)?;
    wim.write(&path, ImageSelector::All, WriteFlags::empty(), 1, None)?;

    let back = Wim::open(&path)?;
    assert_eq!(back.image_count(), 2);
    assert_eq!(back.hdr.boot_idx, 1);
    let meta_entry = match back.lookup.get(back.images[0].metadata).source() {
        source::StreamSource::InArchive { entry, .. } => *entry,
        _ => unreachable!(),
    };
    assert_eq!(back.hdr.boot_metadata, meta_entry);
    assert!(meta_entry.flags.contains(ResourceFlags::METADATA));
    Ok(())
}

#[test]
fn single_image_write_selects_one_image() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("one-of-two.wim");

    let mut wim = Wim::new(CompressionType::None);
    let img1 = wim.add_image("first", patterned(64, 1));
    let img2 = wim.add_image("second", patterned(64, 2));
    let only_first = wim.add_stream(Stream::from_bytes(patterned(1000, 3)));
    wim.reference_stream(img1, only_first).unwrap();
    let only_second = wim.add_stream(Stream::from_bytes(patterned(1000, 4)));
    wim.reference_stream(img2, only_second).unwrap();

    wim.write(&path, ImageSelector::Index(2), WriteFlags::empty(), 1, None)
        .unwrap();

    let back = Wim::open(&path).unwrap();
    assert_eq!(back.image_count(), 1);
    let hash_second = sha(&patterned(1000, 4));
    assert!(back.lookup.streams().iter().any(|s| *s.hash() == hash_second));
    let hash_first = sha(&patterned(1000, 3));
    assert!(!back.lookup.streams().iter().any(|s| *s.hash() == hash_first));

    assert!(matches!(
        wim.write(&path, ImageSelector::Index(9), WriteFlags::empty(), 1, None),
        Err(WimError::InvalidImage(9))
    ));
}

#[test]
fn inplace_append_survives_a_crash_before_the_header_rewrite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("grow.wim");
    build_archive(
        &path,
        CompressionType::Lzx,
        &[patterned(50_000, 8)],
        WriteFlags::empty(),
        1,
    );
    let original = std::fs::read(&path).unwrap();

    let mut wim = Wim::open(&path).unwrap();
    let old_end = wim.hdr.xml_data.end();
    assert_eq!(old_end, original.len() as u64);

    let image = wim.add_image("appended", patterned(256, 9));
    let appended = patterned(1024 * 1024, 10);
    let idx = wim.add_stream(Stream::from_bytes(appended.clone()));
    wim.reference_stream(image, idx).unwrap();
    wim.overwrite(WriteFlags::empty(), 1, None).unwrap();

    let updated = std::fs::read(&path).unwrap();
    assert!(updated.len() > original.len());
    assert_eq!(
        &updated[WIM_HEADER_DISK_SIZE..old_end as usize],
        &original[WIM_HEADER_DISK_SIZE..],
        "everything below the old end is untouched"
    );

    // A crash before the final header rewrite leaves the old header over the grown file.
    // Recovery is truncation back to the old end, which must reproduce the original archive.
    let mut crashed = updated.clone();
    crashed[..WIM_HEADER_DISK_SIZE].copy_from_slice(&original[..WIM_HEADER_DISK_SIZE]);
    crashed.truncate(old_end as usize);
    assert_eq!(crashed, original);

    let recovered_path = dir.path().join("recovered.wim");
    std::fs::write(&recovered_path, &crashed).unwrap();
    let recovered = Wim::open(&recovered_path).unwrap();
    assert_eq!(recovered.image_count(), 1);
    assert_eq!(recovered.hdr.lookup_table, wim.hdr.lookup_table);

    // And the completed update holds both images plus the appended stream.
    let grown = Wim::open(&path).unwrap();
    assert_eq!(grown.image_count(), 2);
    let entry = entry_of(&grown, &appended);
    assert!(entry.offset >= old_end);
    assert_eq!(read_resource(&updated, &entry), appended);
}

#[test]
fn failed_append_truncates_back_to_the_old_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("restore.wim");
    build_archive(
        &path,
        CompressionType::Lzx,
        &[patterned(20_000, 11)],
        WriteFlags::empty(),
        1,
    );
    let original = std::fs::read(&path).unwrap();

    let mut wim = Wim::open(&path).unwrap();
    let image = wim.add_image("broken", patterned(64, 12));

    let good = wim.add_stream(Stream::from_bytes(patterned(100_000, 13)));
    wim.reference_stream(image, good).unwrap();

    // A source that goes missing between capture and write.
    let mut bad = Stream::from_bytes(vec![0u8; 4]);
    bad.hash = [0; SHA1_HASH_SIZE];
    bad.source = source::StreamSource::OnDisk {
        path: dir.path().join("never-existed"),
    };
    bad.size = 5000;
    bad.csize = 5000;
    let bad = wim.add_stream(bad);
    wim.reference_stream(image, bad).unwrap();

    let err = wim.overwrite(WriteFlags::empty(), 1, None).unwrap_err();
    assert!(matches!(err, WimError::Open { .. }));

    assert_eq!(std::fs::read(&path).unwrap(), original, "previous archive restored");
}

#[test]
fn concurrent_writers_exclude_each_other() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.wim");
    build_archive(
        &path,
        CompressionType::None,
        &[patterned(1000, 14)],
        WriteFlags::empty(),
        1,
    );

    let mut wim = Wim::open(&path).unwrap();
    let image = wim.add_image("more", patterned(64, 15));
    let idx = wim.add_stream(Stream::from_bytes(patterned(2000, 16)));
    wim.reference_stream(image, idx).unwrap();

    // Another writer already holds the advisory lock.
    let contender = std::fs::File::options().write(true).open(&path).unwrap();
    fs2::FileExt::try_lock_exclusive(&contender).unwrap();

    let err = wim.overwrite(WriteFlags::empty(), 1, None).unwrap_err();
    assert!(matches!(err, WimError::AlreadyLocked { .. }));

    fs2::FileExt::unlock(&contender).unwrap();
    drop(contender);
    wim.overwrite(WriteFlags::empty(), 1, None).unwrap();
    assert_eq!(Wim::open(&path).unwrap().image_count(), 2);
}

#[test]
fn untouched_archive_overwrites_without_a_new_lookup_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("idle.wim");
    build_archive(
        &path,
        CompressionType::Lzx,
        &[patterned(30_000, 17)],
        WriteFlags::empty(),
        1,
    );

    let before = Wim::open(&path).unwrap();
    let lookup_before = before.hdr.lookup_table;

    let mut wim = Wim::open(&path).unwrap();
    wim.overwrite(WriteFlags::empty(), 1, None).unwrap();

    let after = Wim::open(&path).unwrap();
    assert_eq!(after.hdr.lookup_table, lookup_before, "lookup table kept in place");
    assert_eq!(
        after.hdr.xml_data.offset,
        lookup_before.end(),
        "XML rewritten straight after the lookup table"
    );
    assert_eq!(after.image_count(), 1);
}

#[test]
fn deleting_an_image_rebuilds_through_a_tempfile() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rebuild.wim");

    let keep = patterned(40_000, 18);
    let drop_data = patterned(40_000, 19);

    let mut wim = Wim::new(CompressionType::Lzx);
    let img1 = wim.add_image("discard", patterned(64, 20));
    let idx1 = wim.add_stream(Stream::from_bytes(drop_data.clone()));
    wim.reference_stream(img1, idx1).unwrap();
    let img2 = wim.add_image("keep", patterned(64, 21));
    let idx2 = wim.add_stream(Stream::from_bytes(keep.clone()));
    wim.reference_stream(img2, idx2).unwrap();
    wim.write(&path, ImageSelector::All, WriteFlags::empty(), 1, None)
        .unwrap();

    // Bind the in-memory archive to its file the way an opened archive would be.
    wim.filename = Some(path.clone());
    wim.file = Some(std::sync::Arc::new(sync_file::RandomAccessFile::from(
        std::fs::File::open(&path).unwrap(),
    )));

    let mut saw_rename = false;
    let mut cb = |event: ProgressEvent<'_>| {
        if let ProgressEvent::Rename { to, .. } = event {
            assert_eq!(to, path);
            saw_rename = true;
        }
    };
    wim.delete_image(1).unwrap();
    wim.overwrite(WriteFlags::empty(), 1, Some(&mut cb)).unwrap();
    assert!(saw_rename, "rebuild goes through the tempfile rename");
    assert!(wim.is_open(), "read handle points at the renamed archive");

    let back = Wim::open(&path).unwrap();
    assert_eq!(back.image_count(), 1);
    let keep_hash = sha(&keep);
    let drop_hash = sha(&drop_data);
    assert!(back.lookup.streams().iter().any(|s| *s.hash() == keep_hash));
    assert!(!back.lookup.streams().iter().any(|s| *s.hash() == drop_hash));

    // No stray temporary files left behind.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n.to_string_lossy().starts_with("rebuild.wim."))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn recompress_flag_reencodes_raw_copies() {
    let dir = TempDir::new().unwrap();
    let path_a = dir.path().join("first.wim");
    let path_b = dir.path().join("second.wim");

    let data = patterned(150_000, 22);
    build_archive(&path_a, CompressionType::Lzx, &[data.clone()], WriteFlags::empty(), 1);

    // Rebuild the archive from its own file; the stream is an in-archive source whose stored
    // encoding matches the output, so it is raw-copied.
    let mut wim = Wim::open(&path_a).unwrap();
    wim.write(&path_b, ImageSelector::All, WriteFlags::empty(), 1, None)
        .unwrap();

    let a = std::fs::read(&path_a).unwrap();
    let b = std::fs::read(&path_b).unwrap();
    let wim_b = Wim::open(&path_b).unwrap();
    let entry = entry_of(&wim_b, &data);
    assert_eq!(read_resource(&b, &entry), data, "raw copy round-trips");

    let entry_a = entry_of(&Wim::open(&path_a).unwrap(), &data);
    assert_eq!(
        &a[entry_a.offset as usize..][..entry_a.size as usize],
        &b[entry.offset as usize..][..entry.size as usize],
        "stored bytes are copied verbatim"
    );

    // Asking for recompression of a compressed in-archive stream would mean decoding it,
    // which is refused.
    let mut wim = Wim::open(&path_a).unwrap();
    let err = wim
        .write(
            dir.path().join("third.wim"),
            ImageSelector::All,
            WriteFlags::RECOMPRESS,
            1,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, WimError::InvalidParam(_)));
}
