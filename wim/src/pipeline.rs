//! The parallel compression pipeline.
//!
//! One I/O thread owns the stream sources, the SHA-1 state, the chunk tables, and the output
//! file. `N` worker threads do nothing but compress buffers. Work travels in fixed
//! pre-allocated messages of up to two chunks: the I/O thread fills a message with
//! uncompressed data and pushes it onto `to_compress`; a worker encodes it and pushes it onto
//! `done`; the I/O thread writes the results and recycles the message. Both queues are
//! bounded, so a stalled side blocks the other instead of buffering without limit.
//!
//! Chunks of one stream are written strictly in order: completed messages are parked per
//! stream, keyed by their first chunk index, and only the head of the parked run is written.
//! Streams are themselves written in dispatch order, one to completion before the next,
//! though later streams may already be dispatched and compressing. Streams that need no
//! compression at all (already in the output encoding, or empty) bypass the pipeline and are
//! written by the I/O thread between streams.

use crate::chunk_table::{chunk_span, ChunkTable};
use crate::compress::{compress_chunk, CompressionType};
use crate::error::{Result, WimError};
use crate::header::ResourceEntry;
use crate::progress::{Progress, ProgressEvent, WriteStreamsProgress};
use crate::queue::SharedQueue;
use crate::resource::{
    output_entry_flags, tell, write_resource, write_uncompressed_and_truncate, ResourceWriteFlags,
};
use crate::source::Adapters;
use crate::stream::Stream;
use crate::{WimOutput, SHA1_HASH_SIZE, WIM_CHUNK_SIZE};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, debug_span, trace};

/// Chunks carried by one message.
pub(crate) const MAX_CHUNKS_PER_MSG: usize = 2;

/// Messages allocated per worker thread. Also sizes both queues.
const MESSAGES_PER_THREAD: usize = 2;

/// Slack past the chunk end in each uncompressed buffer; the compressor's matcher may look a
/// few bytes beyond its input.
const COMPRESSOR_SLACK: usize = 8;

#[derive(Copy, Clone)]
enum ChunkResult {
    /// Compression did not shrink the chunk; its uncompressed bytes are the output.
    Raw,
    /// The chunk compressed to this many bytes.
    Packed(usize),
}

/// One unit of work, owned alternately by the I/O thread and a worker. The buffers are
/// allocated once and travel with the message.
struct Message {
    stream_idx: usize,
    begin_chunk: u64,
    num_chunks: usize,
    uncompressed: [Vec<u8>; MAX_CHUNKS_PER_MSG],
    compressed: [Vec<u8>; MAX_CHUNKS_PER_MSG],
    results: [ChunkResult; MAX_CHUNKS_PER_MSG],
}

fn alloc_buffer(capacity: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity).map_err(|_| WimError::OutOfMemory)?;
    Ok(buf)
}

fn alloc_messages(count: usize) -> Result<Vec<Box<Message>>> {
    let mut msgs = Vec::new();
    msgs.try_reserve_exact(count).map_err(|_| WimError::OutOfMemory)?;
    for _ in 0..count {
        msgs.push(Box::new(Message {
            stream_idx: 0,
            begin_chunk: 0,
            num_chunks: 0,
            uncompressed: [
                alloc_buffer(WIM_CHUNK_SIZE + COMPRESSOR_SLACK)?,
                alloc_buffer(WIM_CHUNK_SIZE + COMPRESSOR_SLACK)?,
            ],
            compressed: [alloc_buffer(WIM_CHUNK_SIZE)?, alloc_buffer(WIM_CHUNK_SIZE)?],
            results: [ChunkResult::Raw; MAX_CHUNKS_PER_MSG],
        }));
    }
    Ok(msgs)
}

/// Worker thread body: take a message, compress its chunks, hand it back. A `None` sentinel
/// ends the thread.
fn compressor_thread(
    to_compress: &SharedQueue<Option<Box<Message>>>,
    done: &SharedQueue<Box<Message>>,
    out_ctype: CompressionType,
) {
    trace!("compressor thread ready");
    while let Some(mut msg) = to_compress.get() {
        let m = &mut *msg;
        for i in 0..m.num_chunks {
            let chunk = &m.uncompressed[i];
            let budget = chunk.len().saturating_sub(1);
            m.compressed[i].resize(budget, 0);
            m.results[i] = match compress_chunk(out_ctype, chunk, &mut m.compressed[i]) {
                Some(n) => ChunkResult::Packed(n),
                None => ChunkResult::Raw,
            };
        }
        done.put(msg);
    }
    trace!("compressor thread terminating");
}

/// The stream currently being read and fed to the workers.
struct DispatchState {
    idx: usize,
    next_chunk: u64,
    num_chunks: u64,
    sha: Sha1,
}

/// A stream with chunks somewhere in the pipeline. The front of the outstanding queue is the
/// stream currently being written.
struct WriteState {
    idx: usize,
    num_chunks: u64,
    /// The next chunk index the output file expects.
    next_write: u64,
    /// Completed messages not yet writable, keyed by their first chunk index.
    parked: BTreeMap<u64, Box<Message>>,
    tab: Option<ChunkTable>,
    file_offset: u64,
}

struct IoThread<'a, 'p, W: WimOutput> {
    streams: &'a mut [Stream],
    list: &'a [usize],
    out: &'a mut W,
    out_ctype: CompressionType,
    flags: ResourceWriteFlags,
    adapters: &'a Adapters,
    to_compress: &'a SharedQueue<Option<Box<Message>>>,
    done: &'a SharedQueue<Box<Message>>,
    available: Vec<Box<Message>>,
    in_flight: usize,
    /// Position of the dispatch cursor in `list`.
    cursor: usize,
    dispatch: Option<DispatchState>,
    outstanding: VecDeque<WriteState>,
    /// Streams that skip the pipeline, written serially between pipeline streams.
    deferred: Vec<usize>,
    info: &'a mut WriteStreamsProgress,
    progress: &'a mut Progress<'p>,
}

impl<W: WimOutput> IoThread<'_, '_, W> {
    fn run(&mut self) -> Result<()> {
        loop {
            self.dispatch_phase()?;
            if self.outstanding.is_empty() {
                break;
            }
            self.drain_phase()?;
        }
        self.flush_deferred()
    }

    /// Fills and dispatches messages until the free list or the stream list runs dry.
    fn dispatch_phase(&mut self) -> Result<()> {
        while !self.available.is_empty() {
            if self.dispatch.is_none() && !self.advance_dispatch()? {
                break;
            }

            let mut msg = self.available.pop().expect("loop guard");
            let d = self.dispatch.as_mut().expect("dispatch stream is current");
            let stream = &mut self.streams[d.idx];

            let n = (d.num_chunks - d.next_chunk).min(MAX_CHUNKS_PER_MSG as u64) as usize;
            msg.stream_idx = d.idx;
            msg.begin_chunk = d.next_chunk;
            msg.num_chunks = n;
            for i in 0..n {
                let span = chunk_span(stream.size, d.next_chunk, d.num_chunks);
                msg.uncompressed[i].resize(span, 0);
                stream
                    .open_reader(self.adapters)?
                    .read_at(d.next_chunk * WIM_CHUNK_SIZE as u64, &mut msg.uncompressed[i])?;
                d.sha.update(&msg.uncompressed[i]);
                d.next_chunk += 1;
            }

            trace!(
                stream = d.idx,
                begin_chunk = msg.begin_chunk,
                chunks = n,
                "dispatch compression request"
            );
            self.to_compress.put(Some(msg));
            self.in_flight += 1;

            let d = self.dispatch.as_mut().expect("still current");
            if d.next_chunk == d.num_chunks {
                // Everything of this stream has been read; the digest is final even though
                // writing may lag behind.
                let digest: [u8; SHA1_HASH_SIZE] = d.sha.finalize_reset().into();
                let idx = d.idx;
                self.dispatch = None;
                let stream = &mut self.streams[idx];
                stream.close_reader();
                stream.check_or_adopt_hash(digest)?;
            }
        }
        Ok(())
    }

    /// Advances the dispatch cursor to the next stream that needs the pipeline. Streams that
    /// do not are deferred for the serial path. Returns false when the list is exhausted.
    fn advance_dispatch(&mut self) -> Result<bool> {
        while self.cursor < self.list.len() {
            let idx = self.list[self.cursor];
            self.cursor += 1;
            let stream = &mut self.streams[idx];

            let raw_copyable = stream.ctype == self.out_ctype
                && !self.flags.contains(ResourceWriteFlags::RECOMPRESS);
            if raw_copyable || stream.size == 0 {
                self.deferred.push(idx);
                continue;
            }

            stream.open_reader(self.adapters)?;
            let num_chunks = stream.num_chunks();
            self.outstanding.push_back(WriteState {
                idx,
                num_chunks,
                next_write: 0,
                parked: BTreeMap::new(),
                tab: None,
                file_offset: 0,
            });
            self.dispatch = Some(DispatchState {
                idx,
                next_chunk: 0,
                num_chunks,
                sha: Sha1::new(),
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Blocks for one completed message, parks it on its stream, and writes whatever became
    /// writable.
    fn drain_phase(&mut self) -> Result<()> {
        let msg = self.done.get();
        self.in_flight -= 1;
        let ws = self
            .outstanding
            .iter_mut()
            .find(|ws| ws.idx == msg.stream_idx)
            .expect("completed message belongs to an outstanding stream");
        ws.parked.insert(msg.begin_chunk, msg);
        self.write_ready()
    }

    /// Writes every parked message that is next in order for the stream at the front of the
    /// outstanding queue, finishing streams (and starting the next) as they complete.
    fn write_ready(&mut self) -> Result<()> {
        while let Some(front) = self.outstanding.front_mut() {
            while let Some(msg) = front.parked.remove(&front.next_write) {
                if front.next_write == 0 {
                    // First chunks of the stream: reserve its chunk table now.
                    front.file_offset = tell(self.out)?;
                    front.tab = Some(
                        ChunkTable::begin(
                            self.out,
                            self.streams[front.idx].size,
                            front.file_offset,
                        )
                        .map_err(WimError::Write)?,
                    );
                }
                let tab = front.tab.as_mut().expect("chunk table reserved");
                for i in 0..msg.num_chunks {
                    let bytes: &[u8] = match msg.results[i] {
                        ChunkResult::Raw => &msg.uncompressed[i],
                        ChunkResult::Packed(n) => &msg.compressed[i][..n],
                    };
                    self.out.write_all(bytes).map_err(WimError::Write)?;
                    tab.record(bytes.len() as u32);
                }
                front.next_write += msg.num_chunks as u64;
                self.available.push(msg);
            }

            if front.next_write == front.num_chunks {
                let ws = self.outstanding.pop_front().expect("front exists");
                self.finish_stream(ws)?;
                self.flush_deferred()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Finalizes a fully-written stream: chunk table, the not-smaller fallback, the output
    /// entry, and a progress notification.
    fn finish_stream(&mut self, ws: WriteState) -> Result<()> {
        let tab = ws.tab.expect("completed stream has a chunk table");
        let body = tab.finalize(self.out).map_err(WimError::Write)?;
        let stream = &mut self.streams[ws.idx];
        debug!(stream = ws.idx, body, original = stream.size, "stream complete");

        if body >= stream.size {
            write_uncompressed_and_truncate(stream, self.out, ws.file_offset, self.adapters)?;
        } else {
            stream.out_entry = ResourceEntry {
                offset: ws.file_offset,
                size: body,
                original_size: stream.size,
                flags: output_entry_flags(stream.flags, self.out_ctype),
            };
        }

        self.info.completed_bytes += self.streams[ws.idx].size;
        self.info.completed_streams += 1;
        self.progress.emit(ProgressEvent::WriteStreams(self.info));
        Ok(())
    }

    /// Serially writes the streams that bypassed the pipeline.
    fn flush_deferred(&mut self) -> Result<()> {
        for idx in std::mem::take(&mut self.deferred) {
            write_resource(
                &mut self.streams[idx],
                self.out,
                self.out_ctype,
                self.flags,
                self.adapters,
            )?;
            self.info.completed_bytes += self.streams[idx].size;
            self.info.completed_streams += 1;
            self.progress.emit(ProgressEvent::WriteStreams(self.info));
        }
        Ok(())
    }
}

/// Writes the stream list using `num_threads` compressor threads.
///
/// Fails with [`WimError::OutOfMemory`] if the message buffers cannot be allocated; the caller
/// falls back to the serial path. Any other error is fatal, but the pipeline still drains all
/// in-flight messages and joins its workers before returning it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_stream_list_parallel<W: WimOutput>(
    streams: &mut [Stream],
    list: &[usize],
    out: &mut W,
    out_ctype: CompressionType,
    flags: ResourceWriteFlags,
    num_threads: usize,
    info: &mut WriteStreamsProgress,
    progress: &mut Progress<'_>,
    adapters: &Adapters,
) -> Result<()> {
    let _span = debug_span!("write_stream_list_parallel", num_threads).entered();

    let queue_size = num_threads * MESSAGES_PER_THREAD;
    let available = alloc_messages(queue_size)?;
    let to_compress: SharedQueue<Option<Box<Message>>> = SharedQueue::new(queue_size);
    let done: SharedQueue<Box<Message>> = SharedQueue::new(queue_size);

    std::thread::scope(|scope| {
        for _ in 0..num_threads {
            let to_compress = to_compress.clone();
            let done = done.clone();
            scope.spawn(move || compressor_thread(&to_compress, &done, out_ctype));
        }

        let mut ctx = IoThread {
            streams,
            list,
            out,
            out_ctype,
            flags,
            adapters,
            to_compress: &to_compress,
            done: &done,
            available,
            in_flight: 0,
            cursor: 0,
            dispatch: None,
            outstanding: VecDeque::new(),
            deferred: Vec::new(),
            info,
            progress,
        };
        let result = ctx.run();

        if result.is_err() {
            // Recover ownership of every dispatched buffer and close the one reader that can
            // still be open before tearing the pipeline down.
            while ctx.in_flight > 0 {
                let _ = ctx.done.get();
                ctx.in_flight -= 1;
            }
            if let Some(d) = ctx.dispatch.take() {
                ctx.streams[d.idx].close_reader();
            }
        }

        for _ in 0..num_threads {
            to_compress.put(None);
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use std::io::Cursor;

    fn run_pipeline(
        streams: &mut [Stream],
        out_ctype: CompressionType,
        num_threads: usize,
    ) -> Vec<u8> {
        let list: Vec<usize> = (0..streams.len()).collect();
        let mut out = Cursor::new(Vec::new());
        let mut info = WriteStreamsProgress {
            total_bytes: streams.iter().map(|s| s.size).sum(),
            total_streams: streams.len() as u64,
            completed_bytes: 0,
            completed_streams: 0,
            num_threads: num_threads as u32,
            compression: out_ctype,
        };
        write_stream_list_parallel(
            streams,
            &list,
            &mut out,
            out_ctype,
            ResourceWriteFlags::empty(),
            num_threads,
            &mut info,
            &mut Progress::none(),
            &Adapters::default(),
        )
        .unwrap();
        assert_eq!(info.completed_streams, info.total_streams);
        assert_eq!(info.completed_bytes, info.total_bytes);
        out.into_inner()
    }

    #[test]
    fn single_stream_matches_serial_writer() {
        let data: Vec<u8> = (0u32..40_000).map(|i| (i % 251) as u8).collect();

        let mut parallel_stream = [Stream::from_bytes(data.clone())];
        let parallel_bytes = run_pipeline(&mut parallel_stream, CompressionType::Lzx, 3);

        let mut serial_stream = Stream::from_bytes(data);
        let mut serial_out = Cursor::new(Vec::new());
        write_resource(
            &mut serial_stream,
            &mut serial_out,
            CompressionType::Lzx,
            ResourceWriteFlags::empty(),
            &Adapters::default(),
        )
        .unwrap();

        assert_eq!(parallel_bytes, serial_out.into_inner());
        assert_eq!(parallel_stream[0].out_entry, serial_stream.out_entry);
    }

    #[test]
    fn offsets_increase_in_list_order() {
        let mut streams: Vec<Stream> = (0..20)
            .map(|i| {
                let data: Vec<u8> = (0u32..50_000).map(|j| ((i * 7 + j) % 253) as u8).collect();
                Stream::from_bytes(data)
            })
            .collect();
        run_pipeline(&mut streams, CompressionType::Xpress, 4);

        let mut last_end = 0;
        for stream in &streams {
            assert!(stream.out_entry.offset >= last_end);
            assert!(stream.out_entry.size > 0);
            last_end = stream.out_entry.end();
        }
    }

    #[test]
    fn empty_and_incompressible_streams_interleave() {
        use rand::RngCore;
        let mut random = vec![0u8; 45_000];
        rand::thread_rng().fill_bytes(&mut random);

        let mut streams = vec![
            Stream::from_bytes(vec![0x11u8; 70_000]),
            Stream::from_bytes(Vec::new()),
            Stream::from_bytes(random.clone()),
            Stream::from_bytes(vec![0x22u8; 70_000]),
        ];
        let bytes = run_pipeline(&mut streams, CompressionType::Lzx, 2);

        // The incompressible stream fell back to raw storage.
        let raw = &streams[2].out_entry;
        assert!(!raw.flags.contains(crate::ResourceFlags::COMPRESSED));
        assert_eq!(raw.size, 45_000);
        assert_eq!(
            &bytes[raw.offset as usize..(raw.offset + raw.size) as usize],
            &random[..]
        );

        // The empty stream wrote nothing but still has an entry position.
        assert_eq!(streams[1].out_entry.size, 0);
        assert_eq!(streams[1].out_entry.original_size, 0);
    }

    #[test]
    fn dispatch_error_drains_cleanly() {
        // The second stream's source fails to open at dispatch time.
        let mut bad = Stream::from_bytes(vec![0u8; 8]);
        bad.source = crate::source::StreamSource::OnDisk {
            path: "/nonexistent/missing-source".into(),
        };
        bad.size = 100_000;
        bad.csize = 100_000;

        let mut streams = vec![Stream::from_bytes(vec![0x33u8; 200_000]), bad];
        let list = [0usize, 1];
        let mut out = Cursor::new(Vec::new());
        let mut info = WriteStreamsProgress {
            total_bytes: 0,
            total_streams: 2,
            completed_bytes: 0,
            completed_streams: 0,
            num_threads: 2,
            compression: CompressionType::Lzx,
        };
        let err = write_stream_list_parallel(
            &mut streams,
            &list,
            &mut out,
            CompressionType::Lzx,
            ResourceWriteFlags::empty(),
            2,
            &mut info,
            &mut Progress::none(),
            &Adapters::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WimError::Open { .. }));
        assert!(streams.iter().all(|s| s.reader.is_none()));
    }
}
