//! The public seekable reader.
//!
//! `ParallelGzReader` owns the whole engine: index growth runs on the
//! calling thread, decode work fans out to the pool, and decompressed bytes
//! come back through the assembly buffer in strict offset order. One caller
//! thread drives it; the reader is `Send` so it can move between threads,
//! but it is not `Sync`.

use std::collections::{BTreeSet, HashSet};
use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use crate::assembly::AssemblyBuffer;
use crate::error::{GzError, GzResult};
use crate::gzip::GZIP_MAGIC;
use crate::index::SeekIndex;
use crate::pool::{DecodeTask, WorkerPool};
use crate::scan::{BlockScanner, DEFAULT_CHECKPOINT_SPACING};
use crate::source::CompressedSource;

/// Tuning knobs; the defaults are right for most callers.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Decode worker threads; 0 selects the number of logical CPUs.
    pub threads: usize,
    /// Decompressed distance between index checkpoints.
    pub checkpoint_spacing: u64,
    /// Spans submitted ahead of the read cursor.
    pub prefetch_spans: u64,
    /// Decoded bytes kept behind the cursor before eviction.
    pub retention_bytes: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            checkpoint_spacing: DEFAULT_CHECKPOINT_SPACING,
            prefetch_spans: 8,
            retention_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ReaderOptions {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    fn resolve_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

struct Engine {
    index: SeekIndex,
    pool: WorkerPool,
    assembly: Arc<AssemblyBuffer>,
    /// Sequences handed to the pool and not yet evicted.
    submitted: BTreeSet<u64>,
    /// Members whose checksum failure has already been returned to the caller.
    reported: HashSet<usize>,
    position: u64,
    eof: bool,
    prefetch: u64,
    retention: u64,
}

/// Random-access gzip reader decoding on a pool of worker threads.
pub struct ParallelGzReader {
    engine: Option<Engine>,
}

impl std::fmt::Debug for ParallelGzReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelGzReader").finish_non_exhaustive()
    }
}

impl ParallelGzReader {
    /// Open a gzip file by path.
    pub fn open<P: AsRef<Path>>(path: P, threads: usize) -> GzResult<Self> {
        Self::open_with(path, ReaderOptions::with_threads(threads))
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: ReaderOptions) -> GzResult<Self> {
        Self::build(CompressedSource::from_path(path)?, options)
    }

    /// Open from an already-open descriptor without taking ownership of it.
    #[cfg(unix)]
    pub fn from_fd(fd: std::os::unix::io::RawFd, threads: usize) -> GzResult<Self> {
        Self::build(
            CompressedSource::from_raw_fd(fd)?,
            ReaderOptions::with_threads(threads),
        )
    }

    /// Open over an in-memory compressed buffer.
    pub fn from_buffer(data: Vec<u8>, threads: usize) -> GzResult<Self> {
        Self::from_buffer_with(data, ReaderOptions::with_threads(threads))
    }

    pub fn from_buffer_with(data: Vec<u8>, options: ReaderOptions) -> GzResult<Self> {
        Self::build(CompressedSource::from_buffer(data)?, options)
    }

    fn build(source: CompressedSource, options: ReaderOptions) -> GzResult<Self> {
        let bytes = source.as_bytes();
        if bytes.len() < 2 || bytes[..2] != GZIP_MAGIC {
            return Err(GzError::open("not a gzip stream"));
        }

        let source = Arc::new(source);
        let threads = options.resolve_threads();
        let assembly = Arc::new(AssemblyBuffer::new());
        let scanner = BlockScanner::new(
            Arc::clone(&source),
            options.checkpoint_spacing.max(1),
            true,
        );
        let pool = WorkerPool::new(threads, source, Arc::clone(&assembly));

        Ok(Self {
            engine: Some(Engine {
                index: SeekIndex::new(scanner),
                pool,
                assembly,
                submitted: BTreeSet::new(),
                reported: HashSet::new(),
                position: 0,
                eof: false,
                prefetch: options.prefetch_spans.max(1),
                retention: options.retention_bytes,
            }),
        })
    }

    fn engine(&mut self) -> GzResult<&mut Engine> {
        self.engine
            .as_mut()
            .ok_or_else(|| GzError::invalid_state("reader is closed"))
    }

    /// Read decompressed bytes at the cursor, blocking on decode as needed.
    /// Returns 0 only at end of stream (or for an empty buffer).
    pub fn read(&mut self, buf: &mut [u8]) -> GzResult<usize> {
        self.engine()?.read(buf)
    }

    /// Reposition the cursor. `SeekFrom::End` forces a scan of the whole
    /// stream; targets past the end clamp to the end.
    pub fn seek(&mut self, pos: SeekFrom) -> GzResult<u64> {
        self.engine()?.seek(pos)
    }

    /// Current decompressed cursor position.
    pub fn tell(&mut self) -> GzResult<u64> {
        Ok(self.engine()?.position)
    }

    /// True once a read has returned 0 at end of stream, or after a seek
    /// landed exactly at the end.
    pub fn is_eof(&mut self) -> GzResult<bool> {
        Ok(self.engine()?.eof)
    }

    /// Total decompressed size; `None` until the stream has been fully
    /// scanned (a `SeekFrom::End` seek forces that).
    pub fn size(&mut self) -> GzResult<Option<u64>> {
        Ok(self.engine()?.index.total_size())
    }

    /// Enable or disable trailer verification for members not yet scanned.
    pub fn set_crc32_enabled(&mut self, enabled: bool) -> GzResult<()> {
        self.engine()?.index.set_crc32_enabled(enabled);
        Ok(())
    }

    /// Stop the workers and release the mapping. Idempotent; any other call
    /// after close fails with `InvalidState`.
    pub fn close(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.assembly.close();
            engine.pool.shutdown();
        }
    }

    /// Worker threads in the pool.
    pub fn threads(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.pool.threads())
    }
}

impl Drop for ParallelGzReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for ParallelGzReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ParallelGzReader::read(self, buf).map_err(Into::into)
    }
}

impl io::Seek for ParallelGzReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        ParallelGzReader::seek(self, pos).map_err(Into::into)
    }
}

impl Engine {
    fn read(&mut self, buf: &mut [u8]) -> GzResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        while written < buf.len() {
            let pos = self.position;
            let want_end = pos + (buf.len() - written) as u64;
            // Scanner failures are sticky, so a short read here is safe: the
            // next call hits the same error with nothing copied yet.
            if let Err(err) = self.index.extend_to(want_end) {
                if written > 0 {
                    break;
                }
                return Err(err);
            }

            // A recorded trailer mismatch is surfaced exactly once, on the
            // first read positioned at or past the failed member's end.
            // Bytes already copied are returned first; the error comes on
            // the next call.
            if let Some((member, failure)) = self.index.unreported_failure(pos, &self.reported) {
                if written > 0 {
                    break;
                }
                self.reported.insert(member);
                return Err(failure.into_error(member));
            }

            if let Some(total) = self.index.total_size() {
                if pos >= total {
                    if written == 0 {
                        self.eof = true;
                    }
                    break;
                }
            }

            let seq = self
                .index
                .seq_for_offset(pos)
                .ok_or_else(|| GzError::invalid_state("cursor ahead of scanned index"))?;
            self.schedule_from(seq)?;

            let span = self
                .index
                .span(seq)
                .ok_or_else(|| GzError::invalid_state("span end not yet scanned"))?;
            let skip = (pos - span.out_start) as usize;

            let n = match self.assembly.copy_from(seq, skip, &mut buf[written..]) {
                Ok(n) => n,
                Err(err) => {
                    if written > 0 {
                        break;
                    }
                    return Err(err);
                }
            };
            if n == 0 {
                return Err(GzError::invalid_state("decoded span shorter than indexed"));
            }

            written += n;
            self.position += n as u64;
            self.evict();
        }

        Ok(written)
    }

    fn seek(&mut self, pos: SeekFrom) -> GzResult<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => self.position as i64 + delta,
            SeekFrom::End(delta) => self.index.extend_to_end()? as i64 + delta,
        };
        if target < 0 {
            return Err(GzError::seek(format!(
                "target {} is before the start of the stream",
                target
            )));
        }

        let mut target = target as u64;
        self.index.extend_to(target)?;
        if let Some(total) = self.index.total_size() {
            target = target.min(total);
        }

        self.position = target;
        self.eof = self.index.total_size() == Some(target);
        Ok(target)
    }

    /// Submit the span at `seq` plus prefetch successors, skipping anything
    /// already queued or decoded.
    fn schedule_from(&mut self, seq: u64) -> GzResult<()> {
        for s in seq..seq + self.prefetch {
            let Some(span) = self.index.span(s) else {
                break;
            };
            if self.submitted.contains(&s) || self.assembly.contains(s) {
                continue;
            }
            self.pool.submit(DecodeTask::from(span))?;
            self.submitted.insert(s);
        }
        Ok(())
    }

    /// Drop decoded spans far behind the cursor. A seek back into an evicted
    /// range simply re-derives the spans from the index.
    fn evict(&mut self) {
        let threshold = self.position.saturating_sub(self.retention);
        if let Some(min_seq) = self.index.seq_for_offset(threshold) {
            self.assembly.evict_below(min_seq);
            self.submitted.retain(|&s| s >= min_seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(payload: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn reader_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ParallelGzReader>();
    }

    #[test]
    fn rejects_non_gzip_buffer() {
        let err = ParallelGzReader::from_buffer(b"plain text".to_vec(), 1).unwrap_err();
        assert!(matches!(err, GzError::Open(_)));
    }

    #[test]
    fn close_is_idempotent_and_poisons_later_calls() {
        let mut reader = ParallelGzReader::from_buffer(gz(b"payload"), 1).unwrap();
        reader.close();
        reader.close();

        let mut buf = [0u8; 4];
        assert!(matches!(
            reader.read(&mut buf),
            Err(GzError::InvalidState(_))
        ));
        assert!(reader.tell().is_err());
    }

    #[test]
    fn zero_length_read_is_ok() {
        let mut reader = ParallelGzReader::from_buffer(gz(b"payload"), 1).unwrap();
        assert_eq!(reader.read(&mut []).unwrap(), 0);
        assert_eq!(reader.tell().unwrap(), 0);
        assert!(!reader.is_eof().unwrap());
    }

    #[test]
    fn negative_seek_rejected() {
        let mut reader = ParallelGzReader::from_buffer(gz(b"payload"), 1).unwrap();
        let err = reader.seek(SeekFrom::Current(-1)).unwrap_err();
        assert!(matches!(err, GzError::Seek(_)));
        // Position unchanged after the failed seek.
        assert_eq!(reader.tell().unwrap(), 0);
    }

    #[test]
    fn size_unknown_until_scan_completes() {
        let payload = b"q".repeat(600_000);
        let mut reader = ParallelGzReader::from_buffer(gz(&payload), 2).unwrap();
        assert_eq!(reader.size().unwrap(), None);
        reader.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(reader.size().unwrap(), Some(600_000));
        assert!(reader.is_eof().unwrap());
    }

    #[test]
    fn zero_threads_auto_detects() {
        let reader = ParallelGzReader::from_buffer(gz(b"payload"), 0).unwrap();
        assert!(reader.threads() >= 1);
    }
}
