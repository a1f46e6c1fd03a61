//! Checkpoint index mapping decompressed offsets to compressed resume points.
//!
//! Built lazily: `extend_to` pulls scanner events only as far as a read or
//! seek needs, so opening a huge file costs nothing until data is touched.
//! Checkpoints are append-only and strictly ordered, which keeps the lookup
//! a plain binary search.

use std::sync::Arc;

use crate::error::GzResult;
use crate::gzip::{ChecksumFailure, MemberRecord};
use crate::scan::{BlockScanner, ScanEvent};

/// A resumable position in the stream.
#[derive(Debug, Clone)]
pub struct BlockCheckpoint {
    /// Index into the checkpoint table; doubles as the decode sequence number.
    pub sequence: u64,
    /// Decompressed offset this checkpoint resumes at.
    pub out_offset: u64,
    /// Absolute bit offset into the compressed stream.
    pub bit_offset: u64,
    /// Up to 32 KiB of history needed to resume; empty at a member start.
    pub dictionary: Arc<[u8]>,
    pub member: usize,
    pub member_start: bool,
}

/// Everything a worker needs to decode one inter-checkpoint span.
#[derive(Debug, Clone)]
pub struct Span {
    pub sequence: u64,
    pub start_bit: u64,
    pub out_start: u64,
    pub out_len: u64,
    pub dictionary: Arc<[u8]>,
    /// True when the span covers a complete member from its first bit; such
    /// spans can take the byte-aligned fast decode path.
    pub whole_member: bool,
}

pub struct SeekIndex {
    scanner: BlockScanner,
    checkpoints: Vec<BlockCheckpoint>,
    members: Vec<MemberRecord>,
    total_out: Option<u64>,
}

impl SeekIndex {
    pub fn new(scanner: BlockScanner) -> Self {
        Self {
            scanner,
            checkpoints: Vec::new(),
            members: Vec::new(),
            total_out: None,
        }
    }

    pub fn set_crc32_enabled(&mut self, enabled: bool) {
        self.scanner.set_crc32_enabled(enabled);
    }

    /// Total decompressed size, known only after the scan has finished.
    pub fn total_size(&self) -> Option<u64> {
        self.total_out
    }

    pub fn is_finished(&self) -> bool {
        self.total_out.is_some()
    }

    fn apply_event(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::MemberStart {
                member,
                header_offset,
                data_start_bit,
                out_start,
            } => {
                debug_assert_eq!(member, self.members.len());
                self.members
                    .push(MemberRecord::new(header_offset, data_start_bit, out_start));
                self.push_checkpoint(BlockCheckpoint {
                    sequence: self.checkpoints.len() as u64,
                    out_offset: out_start,
                    bit_offset: data_start_bit,
                    dictionary: Arc::from(&[][..]),
                    member,
                    member_start: true,
                });
            }
            ScanEvent::Checkpoint {
                out_offset,
                bit_offset,
                dictionary,
                member,
            } => {
                self.push_checkpoint(BlockCheckpoint {
                    sequence: self.checkpoints.len() as u64,
                    out_offset,
                    bit_offset,
                    dictionary: dictionary.into(),
                    member,
                    member_start: false,
                });
            }
            ScanEvent::MemberEnd {
                member,
                out_len,
                trailer,
                failure,
            } => {
                let record = &mut self.members[member];
                record.out_len = out_len;
                record.trailer = Some(trailer);
                record.failure = failure;
                record.complete = true;
            }
            ScanEvent::Finished { total_out } => {
                self.total_out = Some(total_out);
            }
        }
    }

    fn push_checkpoint(&mut self, checkpoint: BlockCheckpoint) {
        // An empty member can legitimately repeat the previous offset, but
        // offsets never go backwards.
        debug_assert!(self
            .checkpoints
            .last()
            .map_or(true, |prev| prev.out_offset <= checkpoint.out_offset));
        self.checkpoints.push(checkpoint);
    }

    /// Grow the index until it covers decompressed offset `out` (exclusive),
    /// or the stream ends.
    pub fn extend_to(&mut self, out: u64) -> GzResult<()> {
        while self.total_out.is_none()
            && self
                .checkpoints
                .last()
                .map_or(true, |cp| cp.out_offset <= out)
        {
            let event = self.scanner.next_event()?;
            self.apply_event(event);
        }
        Ok(())
    }

    /// Scan the remainder of the stream so the total size is known.
    pub fn extend_to_end(&mut self) -> GzResult<u64> {
        while self.total_out.is_none() {
            let event = self.scanner.next_event()?;
            self.apply_event(event);
        }
        Ok(self.total_out.unwrap_or(0))
    }

    /// Last checkpoint with `out_offset <= target`, if any has been scanned.
    pub fn checkpoint_at_or_before(&self, target: u64) -> Option<&BlockCheckpoint> {
        let idx = self
            .checkpoints
            .partition_point(|cp| cp.out_offset <= target);
        idx.checked_sub(1).map(|i| &self.checkpoints[i])
    }

    /// Sequence number of the span containing decompressed offset `target`.
    pub fn seq_for_offset(&self, target: u64) -> Option<u64> {
        self.checkpoint_at_or_before(target).map(|cp| cp.sequence)
    }

    /// Describe the decode span starting at checkpoint `sequence`. Returns
    /// `None` until the span's end offset is known (next checkpoint scanned
    /// or stream finished).
    pub fn span(&self, sequence: u64) -> Option<Span> {
        let cp = self.checkpoints.get(sequence as usize)?;
        let next = self.checkpoints.get(sequence as usize + 1);
        let out_end = match next {
            Some(next) => next.out_offset,
            None => self.total_out?,
        };
        let ends_member = match next {
            Some(next) => next.member != cp.member,
            None => true,
        };
        Some(Span {
            sequence,
            start_bit: cp.bit_offset,
            out_start: cp.out_offset,
            out_len: out_end - cp.out_offset,
            dictionary: Arc::clone(&cp.dictionary),
            whole_member: cp.member_start && ends_member,
        })
    }

    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.len()
    }

    /// Oldest checksum failure whose member ends at or before `pos` and has
    /// not been surfaced yet.
    pub fn unreported_failure(
        &self,
        pos: u64,
        reported: &std::collections::HashSet<usize>,
    ) -> Option<(usize, ChecksumFailure)> {
        self.members.iter().enumerate().find_map(|(i, record)| {
            match (record.complete, record.failure) {
                (true, Some(failure)) if record.out_end() <= pos && !reported.contains(&i) => {
                    Some((i, failure))
                }
                _ => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CompressedSource;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(payload: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    fn index_for(data: Vec<u8>, spacing: u64) -> SeekIndex {
        let source = Arc::new(CompressedSource::from_buffer(data).unwrap());
        SeekIndex::new(BlockScanner::new(source, spacing, true))
    }

    #[test]
    fn lazy_until_extended() {
        let mut index = index_for(gz(&b"x".repeat(500_000)), 64 * 1024);
        assert_eq!(index.checkpoint_count(), 0);
        assert!(index.total_size().is_none());

        index.extend_to(0).unwrap();
        assert!(index.checkpoint_count() >= 1);
        assert!(index.total_size().is_none());

        let total = index.extend_to_end().unwrap();
        assert_eq!(total, 500_000);
        assert_eq!(index.total_size(), Some(500_000));
    }

    #[test]
    fn checkpoint_lookup_is_at_or_before() {
        let mut index = index_for(gz(&b"ABCDEFGH".repeat(100_000)), 64 * 1024);
        index.extend_to_end().unwrap();

        assert_eq!(index.checkpoint_at_or_before(0).unwrap().out_offset, 0);
        let cp = index.checkpoint_at_or_before(400_000).unwrap();
        assert!(cp.out_offset <= 400_000);
        let next = index.span(cp.sequence).unwrap();
        assert!(next.out_start + next.out_len > 400_000);
    }

    #[test]
    fn spans_tile_the_stream() {
        let payload = b"0123456789".repeat(80_000);
        let mut index = index_for(gz(&payload), 64 * 1024);
        index.extend_to_end().unwrap();

        let mut expected_start = 0u64;
        for seq in 0..index.checkpoint_count() as u64 {
            let span = index.span(seq).unwrap();
            assert_eq!(span.out_start, expected_start);
            expected_start += span.out_len;
        }
        assert_eq!(expected_start, payload.len() as u64);
    }

    #[test]
    fn span_end_unknown_until_scanned() {
        let mut index = index_for(gz(&b"z".repeat(500_000)), 64 * 1024);
        index.extend_to(0).unwrap();
        let last = index.checkpoint_count() as u64 - 1;
        assert!(index.span(last).is_none());
        index.extend_to_end().unwrap();
        assert!(index.span(last).is_some());
    }

    #[test]
    fn small_member_is_whole_member_span() {
        let mut index = index_for(gz(b"tiny"), 64 * 1024);
        index.extend_to_end().unwrap();
        let span = index.span(0).unwrap();
        assert!(span.whole_member);
        assert_eq!(span.start_bit % 8, 0);
        assert!(span.dictionary.is_empty());
        assert_eq!(span.out_len, 4);
    }

    #[test]
    fn large_member_spans_are_not_whole() {
        let mut index = index_for(gz(&b"w".repeat(500_000)), 64 * 1024);
        index.extend_to_end().unwrap();
        assert!(!index.span(0).unwrap().whole_member);
    }

    #[test]
    fn multi_member_totals_sum() {
        let mut data = gz(b"first-");
        data.extend_from_slice(&gz(b"second"));
        let mut index = index_for(data, 64 * 1024);
        assert_eq!(index.extend_to_end().unwrap(), 12);

        // Offset 8 falls in the second member.
        let cp = index.checkpoint_at_or_before(8).unwrap();
        assert_eq!(cp.member, 1);
        assert!(cp.member_start);
    }

    #[test]
    fn failure_reported_once_past_member_end() {
        let mut data = gz(b"corrupt me");
        let crc_pos = data.len() - 8;
        data[crc_pos] ^= 0x01;
        let mut index = index_for(data, 64 * 1024);
        index.extend_to_end().unwrap();

        let mut reported = std::collections::HashSet::new();
        assert!(index.unreported_failure(5, &reported).is_none());
        let (member, _) = index.unreported_failure(10, &reported).unwrap();
        assert_eq!(member, 0);
        reported.insert(member);
        assert!(index.unreported_failure(10, &reported).is_none());
    }
}
