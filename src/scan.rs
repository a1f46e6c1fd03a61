//! Incremental scanner over a compressed gzip stream.
//!
//! The scanner walks members block by block with the bit-accurate inflater
//! and yields a stream of events: member starts, spacing-based checkpoints
//! (each carrying the 32 KiB dictionary needed to resume there), member ends
//! with trailer validation, and a final total. The index layers checkpoint
//! bookkeeping on top; workers never see the scanner.

use std::io::{self, Write};
use std::sync::Arc;

use crate::error::{ChecksumKind, GzError, GzResult};
use crate::gzip::{self, ChecksumFailure, MemberTrailer, MIN_MEMBER_LEN};
use crate::inflate::Inflater;
use crate::source::CompressedSource;

/// Default decompressed distance between checkpoints.
pub const DEFAULT_CHECKPOINT_SPACING: u64 = 256 * 1024;

#[derive(Debug)]
pub enum ScanEvent {
    /// A new member begins; its deflate data starts at `data_start_bit`.
    MemberStart {
        member: usize,
        header_offset: u64,
        data_start_bit: u64,
        out_start: u64,
    },
    /// A resumable position inside the current member.
    Checkpoint {
        out_offset: u64,
        bit_offset: u64,
        dictionary: Vec<u8>,
        member: usize,
    },
    /// The current member's deflate stream ended and its trailer was read.
    MemberEnd {
        member: usize,
        out_len: u64,
        trailer: MemberTrailer,
        failure: Option<ChecksumFailure>,
    },
    /// No more members. Emitted on every call once reached.
    Finished { total_out: u64 },
}

enum Phase {
    /// Expecting a member header at this compressed byte offset.
    MemberStart { offset: u64 },
    /// Mid-member; resume decoding at this absolute bit offset.
    InMember { bit: u64, member: usize },
    Done,
    Failed { truncated: bool, msg: String },
}

/// Counts decompressed bytes and feeds the per-member CRC when enabled.
struct ScanSink<'a> {
    hasher: Option<&'a mut crc32fast::Hasher>,
    count: u64,
}

impl Write for ScanSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(hasher) = self.hasher.as_deref_mut() {
            hasher.update(buf);
        }
        self.count += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct BlockScanner {
    source: Arc<CompressedSource>,
    spacing: u64,
    phase: Phase,
    /// Resume dictionary for the next decode step within the current member.
    dict: Vec<u8>,
    /// Running CRC of the current member's decompressed bytes, when enabled.
    crc: Option<crc32fast::Hasher>,
    /// Bytes decompressed so far in the current member.
    member_out: u64,
    /// Bytes decompressed so far across all members.
    total_out: u64,
    member_index: usize,
    verify: bool,
}

impl BlockScanner {
    pub fn new(source: Arc<CompressedSource>, spacing: u64, verify: bool) -> Self {
        Self {
            source,
            spacing: spacing.max(1),
            phase: Phase::MemberStart { offset: 0 },
            dict: Vec::new(),
            crc: None,
            member_out: 0,
            total_out: 0,
            member_index: 0,
            verify,
        }
    }

    /// Toggle trailer verification. Takes effect at the next member start.
    pub fn set_crc32_enabled(&mut self, enabled: bool) {
        self.verify = enabled;
    }

    /// Advance the scan by one event.
    pub fn next_event(&mut self) -> GzResult<ScanEvent> {
        match &self.phase {
            Phase::Done => Ok(ScanEvent::Finished {
                total_out: self.total_out,
            }),
            Phase::Failed { truncated, msg } => {
                if *truncated {
                    Err(GzError::truncated(msg.clone()))
                } else {
                    Err(GzError::format(msg.clone()))
                }
            }
            Phase::MemberStart { offset } => {
                let offset = *offset;
                self.start_member(offset)
            }
            Phase::InMember { bit, member } => {
                let (bit, member) = (*bit, *member);
                self.advance_member(bit, member)
            }
        }
    }

    fn fail(&mut self, err: GzError) -> GzError {
        let truncated = matches!(err, GzError::UnexpectedEof(_));
        self.phase = Phase::Failed {
            truncated,
            msg: err.to_string(),
        };
        err
    }

    fn start_member(&mut self, offset: u64) -> GzResult<ScanEvent> {
        let data = self.source.as_bytes();
        let remaining = &data[offset.min(data.len() as u64) as usize..];

        if remaining.is_empty() {
            self.phase = Phase::Done;
            return Ok(ScanEvent::Finished {
                total_out: self.total_out,
            });
        }

        // After at least one valid member, anything that does not look like
        // another member is treated as trailing garbage and the scan stops.
        if self.member_index > 0
            && (remaining.len() < MIN_MEMBER_LEN || remaining[..2] != gzip::GZIP_MAGIC)
        {
            self.phase = Phase::Done;
            return Ok(ScanEvent::Finished {
                total_out: self.total_out,
            });
        }

        let header_len = match gzip::parse_header(remaining) {
            Ok(len) => len,
            Err(err) => return Err(self.fail(err)),
        };

        let member = self.member_index;
        let data_start_bit = (offset + header_len as u64) * 8;
        self.phase = Phase::InMember {
            bit: data_start_bit,
            member,
        };
        self.dict.clear();
        self.member_out = 0;
        self.crc = self.verify.then(crc32fast::Hasher::new);

        Ok(ScanEvent::MemberStart {
            member,
            header_offset: offset,
            data_start_bit,
            out_start: self.total_out,
        })
    }

    fn advance_member(&mut self, bit: u64, member: usize) -> GzResult<ScanEvent> {
        let source = Arc::clone(&self.source);
        let data = source.as_bytes();

        let dict = std::mem::take(&mut self.dict);
        let mut inflater = Inflater::new(data, bit, &dict);
        let mut sink = ScanSink {
            hasher: self.crc.as_mut(),
            count: 0,
        };

        let mut finished = false;
        while sink.count < self.spacing {
            match inflater.next_block(&mut sink) {
                Ok(true) => {
                    finished = true;
                    break;
                }
                Ok(false) => {}
                Err(err) => {
                    let err = if err.kind() == io::ErrorKind::UnexpectedEof {
                        GzError::truncated(format!("member {}: {}", member, err))
                    } else {
                        GzError::format(format!("member {}: {}", member, err))
                    };
                    return Err(self.fail(err));
                }
            }
        }

        self.member_out += sink.count;
        self.total_out += sink.count;

        if !finished {
            self.dict = inflater.dictionary();
            let bit_offset = inflater.bit_position();
            self.phase = Phase::InMember {
                bit: bit_offset,
                member,
            };
            return Ok(ScanEvent::Checkpoint {
                out_offset: self.total_out,
                bit_offset,
                dictionary: self.dict.clone(),
                member,
            });
        }

        // Deflate stream done: the trailer starts at the next byte boundary.
        let trailer_offset = (inflater.bit_position() + 7) / 8;
        let trailer = match gzip::read_trailer(&data[trailer_offset.min(data.len() as u64) as usize..])
        {
            Ok(trailer) => trailer,
            Err(err) => return Err(self.fail(err)),
        };

        let failure = self.check_trailer(&trailer);
        let out_len = self.member_out;

        self.member_index += 1;
        self.phase = Phase::MemberStart {
            offset: trailer_offset + 8,
        };

        Ok(ScanEvent::MemberEnd {
            member,
            out_len,
            trailer,
            failure,
        })
    }

    fn check_trailer(&mut self, trailer: &MemberTrailer) -> Option<ChecksumFailure> {
        let hasher = self.crc.take()?;
        let actual_crc = hasher.finalize();
        if actual_crc != trailer.crc32 {
            return Some(ChecksumFailure {
                kind: ChecksumKind::Crc32,
                expected: trailer.crc32,
                actual: actual_crc,
            });
        }
        let actual_isize = (self.member_out & 0xffff_ffff) as u32;
        if actual_isize != trailer.isize {
            return Some(ChecksumFailure {
                kind: ChecksumKind::Isize,
                expected: trailer.isize,
                actual: actual_isize,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gz(payload: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    fn scanner_for(data: Vec<u8>, spacing: u64, verify: bool) -> BlockScanner {
        let source = Arc::new(CompressedSource::from_buffer(data).unwrap());
        BlockScanner::new(source, spacing, verify)
    }

    fn drain(scanner: &mut BlockScanner) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        loop {
            let event = scanner.next_event().unwrap();
            let done = matches!(event, ScanEvent::Finished { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[test]
    fn single_member_scan() {
        let payload = b"ABCDEFGH".repeat(100_000);
        let mut scanner = scanner_for(gz(&payload), DEFAULT_CHECKPOINT_SPACING, true);
        let events = drain(&mut scanner);

        assert!(matches!(events[0], ScanEvent::MemberStart { member: 0, .. }));
        let checkpoints = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Checkpoint { .. }))
            .count();
        assert!(checkpoints >= 2, "800000 bytes should span checkpoints");
        match events[events.len() - 2] {
            ScanEvent::MemberEnd {
                out_len, failure, ..
            } => {
                assert_eq!(out_len, payload.len() as u64);
                assert!(failure.is_none());
            }
            ref other => panic!("expected MemberEnd, got {:?}", other),
        }
        match events[events.len() - 1] {
            ScanEvent::Finished { total_out } => assert_eq!(total_out, payload.len() as u64),
            ref other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn checkpoint_resumes_cleanly() {
        let payload = b"the quick brown fox jumps over the lazy dog ".repeat(20_000);
        let compressed = gz(&payload);
        let mut scanner = scanner_for(compressed.clone(), 64 * 1024, false);

        let (bit, dict, offset) = loop {
            match scanner.next_event().unwrap() {
                ScanEvent::Checkpoint {
                    bit_offset,
                    dictionary,
                    out_offset,
                    ..
                } => break (bit_offset, dictionary, out_offset),
                ScanEvent::Finished { .. } => panic!("no checkpoint emitted"),
                _ => {}
            }
        };

        let mut inflater = Inflater::new(&compressed, bit, &dict);
        let mut rest = Vec::new();
        while !inflater.next_block(&mut rest).unwrap() {}
        assert_eq!(rest, &payload[offset as usize..]);
    }

    #[test]
    fn two_members_scanned_in_order() {
        let mut data = gz(b"first member ");
        data.extend_from_slice(&gz(b"second member"));
        let mut scanner = scanner_for(data, DEFAULT_CHECKPOINT_SPACING, true);
        let events = drain(&mut scanner);

        let starts: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::MemberStart { out_start, .. } => Some(*out_start),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 13]);
        match events.last().unwrap() {
            ScanEvent::Finished { total_out } => assert_eq!(*total_out, 26),
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn trailing_garbage_after_member_is_ignored() {
        let mut data = gz(b"payload");
        data.extend_from_slice(b"\x00\x01\x02not gzip");
        let mut scanner = scanner_for(data, DEFAULT_CHECKPOINT_SPACING, true);
        let events = drain(&mut scanner);
        match events.last().unwrap() {
            ScanEvent::Finished { total_out } => assert_eq!(*total_out, 7),
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn corrupt_crc_reported_when_enabled() {
        let mut data = gz(b"checksummed payload");
        let crc_pos = data.len() - 8;
        data[crc_pos] ^= 0xff;

        let mut scanner = scanner_for(data.clone(), DEFAULT_CHECKPOINT_SPACING, true);
        let failure = drain(&mut scanner).into_iter().find_map(|e| match e {
            ScanEvent::MemberEnd { failure, .. } => failure,
            _ => None,
        });
        let failure = failure.expect("mismatch should be recorded");
        assert_eq!(failure.kind, ChecksumKind::Crc32);

        // With verification off the same stream scans cleanly.
        let mut scanner = scanner_for(data, DEFAULT_CHECKPOINT_SPACING, false);
        let failure = drain(&mut scanner).into_iter().find_map(|e| match e {
            ScanEvent::MemberEnd { failure, .. } => failure,
            _ => None,
        });
        assert!(failure.is_none());
    }

    #[test]
    fn truncated_member_fails_with_eof() {
        let data = gz(&b"a longer payload that compresses ".repeat(100));
        let mut scanner = scanner_for(data[..data.len() / 2].to_vec(), 1024, true);
        let err = loop {
            match scanner.next_event() {
                Ok(ScanEvent::Finished { .. }) => panic!("truncated stream finished cleanly"),
                Ok(_) => {}
                Err(err) => break err,
            }
        };
        assert!(matches!(err, GzError::UnexpectedEof(_)));

        // The failure is sticky.
        assert!(scanner.next_event().is_err());
    }

    #[test]
    fn non_gzip_input_rejected() {
        let mut scanner = scanner_for(b"plain text, not gzip at all".to_vec(), 1024, true);
        assert!(matches!(scanner.next_event(), Err(GzError::Format(_))));
    }
}
