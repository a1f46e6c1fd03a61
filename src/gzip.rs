//! Gzip member framing: headers, trailers, member bookkeeping.
//!
//! A gzip file is one or more members, each `header + deflate stream +
//! trailer`. The trailer stores the member's CRC32 and ISIZE (decompressed
//! length mod 2^32, a 32-bit field by format definition).

use crate::error::{ChecksumKind, GzError, GzResult};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const CM_DEFLATE: u8 = 8;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xe0;

/// Minimum bytes a member can occupy: 10-byte header + 8-byte trailer.
pub const MIN_MEMBER_LEN: usize = 18;

/// Parse a gzip member header starting at `data[0]`, returning its length.
///
/// Skips the fixed fields plus any FEXTRA/FNAME/FCOMMENT/FHCRC content.
pub fn parse_header(data: &[u8]) -> GzResult<usize> {
    if data.len() < 10 {
        return Err(GzError::truncated("gzip header shorter than 10 bytes"));
    }
    if data[0] != GZIP_MAGIC[0] || data[1] != GZIP_MAGIC[1] {
        return Err(GzError::format("bad gzip magic"));
    }
    if data[2] != CM_DEFLATE {
        return Err(GzError::format(format!(
            "unsupported compression method {}",
            data[2]
        )));
    }
    let flags = data[3];
    if flags & FRESERVED != 0 {
        return Err(GzError::format("reserved header flag bits set"));
    }

    let mut offset = 10;

    if flags & FEXTRA != 0 {
        if offset + 2 > data.len() {
            return Err(GzError::truncated("truncated FEXTRA length"));
        }
        let xlen = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2 + xlen;
    }

    if flags & FNAME != 0 {
        offset = skip_cstring(data, offset)?;
    }

    if flags & FCOMMENT != 0 {
        offset = skip_cstring(data, offset)?;
    }

    if flags & FHCRC != 0 {
        offset += 2;
    }

    if offset > data.len() {
        return Err(GzError::truncated("truncated gzip header"));
    }
    Ok(offset)
}

fn skip_cstring(data: &[u8], mut offset: usize) -> GzResult<usize> {
    while offset < data.len() && data[offset] != 0 {
        offset += 1;
    }
    if offset >= data.len() {
        return Err(GzError::truncated("unterminated header string"));
    }
    Ok(offset + 1)
}

/// The two 32-bit fields stored after each member's deflate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberTrailer {
    pub crc32: u32,
    pub isize: u32,
}

/// Read a member trailer from `data[0..8]`.
pub fn read_trailer(data: &[u8]) -> GzResult<MemberTrailer> {
    if data.len() < 8 {
        return Err(GzError::truncated("truncated gzip trailer"));
    }
    Ok(MemberTrailer {
        crc32: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        isize: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
    })
}

/// A trailer disagreement recorded against a member during scanning.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumFailure {
    pub kind: ChecksumKind,
    pub expected: u32,
    pub actual: u32,
}

impl ChecksumFailure {
    pub fn into_error(self, member: usize) -> GzError {
        GzError::Checksum {
            member,
            kind: self.kind,
            expected: self.expected,
            actual: self.actual,
        }
    }
}

/// Bookkeeping for one gzip member, filled in as the scanner advances.
#[derive(Debug, Clone)]
pub struct MemberRecord {
    /// Byte offset of the member header in the compressed stream.
    pub header_offset: u64,
    /// Bit offset where the member's deflate stream begins.
    pub data_start_bit: u64,
    /// Decompressed offset of the member's first byte.
    pub out_start: u64,
    /// Decompressed length; valid once `complete` is set.
    pub out_len: u64,
    pub trailer: Option<MemberTrailer>,
    pub failure: Option<ChecksumFailure>,
    pub complete: bool,
}

impl MemberRecord {
    pub fn new(header_offset: u64, data_start_bit: u64, out_start: u64) -> Self {
        Self {
            header_offset,
            data_start_bit,
            out_start,
            out_len: 0,
            trailer: None,
            failure: None,
            complete: false,
        }
    }

    /// Decompressed offset one past the member's last byte.
    pub fn out_end(&self) -> u64 {
        self.out_start + self.out_len
    }
}
