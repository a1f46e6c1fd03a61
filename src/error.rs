use std::fmt;
use std::io;
use thiserror::Error;

/// Which trailer field disagreed with the decoded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// The CRC32 stored in the member trailer.
    Crc32,
    /// The ISIZE field (decompressed length mod 2^32).
    Isize,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Crc32 => write!(f, "CRC32"),
            ChecksumKind::Isize => write!(f, "ISIZE"),
        }
    }
}

#[derive(Error, Debug)]
pub enum GzError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("open failed: {0}")]
    Open(String),

    #[error("malformed gzip stream: {0}")]
    Format(String),

    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),

    #[error("block {sequence} failed to decode: {reason}")]
    BlockDecode { sequence: u64, reason: String },

    #[error("{kind} mismatch in member {member}: stored {expected:#010x}, computed {actual:#010x}")]
    Checksum {
        member: usize,
        kind: ChecksumKind,
        expected: u32,
        actual: u32,
    },

    #[error("seek error: {0}")]
    Seek(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl GzError {
    pub fn open<T: fmt::Display>(msg: T) -> Self {
        GzError::Open(msg.to_string())
    }

    pub fn format<T: fmt::Display>(msg: T) -> Self {
        GzError::Format(msg.to_string())
    }

    pub fn truncated<T: fmt::Display>(msg: T) -> Self {
        GzError::UnexpectedEof(msg.to_string())
    }

    pub fn invalid_state<T: fmt::Display>(msg: T) -> Self {
        GzError::InvalidState(msg.to_string())
    }

    pub fn seek<T: fmt::Display>(msg: T) -> Self {
        GzError::Seek(msg.to_string())
    }

    /// The discriminated status code for this error, for callers that speak
    /// small integers across a binding boundary rather than Rust errors.
    pub fn status(&self) -> StatusCode {
        match self {
            GzError::Open(_) => StatusCode::OpenFailed,
            GzError::Io(_)
            | GzError::Format(_)
            | GzError::UnexpectedEof(_)
            | GzError::BlockDecode { .. }
            | GzError::Checksum { .. } => StatusCode::ReadFailed,
            GzError::Seek(_) => StatusCode::SeekFailed,
            GzError::InvalidState(_) | GzError::InvalidArgument(_) => StatusCode::InvalidArgument,
        }
    }
}

impl From<GzError> for io::Error {
    fn from(err: GzError) -> io::Error {
        match err {
            GzError::Io(e) => e,
            GzError::UnexpectedEof(msg) => io::Error::new(io::ErrorKind::UnexpectedEof, msg),
            GzError::InvalidState(msg) | GzError::InvalidArgument(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

/// Status codes reported across the non-Rust caller boundary.
///
/// `Eof` is a status, not an error: a read that returns `Ok(0)` at end of
/// stream maps to it.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    InvalidArgument = -1,
    OpenFailed = -2,
    ReadFailed = -3,
    SeekFailed = -4,
    Eof = -5,
    Unknown = -99,
}

impl StatusCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            -1 => StatusCode::InvalidArgument,
            -2 => StatusCode::OpenFailed,
            -3 => StatusCode::ReadFailed,
            -4 => StatusCode::SeekFailed,
            -5 => StatusCode::Eof,
            _ => StatusCode::Unknown,
        }
    }
}

pub type GzResult<T> = Result<T, GzError>;
