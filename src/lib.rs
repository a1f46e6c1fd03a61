//! seekgz: random-access, multi-threaded gzip decompression.
//!
//! A [`ParallelGzReader`] decodes one or more concatenated gzip members with
//! full seek support. A lazy scan discovers deflate block boundaries and
//! records checkpoints (compressed bit offset + 32 KiB dictionary) every
//! ~256 KiB of decompressed output; reads then dispatch inter-checkpoint
//! spans to a worker pool and reassemble the results in strict offset order.
//!
//! ```no_run
//! use std::io::{Read, Seek, SeekFrom};
//! use seekgz::ParallelGzReader;
//!
//! let mut reader = ParallelGzReader::open("big.gz", 4)?;
//! reader.seek(SeekFrom::Start(400_000))?;
//! let mut buf = [0u8; 8];
//! reader.read_exact(&mut buf)?;
//! # Ok::<(), std::io::Error>(())
//! ```

mod assembly;
mod error;
mod gzip;
mod index;
mod inflate;
mod pool;
mod reader;
mod scan;
mod source;
mod test_util;

pub use error::{ChecksumKind, GzError, GzResult, StatusCode};
pub use gzip::MemberTrailer;
pub use index::BlockCheckpoint;
pub use reader::{ParallelGzReader, ReaderOptions};
pub use scan::DEFAULT_CHECKPOINT_SPACING;
pub use source::CompressedSource;
