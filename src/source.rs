//! Random-access provider of compressed bytes.
//!
//! The whole compressed stream is exposed as a single immutable byte slice so
//! that worker threads can read disjoint regions concurrently without any
//! shared cursor. Files are memory-mapped; an already-open descriptor can be
//! mapped without taking ownership of it.

use std::fs::File;
use std::mem::ManuallyDrop;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{GzError, GzResult};

enum Backing {
    Mapped(Mmap),
    Buffer(Vec<u8>),
}

/// Immutable, concurrently readable view of the compressed stream.
pub struct CompressedSource {
    backing: Backing,
}

impl std::fmt::Debug for CompressedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedSource").finish_non_exhaustive()
    }
}

impl CompressedSource {
    /// Map a regular file. The path must exist and be a readable regular file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> GzResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| GzError::open(format!("{}: {}", path.display(), e)))?;
        let meta = file
            .metadata()
            .map_err(|e| GzError::open(format!("{}: {}", path.display(), e)))?;
        if !meta.is_file() {
            return Err(GzError::open(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        if meta.len() == 0 {
            return Err(GzError::open(format!("{}: empty file", path.display())));
        }
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| GzError::open(format!("{}: mmap failed: {}", path.display(), e)))?;
        Ok(Self {
            backing: Backing::Mapped(map),
        })
    }

    /// Map an already-open file descriptor.
    ///
    /// Ownership of the descriptor is not taken: the caller remains
    /// responsible for closing it. The mapping stays valid even if the
    /// descriptor is closed afterwards.
    ///
    /// # Safety contract
    ///
    /// The descriptor must refer to an open, readable, mappable file.
    #[cfg(unix)]
    pub fn from_raw_fd(fd: std::os::unix::io::RawFd) -> GzResult<Self> {
        use std::os::unix::io::FromRawFd;

        if fd < 0 {
            return Err(GzError::InvalidArgument(format!(
                "invalid file descriptor {}",
                fd
            )));
        }
        // ManuallyDrop keeps the borrowed descriptor open when `file` goes away.
        let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
        let map = unsafe { Mmap::map(&*file) }
            .map_err(|e| GzError::open(format!("fd {}: mmap failed: {}", fd, e)))?;
        Ok(Self {
            backing: Backing::Mapped(map),
        })
    }

    /// Wrap an in-memory compressed buffer.
    pub fn from_buffer(data: Vec<u8>) -> GzResult<Self> {
        if data.is_empty() {
            return Err(GzError::open("empty buffer"));
        }
        Ok(Self {
            backing: Backing::Buffer(data),
        })
    }

    /// The full compressed stream.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => map,
            Backing::Buffer(buf) => buf,
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}
