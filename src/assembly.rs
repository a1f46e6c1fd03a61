//! Reassembly of out-of-order decode results.
//!
//! Workers finish spans in whatever order scheduling allows; the reader
//! consumes them strictly by decompressed offset. This buffer is the only
//! structure shared between the reader thread and the workers: a mutexed
//! map keyed by sequence number plus a condvar the reader parks on until
//! the span it needs arrives.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crate::error::{GzError, GzResult};

/// One decoded span, exactly as long as its index entry promised.
#[derive(Debug)]
pub struct DecodedBlock {
    pub sequence: u64,
    /// Decompressed offset of `bytes[0]`.
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// A span that failed to decode; stored so the waiting reader sees the
/// error instead of blocking forever.
#[derive(Debug, Clone)]
pub struct BlockFailure {
    pub sequence: u64,
    pub reason: String,
}

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, Result<DecodedBlock, BlockFailure>>,
    closed: bool,
}

#[derive(Default)]
pub struct AssemblyBuffer {
    inner: Mutex<Inner>,
    arrived: Condvar,
}

impl AssemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, result: Result<DecodedBlock, BlockFailure>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let sequence = match &result {
            Ok(block) => block.sequence,
            Err(failure) => failure.sequence,
        };
        inner.blocks.insert(sequence, result);
        self.arrived.notify_all();
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.inner.lock().unwrap().blocks.contains_key(&sequence)
    }

    /// Copy bytes from span `sequence`, starting `skip` bytes in, into
    /// `dest`. Blocks until the span arrives. Returns the bytes copied,
    /// which may be fewer than `dest.len()` when the span ends first.
    pub fn copy_from(&self, sequence: u64, skip: usize, dest: &mut [u8]) -> GzResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(GzError::invalid_state("assembly buffer closed"));
            }
            match inner.blocks.get(&sequence) {
                Some(Ok(block)) => {
                    let available = block.bytes.len().saturating_sub(skip);
                    let n = available.min(dest.len());
                    dest[..n].copy_from_slice(&block.bytes[skip..skip + n]);
                    return Ok(n);
                }
                Some(Err(failure)) => {
                    return Err(GzError::BlockDecode {
                        sequence: failure.sequence,
                        reason: failure.reason.clone(),
                    });
                }
                None => {
                    inner = self.arrived.wait(inner).unwrap();
                }
            }
        }
    }

    /// Drop every retained span with sequence below `min_seq`. Evicted spans
    /// can be regenerated from the index if a seek revisits them.
    pub fn evict_below(&self, min_seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks = inner.blocks.split_off(&min_seq);
    }

    /// Number of spans currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject future insertions and wake any waiting reader with an error.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.blocks.clear();
        self.arrived.notify_all();
    }
}
