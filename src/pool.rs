//! Worker pool that decodes index spans in parallel.
//!
//! Tasks are self-contained: each carries its bit offset, dictionary, and
//! exact output length, so workers share nothing but the immutable source
//! bytes and the assembly buffer. A task either yields a block of exactly
//! `out_len` bytes or a recorded failure; sibling tasks are unaffected.
//!
//! Whole-member spans (byte-aligned start, no dictionary) skip the
//! bit-level inflater and go through libdeflate, which is much faster when
//! resume state is not needed.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use libdeflater::Decompressor;

use crate::assembly::{AssemblyBuffer, BlockFailure, DecodedBlock};
use crate::error::{GzError, GzResult};
use crate::index::Span;
use crate::inflate::Inflater;
use crate::source::CompressedSource;

const TASK_QUEUE_DEPTH: usize = 32;

thread_local! {
    static DECOMPRESSOR: RefCell<Decompressor> = RefCell::new(Decompressor::new());
}

/// One unit of decode work, consumed by exactly one worker.
#[derive(Debug, Clone)]
pub struct DecodeTask {
    pub sequence: u64,
    pub start_bit: u64,
    pub out_offset: u64,
    pub out_len: usize,
    pub dictionary: Arc<[u8]>,
    pub whole_member: bool,
}

impl From<Span> for DecodeTask {
    fn from(span: Span) -> Self {
        Self {
            sequence: span.sequence,
            start_bit: span.start_bit,
            out_offset: span.out_start,
            out_len: span.out_len as usize,
            dictionary: span.dictionary,
            whole_member: span.whole_member,
        }
    }
}

pub struct WorkerPool {
    sender: Option<Sender<DecodeTask>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    threads: usize,
}

impl WorkerPool {
    pub fn new(
        threads: usize,
        source: Arc<CompressedSource>,
        assembly: Arc<AssemblyBuffer>,
    ) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = bounded::<DecodeTask>(TASK_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));

        let handles = (0..threads)
            .map(|_| {
                let receiver = receiver.clone();
                let source = Arc::clone(&source);
                let assembly = Arc::clone(&assembly);
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        assembly.insert(decode_task(source.as_bytes(), &task));
                    }
                })
            })
            .collect();

        Self {
            sender: Some(sender),
            handles,
            shutdown,
            threads,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Queue a task; blocks briefly when the queue is full.
    pub fn submit(&self, task: DecodeTask) -> GzResult<()> {
        match &self.sender {
            Some(sender) => sender
                .send(task)
                .map_err(|_| GzError::invalid_state("worker pool stopped")),
            None => Err(GzError::invalid_state("worker pool shut down")),
        }
    }

    /// Stop accepting work, let queued tasks drain out as no-ops, and join
    /// every worker. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn decode_task(data: &[u8], task: &DecodeTask) -> Result<DecodedBlock, BlockFailure> {
    let fail = |reason: String| BlockFailure {
        sequence: task.sequence,
        reason,
    };

    if task.whole_member && task.start_bit % 8 == 0 && task.dictionary.is_empty() {
        match decode_whole_member(data, task) {
            Ok(bytes) => {
                return Ok(DecodedBlock {
                    sequence: task.sequence,
                    offset: task.out_offset,
                    bytes,
                })
            }
            // Fall back to the bit-level decoder rather than failing the
            // span; it reproduces zlib-compatible streams libdeflate balks at.
            Err(_) => {}
        }
    }

    let mut bytes = Vec::with_capacity(task.out_len);
    let mut inflater = Inflater::new(data, task.start_bit, &task.dictionary);
    while bytes.len() < task.out_len {
        match inflater.next_block(&mut bytes) {
            Ok(true) => break,
            Ok(false) => {}
            Err(err) => return Err(fail(err.to_string())),
        }
    }

    if bytes.len() != task.out_len {
        return Err(fail(format!(
            "span decoded to {} bytes, expected {}",
            bytes.len(),
            task.out_len
        )));
    }

    Ok(DecodedBlock {
        sequence: task.sequence,
        offset: task.out_offset,
        bytes,
    })
}

fn decode_whole_member(data: &[u8], task: &DecodeTask) -> Result<Vec<u8>, ()> {
    let start = (task.start_bit / 8) as usize;
    if start >= data.len() {
        return Err(());
    }
    let mut out = vec![0u8; task.out_len];
    DECOMPRESSOR.with(|cell| {
        let mut decompressor = cell.borrow_mut();
        match decompressor.deflate_decompress(&data[start..], &mut out) {
            Ok(n) if n == task.out_len => Ok(out),
            _ => Err(()),
        }
    })
}
