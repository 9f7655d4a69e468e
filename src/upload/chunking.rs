//! Fixed-size partitioning of a file into upload chunks.
//!
//! Ranges are computed on demand; the bytes behind them are only read when
//! the chunk is about to be sent.

use std::ops::Range;
use super::types::UploadId;

/// 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub task_id: UploadId,
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

/// How a file of a given size travels to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// One whole-file request
    Direct,
    Chunked { total_chunks: u32 },
}

pub fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as u32
}

pub fn chunk_range(size: u64, chunk_size: u64, index: u32) -> Range<u64> {
    let start = (index as u64 * chunk_size).min(size);
    let end = ((index as u64 + 1) * chunk_size).min(size);
    start..end
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    pub task_id: UploadId,
    pub size: u64,
    pub chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(task_id: UploadId, size: u64, chunk_size: u64) -> Self {
        Self { task_id, size, chunk_size }
    }

    pub fn path(&self) -> TransferPath {
        if self.size <= self.chunk_size {
            TransferPath::Direct
        } else {
            TransferPath::Chunked { total_chunks: self.chunk_count() }
        }
    }

    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.size, self.chunk_size)
    }

    pub fn descriptor(&self, index: u32) -> ChunkDescriptor {
        let range = chunk_range(self.size, self.chunk_size, index);
        ChunkDescriptor {
            task_id: self.task_id,
            index,
            start: range.start,
            end: range.end,
        }
    }

    /// Consecutive index windows of at most `batch_size` chunks.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Range<u32>> {
        let total = self.chunk_count();
        let step = batch_size.max(1) as u32;
        (0..total).step_by(step as usize).map(move |start| start..(start + step).min(total))
    }

    /// Bytes covered by the first `uploaded_chunks` chunks.
    pub fn bytes_for_chunks(&self, uploaded_chunks: u32) -> u64 {
        (uploaded_chunks as u64 * self.chunk_size).min(self.size)
    }
}
