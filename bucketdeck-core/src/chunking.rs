//! Fixed-size chunk planning for multipart uploads

use std::ops::Range;

use crate::{DeckError, PartNumber, Result, MAX_PART_NUMBER};

/// Smallest part size S3 accepts for every part but the last (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Default chunk size (10 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// One part of a source, addressed by byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub part_number: PartNumber,
    pub offset: u64,
    pub len: u64,
}

impl Chunk {
    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

/// Partition of `[0, total_size)` into `ceil(total_size / chunk_size)` chunks.
///
/// An empty source has no chunks; uploading it bypasses multipart entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    part_count: u32,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(DeckError::InvalidInput("chunk size must be positive".to_string()));
        }

        let parts = total_size.div_ceil(chunk_size);
        if parts > MAX_PART_NUMBER as u64 {
            return Err(DeckError::InvalidInput(format!(
                "{} bytes at {} bytes per chunk needs {} parts, limit is {}",
                total_size, chunk_size, parts, MAX_PART_NUMBER
            )));
        }

        Ok(ChunkPlan {
            total_size,
            chunk_size,
            part_count: parts as u32,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    pub fn is_empty(&self) -> bool {
        self.part_count == 0
    }

    /// Chunk at a 0-based claim index
    pub fn chunk(&self, index: usize) -> Option<Chunk> {
        if index >= self.part_count as usize {
            return None;
        }

        let offset = index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.total_size - offset);
        Some(Chunk {
            part_number: PartNumber::new(index as u32 + 1).ok()?,
            offset,
            len,
        })
    }

    /// Chunk for a 1-based part number
    pub fn part(&self, part_number: PartNumber) -> Option<Chunk> {
        self.chunk(part_number.get() as usize - 1)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.part_count as usize).filter_map(move |index| self.chunk(index))
    }
}
