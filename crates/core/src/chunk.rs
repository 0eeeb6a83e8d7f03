//! Chunk layout arithmetic and received-chunk tracking.

use crate::error::{Error, Result};
use std::fmt;

/// How a file of `total_size` bytes is split into `chunk_size` pieces.
///
/// Every chunk is exactly `chunk_size` bytes except the last one, which holds
/// the remainder. A layout always describes at least one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: u64,
}

impl ChunkLayout {
    /// Create a layout. Both sizes must be non-zero.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::InvalidTotalSize(
                "total size must be greater than zero".to_string(),
            ));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize {
                size: 0,
                min: 1,
                max: u64::MAX,
            });
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// Declared size of the whole file.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Agreed chunk size.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks: `ceil(total_size / chunk_size)`.
    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Index of the final chunk.
    pub fn last_index(&self) -> u64 {
        self.total_chunks() - 1
    }

    /// Byte offset of a chunk within the file.
    pub fn offset(&self, index: u64) -> Result<u64> {
        self.check_index(index)?;
        Ok(index * self.chunk_size)
    }

    /// Exact byte length a chunk at `index` must have.
    pub fn expected_len(&self, index: u64) -> Result<u64> {
        self.check_index(index)?;
        if index == self.last_index() {
            Ok(self.total_size - self.chunk_size * self.last_index())
        } else {
            Ok(self.chunk_size)
        }
    }

    /// Validate an incoming chunk's position and length.
    pub fn validate_chunk(&self, index: u64, len: u64) -> Result<()> {
        let expected = self.expected_len(index)?;
        if len != expected {
            return Err(Error::ChunkLengthMismatch {
                index,
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let total = self.total_chunks();
        if index >= total {
            return Err(Error::ChunkIndexOutOfRange { index, total });
        }
        Ok(())
    }
}

/// Set of chunk indices in `[0, total)` that have been durably stored.
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedMask {
    total: u64,
    words: Vec<u64>,
    count: u64,
}

impl ReceivedMask {
    /// An empty mask for `total` chunks.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            words: vec![0; total.div_ceil(64) as usize],
            count: 0,
        }
    }

    /// Build a mask from received indices. Duplicates are ignored.
    pub fn from_indices(total: u64, indices: impl IntoIterator<Item = u64>) -> Result<Self> {
        let mut mask = Self::new(total);
        for index in indices {
            mask.insert(index)?;
        }
        Ok(mask)
    }

    /// Mark an index received. Returns `true` if it was not already set.
    pub fn insert(&mut self, index: u64) -> Result<bool> {
        if index >= self.total {
            return Err(Error::ChunkIndexOutOfRange {
                index,
                total: self.total,
            });
        }
        let (word, bit) = Self::position(index);
        let was_set = self.words[word] & bit != 0;
        if !was_set {
            self.words[word] |= bit;
            self.count += 1;
        }
        Ok(!was_set)
    }

    /// Whether `index` has been received.
    pub fn contains(&self, index: u64) -> bool {
        if index >= self.total {
            return false;
        }
        let (word, bit) = Self::position(index);
        self.words[word] & bit != 0
    }

    /// Number of received chunks.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Whether no chunk has been received.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of chunks the mask tracks.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether every chunk has been received.
    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    /// Received indices in ascending order.
    pub fn received(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.total).filter(|i| self.contains(*i))
    }

    /// Missing indices in ascending order.
    pub fn missing(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.total).filter(|i| !self.contains(*i))
    }

    /// Lowest missing index, if any.
    pub fn first_missing(&self) -> Option<u64> {
        self.missing().next()
    }

    /// Fraction of chunks received, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.count as f64 / self.total as f64
    }

    fn position(index: u64) -> (usize, u64) {
        ((index / 64) as usize, 1u64 << (index % 64))
    }
}

impl fmt::Debug for ReceivedMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMask")
            .field("received", &self.count)
            .field("total", &self.total)
            .finish()
    }
}
