//! Bounded in-memory chunk buffers.

use rayon;

use crate::record::{Record, RECORD_WIDTH};

/// Chunk buffer builder. All buffers it builds share the same record limit.
#[derive(Debug, Clone)]
pub struct ChunkBufferBuilder {
    buffer_limit: usize,
}

impl ChunkBufferBuilder {
    pub fn new(buffer_limit: usize) -> Self {
        ChunkBufferBuilder { buffer_limit }
    }

    /// Splits `memory_budget` bytes evenly between `workers` chunks.
    /// Returns [`None`] if a chunk would not fit a single record.
    pub fn from_memory_budget(memory_budget: u64, workers: usize) -> Option<Self> {
        if workers == 0 {
            return None;
        }

        let per_worker = memory_budget / workers as u64;
        let limit = usize::try_from(per_worker / RECORD_WIDTH as u64).ok()?;
        if limit == 0 {
            return None;
        }

        Some(ChunkBufferBuilder::new(limit))
    }

    /// Records per chunk.
    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    /// Creates a new empty buffer.
    pub fn build(&self) -> ChunkBuffer {
        ChunkBuffer::new(self.buffer_limit)
    }
}

/// Buffer limited by records count.
#[derive(Debug)]
pub struct ChunkBuffer {
    limit: usize,
    inner: Vec<Record>,
}

impl ChunkBuffer {
    pub fn new(limit: usize) -> Self {
        ChunkBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    /// Appends records, ignoring the ones beyond the limit.
    pub fn extend(&mut self, records: impl IntoIterator<Item = Record>) {
        let remaining = self.remaining();
        self.inner.extend(records.into_iter().take(remaining));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    /// Number of records that can still be added.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.inner.len())
    }

    /// Appends up to `count` zeroed records, capped by the limit, and returns them for overwriting.
    /// Storage for the whole limit is reserved up front so the buffer never outgrows it.
    pub fn grow(&mut self, count: usize) -> &mut [Record] {
        if self.inner.capacity() < self.limit {
            self.inner.reserve_exact(self.limit - self.inner.len());
        }

        let start = self.inner.len();
        let count = count.min(self.remaining());
        self.inner.resize(start + count, 0);
        &mut self.inner[start..]
    }

    /// Allocated storage in records.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn as_slice(&self) -> &[Record] {
        self.inner.as_slice()
    }
}

impl IntoIterator for ChunkBuffer {
    type Item = Record;
    type IntoIter = <Vec<Record> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl rayon::slice::ParallelSliceMut<Record> for ChunkBuffer {
    fn as_parallel_slice_mut(&mut self) -> &mut [Record] {
        self.inner.as_mut_slice()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::ChunkBufferBuilder;

    #[test]
    fn test_limited_buffer() {
        let builder = ChunkBufferBuilder::new(2);
        let mut buffer = builder.build();

        buffer.extend([0]);
        assert_eq!(buffer.is_full(), false);
        assert_eq!(buffer.remaining(), 1);
        buffer.extend([1, 2]);
        assert_eq!(buffer.is_full(), true);

        let data = Vec::from_iter(buffer);
        assert_eq!(data, vec![0, 1]);
    }

    #[rstest]
    #[case(16, 2, Some(2))]
    #[case(10 * 1024 * 1024, 1, Some(2 * 1024 * 1024 + 512 * 1024))]
    #[case(17, 4, Some(1))]
    #[case(7, 2, None)]
    #[case(1024, 0, None)]
    fn test_from_memory_budget(#[case] budget: u64, #[case] workers: usize, #[case] expected: Option<usize>) {
        let limit = ChunkBufferBuilder::from_memory_budget(budget, workers).map(|b| b.buffer_limit());
        assert_eq!(limit, expected);
    }
}
