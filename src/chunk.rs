//! Chunk sorting and spill storage.

use std::path::{Path, PathBuf};

use log;
use rayon::slice::ParallelSliceMut;
use tempfile;

use crate::buffer::ChunkBuffer;
use crate::record;
use crate::sort::SortError;

/// Per-run directory holding spill files. Removed with its content on drop.
pub struct SpillDir {
    dir: tempfile::TempDir,
}

impl SpillDir {
    /// Creates a fresh spill directory inside `tmp_path`, or inside the OS temporary directory if [`None`].
    pub fn create(tmp_path: Option<&Path>) -> Result<Self, SortError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("u32-ext-sort-");

        let dir = if let Some(tmp_path) = tmp_path {
            builder.tempdir_in(tmp_path)
        } else {
            builder.tempdir()
        }
        .map_err(SortError::TempDir)?;

        log::info!("using {} as a temporary directory", dir.path().display());

        Ok(SpillDir { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Spill file path owned by worker slot `slot`.
    pub fn slot_path(&self, slot: usize) -> PathBuf {
        self.path().join(format!("spill-{}", slot))
    }
}

/// Sorted chunk stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spill {
    /// Worker slot the spill belongs to.
    pub slot: usize,
    pub path: PathBuf,
    /// Number of records in the spill.
    pub len: usize,
}

/// Sorts `chunk` in ascending order and writes it to the spill file of `slot`,
/// replacing whatever a previous round left there.
pub fn sort_and_spill(
    mut chunk: ChunkBuffer,
    slot: usize,
    spill_dir: &SpillDir,
    rw_buf_size: Option<usize>,
) -> Result<Spill, SortError> {
    log::debug!("sorting chunk (slot: {}, records: {}) ...", slot, chunk.len());
    chunk.par_sort_unstable();

    let path = spill_dir.slot_path(slot);
    log::debug!("saving chunk data to {}", path.display());
    record::write_chunk(&path, chunk.as_slice(), rw_buf_size).map_err(|source| SortError::IO {
        path: path.clone(),
        source,
    })?;

    Ok(Spill {
        slot,
        path,
        len: chunk.len(),
    })
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{sort_and_spill, SpillDir};
    use crate::buffer::ChunkBufferBuilder;
    use crate::record::{RecordReader, TrailingBytes};

    #[fixture]
    fn spill_dir() -> SpillDir {
        SpillDir::create(None).unwrap()
    }

    fn read_all(path: &std::path::Path) -> Vec<u32> {
        let reader = RecordReader::open(path, TrailingBytes::Reject, None).unwrap();
        let records: Result<Vec<u32>, _> = reader.collect();
        records.unwrap()
    }

    #[rstest]
    fn test_sort_and_spill(spill_dir: SpillDir) {
        let mut input = Vec::from_iter(0..100u32);
        input.shuffle(&mut rand::thread_rng());

        let mut chunk = ChunkBufferBuilder::new(100).build();
        chunk.extend(input);

        let spill = sort_and_spill(chunk, 3, &spill_dir, None).unwrap();

        assert_eq!(spill.slot, 3);
        assert_eq!(spill.len, 100);
        assert_eq!(spill.path, spill_dir.slot_path(3));
        assert_eq!(read_all(&spill.path), Vec::from_iter(0..100u32));
    }

    #[rstest]
    fn test_spill_slot_is_overwritten(spill_dir: SpillDir) {
        let builder = ChunkBufferBuilder::new(4);

        let mut first = builder.build();
        first.extend([9, 8, 7, 6]);
        sort_and_spill(first, 0, &spill_dir, None).unwrap();

        let mut second = builder.build();
        second.extend([2, 1]);
        let spill = sort_and_spill(second, 0, &spill_dir, None).unwrap();

        assert_eq!(read_all(&spill.path), vec![1, 2]);
    }

    #[test]
    fn test_spill_dir_removed_on_drop() {
        let spill_dir = SpillDir::create(None).unwrap();
        let path = spill_dir.path().to_path_buf();
        assert!(path.is_dir());

        drop(spill_dir);
        assert!(!path.exists());
    }
}
