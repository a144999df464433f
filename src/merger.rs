//! Merging of sorted record files into the output.
//!
//! Every merge writes its result to a temporary file next to the output and renames it
//! over the output once complete, so the output path always holds a fully sorted file.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use log;
use tempfile;

use crate::buffer::ChunkBufferBuilder;
use crate::chunk::Spill;
use crate::record::{Record, RecordReader, RecordWriter, TrailingBytes};
use crate::sort::SortError;

/// Records copied per block when draining the remainder of an input.
pub const DEFAULT_DRAIN_BLOCK: usize = 64 * 1024;

/// Two-way and k-way file merger.
#[derive(Debug, Clone)]
pub struct Merger {
    rw_buf_size: Option<usize>,
    drain_block: usize,
}

impl Merger {
    pub fn new(rw_buf_size: Option<usize>) -> Self {
        Merger {
            rw_buf_size,
            drain_block: DEFAULT_DRAIN_BLOCK,
        }
    }

    /// Sets the number of records copied per block while draining.
    pub fn with_drain_block(mut self, drain_block: usize) -> Self {
        self.drain_block = drain_block.max(1);
        return self;
    }

    /// Merges `spill` into the sorted file at `output`, then removes the spill.
    /// On equal records the spill side is written first.
    /// Returns the number of records in the new output.
    pub fn merge(&self, output: &Path, spill: &Spill) -> Result<u64, SortError> {
        let mut current = self.open(output)?;
        let mut incoming = self.open(&spill.path)?;
        let mut target = MergeTarget::create(output, self.rw_buf_size)?;

        let mut left = next_record(&mut current, output)?;
        let mut right = next_record(&mut incoming, &spill.path)?;

        while let (Some(l), Some(r)) = (left, right) {
            if r <= l {
                target.write(r)?;
                right = next_record(&mut incoming, &spill.path)?;
            } else {
                target.write(l)?;
                left = next_record(&mut current, output)?;
            }
        }

        // at most one side is left, its head record is already consumed from the reader
        if let Some(l) = left {
            target.write(l)?;
            self.drain(&mut current, output, &mut target)?;
        }
        if let Some(r) = right {
            target.write(r)?;
            self.drain(&mut incoming, &spill.path, &mut target)?;
        }

        let written = target.persist(output)?;
        log::debug!(
            "merged {} (records: {}) into {} (records: {})",
            spill.path.display(),
            spill.len,
            output.display(),
            written
        );
        remove_spill(spill);

        Ok(written)
    }

    /// Merges all `spills` into the sorted file at `output` in a single pass, then removes them.
    /// Returns the number of records in the new output.
    pub fn merge_all(&self, output: &Path, spills: &[Spill]) -> Result<u64, SortError> {
        let mut paths = vec![output.to_path_buf()];
        paths.extend(spills.iter().map(|spill| spill.path.clone()));

        let readers = paths.iter().map(|path| self.open(path)).collect::<Result<Vec<_>, _>>()?;
        let mut target = MergeTarget::create(output, self.rw_buf_size)?;

        let merger = HeapMerger::new(readers).map_err(|(idx, err)| SortError::from_record(&paths[idx], err))?;
        for record in merger {
            let record = record.map_err(|(idx, err)| SortError::from_record(&paths[idx], err))?;
            target.write(record)?;
        }

        let written = target.persist(output)?;
        log::debug!("merged {} spills into {} (records: {})", spills.len(), output.display(), written);
        spills.iter().for_each(remove_spill);

        Ok(written)
    }

    fn open(&self, path: &Path) -> Result<RecordReader<fs::File>, SortError> {
        RecordReader::open(path, TrailingBytes::Reject, self.rw_buf_size).map_err(|source| SortError::IO {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Copies everything left in `reader` to `target`, block by block.
    fn drain(&self, reader: &mut RecordReader<fs::File>, path: &Path, target: &mut MergeTarget) -> Result<(), SortError> {
        let mut block = ChunkBufferBuilder::new(self.drain_block).build();
        loop {
            block.clear();
            let read = reader
                .read_chunk(&mut block)
                .map_err(|err| SortError::from_record(path, err))?;
            if read == 0 {
                return Ok(());
            }
            target.write_all(block.as_slice())?;
        }
    }
}

fn next_record(reader: &mut RecordReader<fs::File>, path: &Path) -> Result<Option<Record>, SortError> {
    reader.next_record().map_err(|err| SortError::from_record(path, err))
}

fn remove_spill(spill: &Spill) {
    if let Err(err) = fs::remove_file(&spill.path) {
        log::warn!("spill file {} not removed: {}", spill.path.display(), err);
    }
}

/// Temporary merge result living in the output directory.
/// Deleted on drop unless persisted.
struct MergeTarget {
    path: PathBuf,
    file: tempfile::NamedTempFile,
    writer: RecordWriter<fs::File>,
}

impl MergeTarget {
    fn create(output: &Path, rw_buf_size: Option<usize>) -> Result<Self, SortError> {
        let dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let file = tempfile::Builder::new()
            .prefix(".u32-ext-sort-merge-")
            .tempfile_in(dir)
            .map_err(SortError::TempDir)?;
        let path = file.path().to_path_buf();
        let writer = RecordWriter::new(
            file.reopen().map_err(|source| SortError::IO {
                path: path.clone(),
                source,
            })?,
            rw_buf_size,
        );

        Ok(MergeTarget { path, file, writer })
    }

    fn write(&mut self, record: Record) -> Result<(), SortError> {
        let path = &self.path;
        self.writer.write(record).map_err(|source| SortError::DiskSpace {
            path: path.clone(),
            source,
        })
    }

    fn write_all(&mut self, records: &[Record]) -> Result<(), SortError> {
        let path = &self.path;
        self.writer.write_all(records).map_err(|source| SortError::DiskSpace {
            path: path.clone(),
            source,
        })
    }

    /// Flushes the result and atomically renames it over `output`.
    fn persist(self, output: &Path) -> Result<u64, SortError> {
        let MergeTarget { path, file, writer } = self;
        let written = writer.written();

        writer
            .finish()
            .and_then(|inner| inner.sync_all())
            .map_err(|source| SortError::DiskSpace { path, source })?;

        file.persist(output).map_err(|err| SortError::IO {
            path: output.to_path_buf(),
            source: err.error,
        })?;

        Ok(written)
    }
}

/// Binary heap merger.
/// Merges multiple sorted inputs into a single sorted output. Equal items are taken
/// from the input with the lower index first.
/// Errors carry the index of the input they came from.
pub struct HeapMerger<T, E, I>
where
    T: Ord,
    I: Iterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<(T, usize)>>,
    inputs: Vec<I>,

    /// Input error type.
    error_type: PhantomData<E>,
}

impl<T, E, I> HeapMerger<T, E, I>
where
    T: Ord,
    I: Iterator<Item = Result<T, E>>,
{
    /// Creates a merger and reads the head item of every input.
    /// Input items should be sorted in ascending order otherwise the result is undefined.
    pub fn new(inputs: impl IntoIterator<Item = I>) -> Result<Self, (usize, E)> {
        let mut inputs = Vec::from_iter(inputs);
        let mut items = BinaryHeap::with_capacity(inputs.len());

        for (idx, input) in inputs.iter_mut().enumerate() {
            if let Some(item) = input.next() {
                items.push(Reverse((item.map_err(|err| (idx, err))?, idx)));
            }
        }

        Ok(HeapMerger {
            items,
            inputs,
            error_type: PhantomData,
        })
    }
}

impl<T, E, I> Iterator for HeapMerger<T, E, I>
where
    T: Ord,
    I: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, (usize, E)>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((result, idx)) = self.items.pop()?;
        match self.inputs[idx].next() {
            Some(Ok(item)) => self.items.push(Reverse((item, idx))),
            Some(Err(err)) => return Some(Err((idx, err))),
            None => {}
        }

        Some(Ok(result))
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{self, ErrorKind};
    use std::path::Path;

    use rstest::*;

    use super::{HeapMerger, MergeTarget, Merger};
    use crate::chunk::Spill;
    use crate::record::{self, RecordReader, RecordWriter, TrailingBytes};
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn read_all(path: &Path) -> Vec<u32> {
        let reader = RecordReader::open(path, TrailingBytes::Reject, None).unwrap();
        let records: Result<Vec<u32>, _> = reader.collect();
        records.unwrap()
    }

    fn spill(tmp_dir: &tempfile::TempDir, slot: usize, records: &[u32]) -> Spill {
        let path = tmp_dir.path().join(format!("spill-{}", slot));
        record::write_chunk(&path, records, None).unwrap();
        Spill {
            slot,
            path,
            len: records.len(),
        }
    }

    fn dir_entries(tmp_dir: &tempfile::TempDir) -> Vec<String> {
        let mut names = Vec::from_iter(
            fs::read_dir(tmp_dir.path())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned()),
        );
        names.sort();
        names
    }

    #[rstest]
    #[case(vec![], vec![3, 5], vec![3, 5])]
    #[case(vec![3, 5], vec![1, 8], vec![1, 3, 5, 8])]
    #[case(vec![1, 3, 5, 8], vec![2, 9], vec![1, 2, 3, 5, 8, 9])]
    #[case(vec![1, 2, 3, 5, 8, 9], vec![7], vec![1, 2, 3, 5, 7, 8, 9])]
    #[case(vec![1, 2, 2, 4], vec![2, 2, 3], vec![1, 2, 2, 2, 2, 3, 4])]
    #[case(vec![1, 2], vec![], vec![1, 2])]
    #[case(vec![], vec![], vec![])]
    #[case(vec![10, 11, 12], vec![1, 2], vec![1, 2, 10, 11, 12])]
    fn test_merge(
        tmp_dir: tempfile::TempDir,
        #[case] output: Vec<u32>,
        #[case] incoming: Vec<u32>,
        #[case] expected: Vec<u32>,
    ) {
        let output_path = tmp_dir.path().join("output");
        record::write_chunk(&output_path, &output, None).unwrap();
        let spill = spill(&tmp_dir, 0, &incoming);

        let written = Merger::new(None).merge(&output_path, &spill).unwrap();

        assert_eq!(written, expected.len() as u64);
        assert_eq!(read_all(&output_path), expected);
        assert!(!spill.path.exists());
        assert_eq!(dir_entries(&tmp_dir), vec!["output".to_string()]);
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_merge_drains_remainder_beyond_one_block(tmp_dir: tempfile::TempDir, #[case] spill_tail: bool) {
        let output_path = tmp_dir.path().join("output");
        let (output, incoming) = if spill_tail {
            (vec![0, 1], Vec::from_iter(2..1000u32))
        } else {
            (Vec::from_iter(2..1000u32), vec![0, 1])
        };
        record::write_chunk(&output_path, &output, None).unwrap();
        let spill = spill(&tmp_dir, 1, &incoming);

        let merger = Merger::new(Some(16)).with_drain_block(7);
        merger.merge(&output_path, &spill).unwrap();

        assert_eq!(read_all(&output_path), Vec::from_iter(0..1000u32));
    }

    #[rstest]
    fn test_merge_missing_spill(tmp_dir: tempfile::TempDir) {
        let output_path = tmp_dir.path().join("output");
        record::write_chunk(&output_path, &[1, 2, 3], None).unwrap();
        let missing = Spill {
            slot: 0,
            path: tmp_dir.path().join("spill-0"),
            len: 0,
        };

        match Merger::new(None).merge(&output_path, &missing) {
            Err(SortError::IO { path, .. }) => assert_eq!(path, missing.path),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(read_all(&output_path), vec![1, 2, 3]);
        assert_eq!(dir_entries(&tmp_dir), vec!["output".to_string()]);
    }

    #[cfg(target_os = "linux")]
    #[rstest]
    fn test_merge_write_failure_is_disk_space(tmp_dir: tempfile::TempDir) {
        let output_path = tmp_dir.path().join("output");
        record::write_chunk(&output_path, &[1, 2, 3], None).unwrap();

        let mut target = MergeTarget::create(&output_path, None).unwrap();
        let target_path = target.path.clone();
        target.writer = RecordWriter::new(fs::OpenOptions::new().write(true).open("/dev/full").unwrap(), None);
        target.write(4).unwrap();

        match target.persist(&output_path) {
            Err(SortError::DiskSpace { path, .. }) => assert_eq!(path, target_path),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(read_all(&output_path), vec![1, 2, 3]);
        assert_eq!(dir_entries(&tmp_dir), vec!["output".to_string()]);
    }

    #[rstest]
    fn test_merge_all(tmp_dir: tempfile::TempDir) {
        let output_path = tmp_dir.path().join("output");
        record::write_chunk(&output_path, &[3, 5], None).unwrap();
        let spills = vec![spill(&tmp_dir, 0, &[1, 8]), spill(&tmp_dir, 1, &[2, 9]), spill(&tmp_dir, 2, &[7])];

        let written = Merger::new(None).merge_all(&output_path, &spills).unwrap();

        assert_eq!(written, 7);
        assert_eq!(read_all(&output_path), vec![1, 2, 3, 5, 7, 8, 9]);
        assert_eq!(dir_entries(&tmp_dir), vec!["output".to_string()]);
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![vec![], vec![]], vec![])]
    #[case(
        vec![
            vec![Ok(4), Ok(5), Ok(7)],
            vec![Ok(1), Ok(6)],
            vec![Ok(3)],
            vec![],
        ],
        vec![1, 3, 4, 5, 6, 7],
    )]
    fn test_heap_merger(#[case] inputs: Vec<Vec<Result<u32, io::Error>>>, #[case] expected: Vec<u32>) {
        let merger = HeapMerger::new(inputs.into_iter().map(|input| input.into_iter())).unwrap();
        let actual: Result<Vec<u32>, _> = merger.collect();
        assert_eq!(actual.unwrap(), expected);
    }

    #[test]
    fn test_heap_merger_error() {
        let inputs: Vec<Vec<Result<u32, io::Error>>> = vec![
            vec![Ok(3), Err(io::Error::new(ErrorKind::Other, "test error"))],
            vec![Ok(1), Ok(2)],
        ];
        let merger = HeapMerger::new(inputs.into_iter().map(|input| input.into_iter())).unwrap();

        let actual = Vec::from_iter(merger);
        assert_eq!(actual.len(), 3);
        assert_eq!(actual[0].as_ref().unwrap(), &1);
        assert_eq!(actual[1].as_ref().unwrap(), &2);
        match &actual[2] {
            Err((idx, err)) => {
                assert_eq!(*idx, 0);
                assert_eq!(err.to_string(), "test error");
            }
            Ok(item) => panic!("unexpected item: {}", item),
        }
    }
}
