//! External sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log;
use rayon::prelude::*;

use crate::buffer::{ChunkBuffer, ChunkBufferBuilder};
use crate::chunk::{self, Spill, SpillDir};
use crate::merger::Merger;
use crate::record::{self, RecordError, RecordReader, TrailingBytes, RECORD_WIDTH};

/// Default total memory budget for in-flight chunks, in bytes.
pub const DEFAULT_MEMORY_BUDGET: u64 = 10 * 1024 * 1024;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Invalid sorter configuration.
    Config(String),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// I/O error on the input, the output or a spill file.
    IO { path: PathBuf, source: io::Error },
    /// Input length is not a multiple of the record width.
    MalformedInput { path: PathBuf, trailing: usize },
    /// Merge result could not be written.
    DiskSpace { path: PathBuf, source: io::Error },
    /// Sorting was cancelled through a [`CancellationToken`].
    Cancelled,
}

impl SortError {
    /// Attaches `path` to a record stream error.
    pub fn from_record(path: &Path, err: RecordError) -> Self {
        match err {
            RecordError::IO(source) => SortError::IO {
                path: path.to_path_buf(),
                source,
            },
            RecordError::Malformed { trailing } => SortError::MalformedInput {
                path: path.to_path_buf(),
                trailing,
            },
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::TempDir(err) => Some(err),
            SortError::IO { source, .. } => Some(source),
            SortError::DiskSpace { source, .. } => Some(source),
            SortError::Config(_) | SortError::MalformedInput { .. } | SortError::Cancelled => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::IO { path, source } => write!(f, "I/O operation on {} failed: {}", path.display(), source),
            SortError::MalformedInput { path, trailing } => write!(
                f,
                "{} is not a sequence of {}-byte records ({} trailing bytes)",
                path.display(),
                RECORD_WIDTH,
                trailing
            ),
            SortError::DiskSpace { path, source } => {
                write!(f, "merge result {} not written: {}", path.display(), source)
            }
            SortError::Cancelled => write!(f, "sorting cancelled"),
        }
    }
}

/// Cancellation token. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// Requests the sorting to stop at the next round or merge boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// How the spills of a round are merged into the output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    /// One two-way merge per spill, in slot order.
    Pairwise,
    /// A single k-way merge of the output and all the spills of the round.
    Heap,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::Pairwise
    }
}

/// Sorting run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Records written to the output.
    pub records: u64,
    /// Rounds performed.
    pub rounds: usize,
    /// Spills merged into the output.
    pub spills: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Debug, Clone, Default)]
pub struct ExternalSorterBuilder {
    /// Number of workers sorting chunks in parallel.
    threads_number: Option<usize>,
    /// Total memory budget of a round in bytes.
    memory_budget: Option<u64>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// File read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Policy for input ending with a partial record.
    trailing_bytes: TrailingBytes,
    merge_strategy: MergeStrategy,
    cancellation: Option<CancellationToken>,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter, SortError> {
        ExternalSorter::new(
            self.threads_number,
            self.memory_budget.unwrap_or(DEFAULT_MEMORY_BUDGET),
            self.tmp_dir.as_deref(),
            self.rw_buf_size,
            self.trailing_bytes,
            self.merge_strategy,
            self.cancellation,
        )
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets total memory budget of a round in bytes.
    pub fn with_memory_budget(mut self, memory_budget: u64) -> ExternalSorterBuilder {
        self.memory_budget = Some(memory_budget);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets policy for input ending with a partial record.
    pub fn with_trailing_bytes(mut self, trailing_bytes: TrailingBytes) -> ExternalSorterBuilder {
        self.trailing_bytes = trailing_bytes;
        return self;
    }

    /// Sets spills merge strategy.
    pub fn with_merge_strategy(mut self, merge_strategy: MergeStrategy) -> ExternalSorterBuilder {
        self.merge_strategy = merge_strategy;
        return self;
    }

    /// Sets a token that can be used to stop sorting.
    pub fn with_cancellation(mut self, token: CancellationToken) -> ExternalSorterBuilder {
        self.cancellation = Some(token);
        return self;
    }
}

/// External sorter.
///
/// Sorting proceeds in rounds: up to `threads_number` chunks are read from the input,
/// sorted and spilled to disk in parallel, then merged one by one into the output.
pub struct ExternalSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Number of chunks per round.
    workers: usize,
    /// Chunk buffer builder.
    buffer_builder: ChunkBufferBuilder,
    /// Directory to be used to store temporary data.
    tmp_path: Option<PathBuf>,
    /// File read/write buffer size.
    rw_buf_size: Option<usize>,
    trailing_bytes: TrailingBytes,
    merge_strategy: MergeStrategy,
    merger: Merger,
    cancellation: Option<CancellationToken>,
}

impl ExternalSorter {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort chunks in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `memory_budget` - Total bytes of chunk data held in memory during a round.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `rw_buf_size` - Files read/write buffer size.
    /// * `trailing_bytes` - Policy for input ending with a partial record.
    /// * `merge_strategy` - How the spills of a round are merged.
    /// * `cancellation` - Token checked between rounds and merges.
    pub fn new(
        threads_number: Option<usize>,
        memory_budget: u64,
        tmp_path: Option<&Path>,
        rw_buf_size: Option<usize>,
        trailing_bytes: TrailingBytes,
        merge_strategy: MergeStrategy,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, SortError> {
        let workers = threads_number.unwrap_or_else(rayon::current_num_threads);
        if workers == 0 {
            return Err(SortError::Config("threads number must be at least 1".into()));
        }

        let buffer_builder = ChunkBufferBuilder::from_memory_budget(memory_budget, workers).ok_or_else(|| {
            SortError::Config(format!(
                "memory budget of {} bytes does not fit one {}-byte record per thread ({} threads)",
                memory_budget, RECORD_WIDTH, workers
            ))
        })?;

        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(workers)?,
            workers,
            buffer_builder,
            tmp_path: tmp_path.map(Path::to_path_buf),
            rw_buf_size,
            trailing_bytes,
            merge_strategy,
            merger: Merger::new(rw_buf_size),
            cancellation,
        });
    }

    fn init_thread_pool(threads_number: usize) -> Result<rayon::ThreadPool, SortError> {
        log::info!("initializing thread-pool (threads: {})", threads_number);

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads_number)
            .build()
            .map_err(SortError::ThreadPoolBuildError)?;

        return Ok(thread_pool);
    }

    /// Records held by a single chunk.
    pub fn chunk_capacity(&self) -> usize {
        self.buffer_builder.buffer_limit()
    }

    /// Sorts records of the file at `input` into the file at `output`.
    /// The output is created empty first and holds a fully sorted file after every merge.
    ///
    /// # Arguments
    /// * `input` - File to be sorted
    /// * `output` - Result file, replaced if exists
    pub fn sort(&self, input: &Path, output: &Path) -> Result<SortStats, SortError> {
        check_distinct(input, output)?;

        let input_file = fs::File::open(input).map_err(|source| SortError::IO {
            path: input.to_path_buf(),
            source,
        })?;
        self.check_input_len(input, &input_file)?;
        let mut reader = RecordReader::new(input_file, self.trailing_bytes, self.rw_buf_size);

        record::write_chunk(output, &[], None).map_err(|source| SortError::IO {
            path: output.to_path_buf(),
            source,
        })?;

        let spill_dir = SpillDir::create(self.tmp_path.as_deref())?;
        log::info!(
            "sorting {} into {} (chunk capacity: {} records, workers: {})",
            input.display(),
            output.display(),
            self.chunk_capacity(),
            self.workers
        );

        let mut stats = SortStats::default();
        let mut exhausted = false;
        while !exhausted {
            self.check_cancelled()?;

            let chunks = self.read_round(&mut reader, input, &mut exhausted)?;
            if chunks.is_empty() {
                break;
            }
            stats.rounds += 1;
            log::debug!("round {}: {} chunks read", stats.rounds, chunks.len());

            let spills = self.sort_round(chunks, &spill_dir)?;
            stats.records = self.merge_round(output, &spills)?;
            stats.spills += spills.len();
        }

        log::info!(
            "sorting done (records: {}, rounds: {}, spills: {})",
            stats.records,
            stats.rounds,
            stats.spills
        );

        return Ok(stats);
    }

    fn check_cancelled(&self) -> Result<(), SortError> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => {
                log::info!("sorting cancelled");
                Err(SortError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    fn check_input_len(&self, input: &Path, input_file: &fs::File) -> Result<(), SortError> {
        let len = input_file
            .metadata()
            .map_err(|source| SortError::IO {
                path: input.to_path_buf(),
                source,
            })?
            .len();

        let trailing = (len % RECORD_WIDTH as u64) as usize;
        if trailing != 0 && self.trailing_bytes == TrailingBytes::Reject {
            return Err(SortError::MalformedInput {
                path: input.to_path_buf(),
                trailing,
            });
        }

        Ok(())
    }

    /// Reads up to one chunk per worker. Sets `exhausted` once the input end is reached.
    fn read_round(
        &self,
        reader: &mut RecordReader<fs::File>,
        input: &Path,
        exhausted: &mut bool,
    ) -> Result<Vec<ChunkBuffer>, SortError> {
        let mut chunks = Vec::with_capacity(self.workers);

        while chunks.len() < self.workers {
            let mut chunk = self.buffer_builder.build();
            reader
                .read_chunk(&mut chunk)
                .map_err(|err| SortError::from_record(input, err))?;

            if chunk.is_empty() {
                *exhausted = true;
                break;
            }

            let full = chunk.is_full();
            chunks.push(chunk);
            if !full {
                *exhausted = true;
                break;
            }
        }

        Ok(chunks)
    }

    /// Sorts and spills chunks in parallel. Returns once every chunk is done, spills in slot order.
    fn sort_round(&self, chunks: Vec<ChunkBuffer>, spill_dir: &SpillDir) -> Result<Vec<Spill>, SortError> {
        let rw_buf_size = self.rw_buf_size;

        let results: Vec<Result<Spill, SortError>> = self.thread_pool.install(|| {
            chunks
                .into_par_iter()
                .enumerate()
                .map(|(slot, chunk)| chunk::sort_and_spill(chunk, slot, spill_dir, rw_buf_size))
                .collect()
        });

        results.into_iter().collect()
    }

    /// Merges spills into the output. Returns the output records count.
    fn merge_round(&self, output: &Path, spills: &[Spill]) -> Result<u64, SortError> {
        match self.merge_strategy {
            MergeStrategy::Pairwise => {
                let mut records = 0;
                for spill in spills {
                    self.check_cancelled()?;
                    records = self.merger.merge(output, spill)?;
                }
                Ok(records)
            }
            MergeStrategy::Heap => self.merger.merge_all(output, spills),
        }
    }
}

/// Fails if `input` and `output` are the same file.
fn check_distinct(input: &Path, output: &Path) -> Result<(), SortError> {
    if let (Ok(input), Ok(output)) = (fs::canonicalize(input), fs::canonicalize(output)) {
        if input == output {
            return Err(SortError::Config(format!(
                "input and output are the same file: {}",
                input.display()
            )));
        }
    }

    Ok(())
}
