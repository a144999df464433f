//! `u32-ext-sort` sorts binary files of 4-byte unsigned integers that do not fit in memory.
//!
//! External sorting is required when the data being sorted do not fit into the main memory (RAM) of a computer
//! and instead must reside in slower external memory, usually a hard disk drive. The sorter works in rounds:
//! each round reads one bounded chunk per worker thread, sorts the chunks in parallel and spills them to
//! temporary files, then merges the spills one by one into the output file. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Bounded memory:**
//!   the memory budget is split evenly between the chunks of a round.
//! * **Multithreading support:**
//!   chunks of a round are sorted and spilled in parallel, merges always happen in the same order
//!   so the result does not depend on the number of threads.
//! * **Consistent output:**
//!   every merge result is written to a temporary file and renamed over the output, the output
//!   path never holds a partially merged file.
//!
//! Records are stored little-endian, an input ending with a partial record is rejected by default
//! (see [`TrailingBytes`]).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use u32_ext_sort::ExternalSorterBuilder;
//!
//! fn main() {
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_threads_number(4)
//!         .with_memory_budget(64 * 1024 * 1024)
//!         .with_tmp_dir(Path::new("./"))
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort(Path::new("input.bin"), Path::new("output.bin")).unwrap();
//!     println!("sorted {} records", stats.records);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod merger;
pub mod record;
pub mod sort;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder};
pub use chunk::{sort_and_spill, Spill, SpillDir};
pub use merger::{HeapMerger, Merger};
pub use record::{Record, RecordError, RecordReader, RecordWriter, TrailingBytes, RECORD_WIDTH};
pub use sort::{CancellationToken, ExternalSorter, ExternalSorterBuilder, MergeStrategy, SortError, SortStats};
