//! `spillsort` is a concurrent external (out-of-core) merge sort engine for
//! fixed-size records.
//!
//! Any number of producer threads push record batches into a lock-free
//! ingestion queue; a single background manager sorts each batch in memory,
//! stages pairs of sorted batches to disk as level-0 run files and keeps
//! merging runs of equal level, approximating a balanced binary merge tree
//! while holding at most three files open at a time. Finishing the sort
//! collapses whatever remains into one run file that is streamed back
//! record-by-record.
//!
//! Records are plain fixed-width values (anything implementing
//! [`bytemuck::Pod`]); run files are raw native-endian concatenations of
//! them, so all file I/O reduces to batched byte blits.
//!
//! # Example
//!
//! ```no_run
//! use spillsort::{SpillSorter, SpillSorterBuilder};
//!
//! fn main() {
//!     let sorter: SpillSorter<u64, _> = SpillSorterBuilder::new()
//!         .with_threads(4)
//!         .build()
//!         .unwrap();
//!
//!     sorter.push(&[30, 10, 20]);
//!     sorter.push(&[25, 5]);
//!
//!     let sorted = sorter.finish().unwrap();
//!     sorted.execute(|record| println!("{}", record)).unwrap();
//! }
//! ```

pub mod io;
mod manager;
pub mod merge;
pub mod run;
pub mod sort;

pub use io::{BatchedReader, BatchedWriter};
pub use run::RunId;
pub use sort::{SortError, SortedRun, SpillSorter, SpillSorterBuilder};
