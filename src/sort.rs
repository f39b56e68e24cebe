//! External sorter: construction, concurrent ingestion and drain.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytemuck::Pod;
use crossbeam_channel::{Sender, TrySendError};

use crate::io::{BatchedReader, DEFAULT_IO_BUF_RECORDS};
use crate::manager::Manager;

/// Pause between enqueue attempts while the ingestion queue is saturated.
const PUSH_RETRY: Duration = Duration::from_millis(1);

/// Ingestion queue slots provisioned per producer thread.
const QUEUE_SLOTS_PER_THREAD: usize = 8;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Working directory creation error.
    WorkDir(io::Error),
    /// Sorting thread pool initialization error.
    ThreadPool(rayon::ThreadPoolBuildError),
    /// Manager thread spawn error.
    Thread(io::Error),
    /// Run file I/O kept failing during drain, or the final run could not be
    /// streamed.
    Io(io::Error),
    /// The manager thread panicked.
    ManagerPanicked,
}

impl std::error::Error for SortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self {
            SortError::WorkDir(err) => Some(err),
            SortError::ThreadPool(err) => Some(err),
            SortError::Thread(err) => Some(err),
            SortError::Io(err) => Some(err),
            SortError::ManagerPanicked => None,
        }
    }
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::WorkDir(err) => write!(f, "working directory not created: {}", err),
            SortError::ThreadPool(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Thread(err) => write!(f, "manager thread spawn failed: {}", err),
            SortError::Io(err) => write!(f, "run file I/O failed: {}", err),
            SortError::ManagerPanicked => write!(f, "manager thread panicked"),
        }
    }
}

/// External sorter builder. Provides methods for [`SpillSorter`] initialization.
pub struct SpillSorterBuilder<K> {
    /// Number of producer threads expected; sizes the ingestion queue and the
    /// batch sorting pool.
    threads: Option<usize>,
    /// Advisory memory ceiling in bytes.
    max_mem: Option<u64>,
    /// Directory to be used to store run files.
    workdir: Option<PathBuf>,
    /// Run file read/write buffer size, in records.
    io_buf_records: Option<usize>,

    /// Record type.
    record_type: PhantomData<K>,
}

impl<K> SpillSorterBuilder<K>
where
    K: Pod + Send + 'static,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        SpillSorterBuilder::default()
    }

    /// Sets the expected number of producer threads.
    pub fn with_threads(mut self, threads: usize) -> SpillSorterBuilder<K> {
        self.threads = Some(threads);
        return self;
    }

    /// Sets the advisory memory ceiling in bytes. The engine logs the value
    /// but does not enforce it; backpressure comes from the bounded
    /// ingestion queue alone.
    pub fn with_max_mem(mut self, max_mem: u64) -> SpillSorterBuilder<K> {
        self.max_mem = Some(max_mem);
        return self;
    }

    /// Sets the directory run files are staged in. It is created recursively
    /// if absent and is not cleaned up on drop. Without it a temporary
    /// directory is provisioned instead.
    pub fn with_workdir(mut self, path: &Path) -> SpillSorterBuilder<K> {
        self.workdir = Some(path.to_path_buf());
        return self;
    }

    /// Sets the run file read/write buffer size, in records.
    pub fn with_io_buf_records(mut self, records: usize) -> SpillSorterBuilder<K> {
        self.io_buf_records = Some(records);
        return self;
    }

    /// Builds a [`SpillSorter`] ordering records by their natural order.
    pub fn build(self) -> Result<SpillSorter<K, fn(&K, &K) -> Ordering>, SortError>
    where
        K: Ord,
    {
        self.build_with(K::cmp as fn(&K, &K) -> Ordering)
    }

    /// Builds a [`SpillSorter`] using the provided comparator.
    pub fn build_with<F>(self, compare: F) -> Result<SpillSorter<K, F>, SortError>
    where
        F: Fn(&K, &K) -> Ordering + Copy + Send + Sync + 'static,
    {
        SpillSorter::new(
            self.threads,
            self.max_mem,
            self.workdir.as_deref(),
            self.io_buf_records,
            compare,
        )
    }
}

impl<K> Default for SpillSorterBuilder<K> {
    fn default() -> Self {
        SpillSorterBuilder {
            threads: None,
            max_mem: None,
            workdir: None,
            io_buf_records: None,
            record_type: PhantomData,
        }
    }
}

/// Concurrent external sorter over fixed-size records.
///
/// Any number of producer threads feed record batches through
/// [`push`](SpillSorter::push); a single background manager sorts each batch,
/// stages sorted runs to disk and keeps merging equal-level runs so the set
/// of open runs stays small. Once every producer is done,
/// [`finish`](SpillSorter::finish) collapses the remaining state into one
/// sorted run file.
///
/// The output is a total order under the comparator; equal records may appear
/// in any relative order.
pub struct SpillSorter<K, F>
where
    K: Pod + Send + 'static,
    F: Fn(&K, &K) -> Ordering + Copy + Send + Sync + 'static,
{
    queue: Sender<Vec<K>>,
    stop: Arc<AtomicBool>,
    manager: thread::JoinHandle<Manager<K, F>>,
    io_buf_records: usize,
    /// Keeps an engine-provisioned working directory alive until the output
    /// run is dropped.
    tmp_dir: Option<tempfile::TempDir>,
}

impl<K, F> SpillSorter<K, F>
where
    K: Pod + Send + 'static,
    F: Fn(&K, &K) -> Ordering + Copy + Send + Sync + 'static,
{
    fn new(
        threads: Option<usize>,
        max_mem: Option<u64>,
        workdir: Option<&Path>,
        io_buf_records: Option<usize>,
        compare: F,
    ) -> Result<Self, SortError> {
        let threads = threads
            .unwrap_or_else(|| thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1))
            .max(1);

        let (workdir, tmp_dir) = match workdir {
            Some(path) => {
                fs::create_dir_all(path).map_err(SortError::WorkDir)?;
                (path.to_path_buf(), None)
            }
            None => {
                let tmp_dir = tempfile::tempdir().map_err(SortError::WorkDir)?;
                (tmp_dir.path().to_path_buf(), Some(tmp_dir))
            }
        };
        log::info!("using {} as working directory", workdir.display());
        if let Some(max_mem) = max_mem {
            log::info!("memory ceiling (advisory): {} bytes", max_mem);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(SortError::ThreadPool)?;

        let capacity = QUEUE_SLOTS_PER_THREAD * threads;
        let (queue, receiver) = crossbeam_channel::bounded(capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let io_buf_records = io_buf_records.unwrap_or(DEFAULT_IO_BUF_RECORDS);

        let manager = Manager::new(
            receiver,
            Arc::clone(&stop),
            workdir,
            compare,
            io_buf_records,
            pool,
        );
        let manager = thread::Builder::new()
            .name("spillsort-manager".into())
            .spawn(move || manager.run())
            .map_err(SortError::Thread)?;

        log::info!(
            "manager started (threads: {}, queue capacity: {})",
            threads,
            capacity
        );

        return Ok(SpillSorter {
            queue,
            stop,
            manager,
            io_buf_records,
            tmp_dir,
        });
    }

    /// Copies `records` into an owned batch and enqueues it for sorting.
    ///
    /// The caller's slice is never retained. When the ingestion queue is
    /// saturated the call sleeps briefly and retries, so producers are
    /// throttled rather than failed. An empty slice is accepted and consumes
    /// no queue capacity.
    pub fn push(&self, records: &[K]) {
        if records.is_empty() {
            return;
        }

        let mut batch = records.to_vec();
        loop {
            match self.queue.try_send(batch) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    batch = rejected;
                    thread::sleep(PUSH_RETRY);
                }
                Err(TrySendError::Disconnected(rejected)) => {
                    log::error!(
                        "ingestion queue is gone, dropping a batch of {} records",
                        rejected.len()
                    );
                    return;
                }
            }
        }
    }

    /// Stops the manager, flushes every pending batch to disk and collapses
    /// all runs into a single sorted file.
    ///
    /// Every producer must have returned from [`push`](SpillSorter::push)
    /// before this is called.
    pub fn finish(self) -> Result<SortedRun<K>, SortError> {
        self.stop.store(true, AtomicOrdering::Release);
        let mut manager = self.manager.join().map_err(|_| SortError::ManagerPanicked)?;

        let path = manager.drain().map_err(SortError::Io)?;
        log::info!("sorted output staged at {}", path.display());

        return Ok(SortedRun {
            path,
            io_buf_records: self.io_buf_records,
            tmp_dir: self.tmp_dir,
            record_type: PhantomData,
        });
    }
}

/// A fully sorted run staged on disk by [`SpillSorter::finish`].
pub struct SortedRun<K> {
    path: PathBuf,
    io_buf_records: usize,
    tmp_dir: Option<tempfile::TempDir>,
    record_type: PhantomData<K>,
}

impl<K: Pod> SortedRun<K> {
    /// Path of the sorted run file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Streams every record to `consumer` in sorted order.
    pub fn execute<G>(&self, mut consumer: G) -> Result<(), SortError>
    where
        G: FnMut(&K),
    {
        let file = fs::File::open(&self.path).map_err(SortError::Io)?;
        let mut reader = BatchedReader::new(file, self.io_buf_records).map_err(SortError::Io)?;
        while reader.has_more() {
            consumer(reader.current());
            reader.advance().map_err(SortError::Io)?;
        }

        return Ok(());
    }

    /// Releases the run file to the caller. An engine-provisioned working
    /// directory is persisted so the file survives the engine.
    pub fn into_path(self) -> PathBuf {
        if let Some(tmp_dir) = self.tmp_dir {
            let _ = tmp_dir.into_path();
        }
        self.path
    }
}
