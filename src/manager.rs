//! The manager: a single thread that drives sorting, pairing and merging.
//!
//! Producers only touch the ingestion queue; everything else (the pairing
//! queue, the run set, the id counter) is owned by the manager, so no
//! further synchronization is needed.

use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytemuck::Pod;
use crossbeam_channel::Receiver;
use rayon::slice::ParallelSliceMut;

use crate::merge;
use crate::run::{self, RunId};

/// Pause between manager ticks that made no progress.
const IDLE_TICK: Duration = Duration::from_millis(1);

/// Consecutive I/O failures tolerated during drain before giving up.
const DRAIN_RETRY_LIMIT: u32 = 16;

pub(crate) struct Manager<K, F> {
    queue: Receiver<Vec<K>>,
    stop: Arc<AtomicBool>,
    workdir: PathBuf,
    compare: F,
    io_buf_records: usize,
    pool: rayon::ThreadPool,
    /// Sorted batches waiting to be pair-merged into a level-0 run.
    pairing: VecDeque<Vec<K>>,
    /// On-disk runs, ordered by (level ASC, id DESC).
    runs: BTreeSet<RunId>,
    next_run_id: u32,
}

impl<K, F> Manager<K, F>
where
    K: Pod + Send,
    F: Fn(&K, &K) -> Ordering + Copy + Send + Sync,
{
    pub(crate) fn new(
        queue: Receiver<Vec<K>>,
        stop: Arc<AtomicBool>,
        workdir: PathBuf,
        compare: F,
        io_buf_records: usize,
        pool: rayon::ThreadPool,
    ) -> Self {
        Manager {
            queue,
            stop,
            workdir,
            compare,
            io_buf_records,
            pool,
            pairing: VecDeque::new(),
            runs: BTreeSet::new(),
            next_run_id: 0,
        }
    }

    /// Runs the cooperative loop until the stop flag is raised, then hands
    /// the accumulated state back for draining.
    pub(crate) fn run(mut self) -> Self {
        while !self.stop.load(AtomicOrdering::Acquire) {
            if !self.tick() {
                thread::sleep(IDLE_TICK);
            }
        }

        return self;
    }

    /// One manager step: ingest at most one batch, stage at most one level-0
    /// run, then merge equal-level runs to a fixpoint. Returns whether any
    /// progress was made.
    fn tick(&mut self) -> bool {
        let mut progressed = self.ingest_one();
        progressed |= self.pair_merge();
        while self.leveled_merge_step() {
            progressed = true;
        }
        progressed
    }

    /// Non-blocking dequeue of one batch; sorts it into the pairing queue.
    fn ingest_one(&mut self) -> bool {
        match self.queue.try_recv() {
            Ok(batch) => {
                let sorted = self.sort_batch(batch);
                self.pairing.push_back(sorted);
                true
            }
            Err(_) => false,
        }
    }

    fn sort_batch(&self, mut batch: Vec<K>) -> Vec<K> {
        let compare = self.compare;
        self.pool
            .install(|| batch.as_mut_slice().par_sort_unstable_by(|a, b| compare(a, b)));
        batch
    }

    /// Merges the two front pairing-queue batches into a fresh level-0 run.
    ///
    /// Emitting level-0 runs as the merge of two buffers halves the run
    /// count and lowers the depth of the merge tree that follows.
    fn pair_merge(&mut self) -> bool {
        if self.pairing.len() < 2 {
            return false;
        }

        let target = self.alloc_run(0);
        let mut writer = match run::create(&self.workdir, target, self.io_buf_records) {
            Ok(writer) => writer,
            Err(err) => {
                // batches stay queued, the next tick retries
                log::error!("failed to create run file {}: {}", target.filename(), err);
                return false;
            }
        };

        let (first, second) = match (self.pairing.pop_front(), self.pairing.pop_front()) {
            (Some(first), Some(second)) => (first, second),
            _ => return false,
        };

        if let Err(err) = merge::merge_batches(&mut writer, &first, &second, self.compare) {
            log::error!("writing level-0 run {} failed: {}", target.filename(), err);
            run::remove(&self.workdir, target);
            self.pairing.push_front(second);
            self.pairing.push_front(first);
            return false;
        }

        log::debug!(
            "staged level-0 run {} ({} records)",
            target.filename(),
            first.len() + second.len()
        );
        self.runs.insert(target);
        true
    }

    /// Merges the two smallest runs when their levels match. Returns whether
    /// a merge happened; a failed attempt re-queues the inputs for the next
    /// tick instead of spinning.
    fn leveled_merge_step(&mut self) -> bool {
        let (first, second) = {
            let mut candidates = self.runs.iter();
            match (candidates.next().copied(), candidates.next().copied()) {
                (Some(first), Some(second)) if first.level == second.level => (first, second),
                _ => return false,
            }
        };

        self.runs.remove(&first);
        self.runs.remove(&second);
        let merged = self.alloc_run(first.level + 1);

        match self.merge_run_files(first, second, merged) {
            Ok(()) => {
                run::remove(&self.workdir, first);
                run::remove(&self.workdir, second);
                self.runs.insert(merged);
                log::debug!(
                    "merged {} + {} -> {}",
                    first.filename(),
                    second.filename(),
                    merged.filename()
                );
                true
            }
            Err(err) => {
                log::error!("merge into {} failed: {}", merged.filename(), err);
                self.runs.insert(first);
                self.runs.insert(second);
                false
            }
        }
    }

    /// Two-way merge of two run files into `target`. Leaves no partial
    /// output behind on failure.
    fn merge_run_files(&self, a: RunId, b: RunId, target: RunId) -> io::Result<()> {
        let attempt = (|| {
            let mut writer = run::create(&self.workdir, target, self.io_buf_records)?;
            let mut first = run::open(&self.workdir, a, self.io_buf_records)?;
            let mut second = run::open(&self.workdir, b, self.io_buf_records)?;
            merge::merge_readers(&mut writer, &mut first, &mut second, self.compare)
        })();

        if attempt.is_err() {
            run::remove(&self.workdir, target);
        }

        return attempt;
    }

    fn write_batch(&self, batch: &[K], target: RunId) -> io::Result<()> {
        let attempt = (|| {
            let mut writer = run::create(&self.workdir, target, self.io_buf_records)?;
            for record in batch {
                writer.write(record)?;
            }
            writer.flush()
        })();

        if attempt.is_err() {
            run::remove(&self.workdir, target);
        }

        return attempt;
    }

    fn alloc_run(&mut self, level: u32) -> RunId {
        let id = self.next_run_id;
        self.next_run_id += 1;
        RunId::new(id, level)
    }

    /// Terminal phase: flushes everything still in memory to level-0 runs,
    /// then collapses the run set into a single file.
    ///
    /// Unlike the steady-state loop, the collapse merges the two smallest
    /// runs regardless of level; the new run gets level
    /// `max(a, b)` plus one when they were equal. Transient I/O failures
    /// re-queue the inputs, but only [`DRAIN_RETRY_LIMIT`] times in a row.
    pub(crate) fn drain(&mut self) -> io::Result<PathBuf> {
        while let Ok(batch) = self.queue.try_recv() {
            let sorted = self.sort_batch(batch);
            self.pairing.push_back(sorted);
        }

        // remaining batches go to disk unpaired, there may be an odd one out
        let mut failures = 0;
        while let Some(batch) = self.pairing.pop_front() {
            let target = self.alloc_run(0);
            match self.write_batch(&batch, target) {
                Ok(()) => {
                    self.runs.insert(target);
                    failures = 0;
                }
                Err(err) => {
                    log::error!("failed to stage batch as {}: {}", target.filename(), err);
                    self.pairing.push_front(batch);
                    failures += 1;
                    if failures >= DRAIN_RETRY_LIMIT {
                        return Err(err);
                    }
                }
            }
        }

        let mut failures = 0;
        while self.runs.len() > 1 {
            let (first, second) = {
                let mut candidates = self.runs.iter();
                match (candidates.next().copied(), candidates.next().copied()) {
                    (Some(first), Some(second)) => (first, second),
                    _ => break,
                }
            };

            self.runs.remove(&first);
            self.runs.remove(&second);
            let level = if first.level == second.level {
                first.level + 1
            } else {
                first.level.max(second.level)
            };
            let merged = self.alloc_run(level);
            log::debug!(
                "collapsing {} + {} -> {}",
                first.filename(),
                second.filename(),
                merged.filename()
            );

            match self.merge_run_files(first, second, merged) {
                Ok(()) => {
                    run::remove(&self.workdir, first);
                    run::remove(&self.workdir, second);
                    self.runs.insert(merged);
                    failures = 0;
                }
                Err(err) => {
                    log::error!("collapse into {} failed: {}", merged.filename(), err);
                    self.runs.insert(first);
                    self.runs.insert(second);
                    failures += 1;
                    if failures >= DRAIN_RETRY_LIMIT {
                        return Err(err);
                    }
                }
            }
        }

        let last = match self.runs.iter().next().copied() {
            Some(last) => last,
            None => {
                // nothing was ever pushed, an empty run still gives the
                // caller a valid file
                let target = self.alloc_run(0);
                run::create::<K>(&self.workdir, target, self.io_buf_records)?.flush()?;
                self.runs.insert(target);
                target
            }
        };

        return Ok(last.path(&self.workdir));
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use crossbeam_channel::Sender;
    use rstest::*;

    use crate::io::BatchedReader;

    use super::Manager;

    fn make_manager(workdir: &std::path::Path) -> (Sender<Vec<i32>>, Manager<i32, fn(&i32, &i32) -> std::cmp::Ordering>) {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let manager = Manager::new(
            rx,
            Arc::new(AtomicBool::new(false)),
            workdir.to_path_buf(),
            i32::cmp as fn(&i32, &i32) -> std::cmp::Ordering,
            4,
            pool,
        );
        (tx, manager)
    }

    fn read_run(path: &std::path::Path) -> Vec<i32> {
        let file = std::fs::File::open(path).unwrap();
        let mut reader: BatchedReader<i32> = BatchedReader::new(file, 4).unwrap();
        let mut records = Vec::new();
        while reader.has_more() {
            records.push(*reader.current());
            reader.advance().unwrap();
        }
        records
    }

    // Four batches, one ingested per tick: two pair-merges at level 0 whose
    // outputs immediately merge into a single level-1 run. Two level-0 runs
    // must never be left waiting once both merge chances have passed.
    #[rstest]
    fn test_ticks_collapse_equal_levels() {
        let workdir = tempfile::tempdir().unwrap();
        let (tx, mut manager) = make_manager(workdir.path());

        for batch in [vec![8, 4], vec![7, 3], vec![6, 2], vec![5, 1]] {
            tx.send(batch).unwrap();
        }

        assert!(manager.tick()); // ingest
        assert_eq!(manager.pairing.len(), 1);
        assert!(manager.tick()); // ingest + pair to level 0
        assert_eq!(manager.runs.len(), 1);
        assert!(manager.tick()); // ingest
        assert!(manager.tick()); // ingest + pair + leveled merge

        assert_eq!(Vec::from_iter(manager.runs.iter().map(|r| r.level)), vec![1]);

        let path = manager.drain().unwrap();
        assert_eq!(read_run(&path), Vec::from_iter(1..=8));
    }

    // Three batches that never saw a manager tick: each becomes its own
    // level-0 run, two merge into level 1, and the leftover level-0 run
    // joins at level max(0, 1) = 1.
    #[rstest]
    fn test_drain_with_odd_run_count() {
        let workdir = tempfile::tempdir().unwrap();
        let (tx, mut manager) = make_manager(workdir.path());

        tx.send(vec![3, 1]).unwrap();
        tx.send(vec![4, 2]).unwrap();
        tx.send(vec![6, 5]).unwrap();

        let path = manager.drain().unwrap();

        assert!(path.to_string_lossy().ends_with("_1.tmp"));
        assert_eq!(read_run(&path), Vec::from_iter(1..=6));
    }

    #[rstest]
    fn test_drain_without_input_yields_empty_run() {
        let workdir = tempfile::tempdir().unwrap();
        let (_tx, mut manager) = make_manager(workdir.path());

        let path = manager.drain().unwrap();

        assert_eq!(read_run(&path), Vec::<i32>::new());
    }

    // A missing working directory makes run creation fail; the tick must
    // keep the batches queued instead of dropping them.
    #[rstest]
    fn test_failed_run_creation_keeps_batches() {
        let workdir = tempfile::tempdir().unwrap();
        let missing = workdir.path().join("missing");
        let (tx, mut manager) = make_manager(&missing);

        tx.send(vec![2, 1]).unwrap();
        tx.send(vec![4, 3]).unwrap();

        manager.tick();
        manager.tick();

        assert_eq!(manager.pairing.len(), 2);
        assert_eq!(manager.runs.len(), 0);
        assert!(manager.drain().is_err());
    }

    #[rstest]
    fn test_run_files_of_inputs_are_deleted() {
        let workdir = tempfile::tempdir().unwrap();
        let (tx, mut manager) = make_manager(workdir.path());

        for batch in [vec![8, 4], vec![7, 3], vec![6, 2], vec![5, 1]] {
            tx.send(batch).unwrap();
        }
        for _ in 0..4 {
            manager.tick();
        }
        let path = manager.drain().unwrap();

        let mut files = Vec::new();
        for entry in std::fs::read_dir(workdir.path()).unwrap() {
            files.push(entry.unwrap().path());
        }
        assert_eq!(files, vec![path]);
    }

    // Every run file referenced by the run set stays sorted at every tick.
    #[rstest]
    fn test_run_file_invariant_across_ticks() {
        let workdir = tempfile::tempdir().unwrap();
        let (tx, mut manager) = make_manager(workdir.path());

        for chunk in Vec::from_iter((0..64).rev()).chunks(4) {
            tx.send(chunk.to_vec()).unwrap();
        }

        for _ in 0..32 {
            manager.tick();
            for run in &manager.runs {
                let records = read_run(&run.path(workdir.path()));
                assert!(records.windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }
}
