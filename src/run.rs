//! Run files: sorted record sequences staged on disk.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytemuck::Pod;

use crate::io::{BatchedReader, BatchedWriter};

/// Identifier of an on-disk run.
///
/// `id` is unique for the lifetime of the engine. `level` is 0 for runs
/// written straight from in-memory batches and grows by one each time two
/// runs of equal level are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunId {
    pub id: u32,
    pub level: u32,
}

impl RunId {
    pub fn new(id: u32, level: u32) -> Self {
        RunId { id, level }
    }

    /// File name of the run inside the working directory.
    pub fn filename(&self) -> String {
        format!("B{}_{}.tmp", self.id, self.level)
    }

    pub fn path(&self, workdir: &Path) -> PathBuf {
        workdir.join(self.filename())
    }
}

// Runs order by (level ASC, id DESC): the two smallest entries are the merge
// candidates whenever their levels match, and the id tie-break keeps the
// choice deterministic.
impl Ord for RunId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level.cmp(&other.level).then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for RunId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Creates the run file and returns a batched writer over it.
pub fn create<K: Pod>(workdir: &Path, run: RunId, buf_records: usize) -> io::Result<BatchedWriter<K>> {
    let file = fs::File::create(run.path(workdir))?;

    return Ok(BatchedWriter::new(file, buf_records));
}

/// Opens an existing run file for sequential reading.
pub fn open<K: Pod>(workdir: &Path, run: RunId, buf_records: usize) -> io::Result<BatchedReader<K>> {
    let file = fs::File::open(run.path(workdir))?;

    return BatchedReader::new(file, buf_records);
}

/// Removes the run file. A missing file is not an error; other failures are
/// logged and otherwise ignored.
pub fn remove(workdir: &Path, run: RunId) {
    match fs::remove_file(run.path(workdir)) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove run file {}: {}", run.filename(), err),
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use rstest::*;

    use super::RunId;

    #[rstest]
    fn test_filename() {
        assert_eq!(RunId::new(7, 2).filename(), "B7_2.tmp");
    }

    #[rstest]
    fn test_order_is_level_asc_then_id_desc() {
        let runs = BTreeSet::from([
            RunId::new(0, 1),
            RunId::new(3, 0),
            RunId::new(1, 0),
            RunId::new(2, 2),
        ]);

        let ordered = Vec::from_iter(runs);
        assert_eq!(
            ordered,
            vec![
                RunId::new(3, 0),
                RunId::new(1, 0),
                RunId::new(0, 1),
                RunId::new(2, 2),
            ]
        );
    }
}
