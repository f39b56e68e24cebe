//! Two-way merges of sorted record sequences.

use std::cmp::Ordering;
use std::io;

use bytemuck::Pod;

use crate::io::{BatchedReader, BatchedWriter};

/// Merge-writes two sorted slices, smaller record first. When neither record
/// precedes the other, the one from `first` is emitted.
pub fn merge_batches<K, F>(
    writer: &mut BatchedWriter<K>,
    first: &[K],
    second: &[K],
    compare: F,
) -> io::Result<()>
where
    K: Pod,
    F: Fn(&K, &K) -> Ordering,
{
    let mut i = 0;
    let mut j = 0;
    while i < first.len() && j < second.len() {
        if compare(&second[j], &first[i]) == Ordering::Less {
            writer.write(&second[j])?;
            j += 1;
        } else {
            writer.write(&first[i])?;
            i += 1;
        }
    }
    for record in &first[i..] {
        writer.write(record)?;
    }
    for record in &second[j..] {
        writer.write(record)?;
    }

    return writer.flush();
}

/// Merge-writes two sorted run files. Tie handling matches [`merge_batches`];
/// once one side is exhausted the remainder of the other is copied through.
pub fn merge_readers<K, F>(
    writer: &mut BatchedWriter<K>,
    first: &mut BatchedReader<K>,
    second: &mut BatchedReader<K>,
    compare: F,
) -> io::Result<()>
where
    K: Pod,
    F: Fn(&K, &K) -> Ordering,
{
    while first.has_more() && second.has_more() {
        if compare(second.current(), first.current()) == Ordering::Less {
            writer.write(second.current())?;
            second.advance()?;
        } else {
            writer.write(first.current())?;
            first.advance()?;
        }
    }
    while first.has_more() {
        writer.write(first.current())?;
        first.advance()?;
    }
    while second.has_more() {
        writer.write(second.current())?;
        second.advance()?;
    }

    return writer.flush();
}

#[cfg(test)]
mod test {
    use std::io::Seek;

    use rand::prelude::*;
    use rstest::*;

    use crate::io::{BatchedReader, BatchedWriter};

    use super::{merge_batches, merge_readers};

    fn read_back(mut file: std::fs::File, capacity: usize) -> Vec<u32> {
        file.rewind().unwrap();
        let mut reader: BatchedReader<u32> = BatchedReader::new(file, capacity).unwrap();
        let mut records = Vec::new();
        while reader.has_more() {
            records.push(*reader.current());
            reader.advance().unwrap();
        }
        records
    }

    fn write_run(records: &[u32], capacity: usize) -> std::fs::File {
        let file = tempfile::tempfile().unwrap();
        let mut writer = BatchedWriter::new(file.try_clone().unwrap(), capacity);
        for record in records {
            writer.write(record).unwrap();
        }
        writer.flush().unwrap();
        let mut file = file;
        file.rewind().unwrap();
        file
    }

    #[rstest]
    #[case(vec![], vec![], vec![])]
    #[case(vec![1, 3, 5], vec![], vec![1, 3, 5])]
    #[case(vec![], vec![2, 4], vec![2, 4])]
    #[case(vec![1, 4, 5], vec![2, 3, 6], vec![1, 2, 3, 4, 5, 6])]
    #[case(vec![7, 7], vec![7, 7, 7], vec![7, 7, 7, 7, 7])]
    fn test_merge_batches(#[case] first: Vec<u32>, #[case] second: Vec<u32>, #[case] expected: Vec<u32>) {
        let out = tempfile::tempfile().unwrap();
        let mut writer = BatchedWriter::new(out.try_clone().unwrap(), 4);

        merge_batches(&mut writer, &first, &second, u32::cmp).unwrap();

        assert_eq!(read_back(out, 4), expected);
    }

    // Run sizes that are not multiples of the reader buffer must not lose or
    // duplicate records at refill boundaries.
    #[rstest]
    fn test_merge_readers_across_refill_boundaries() {
        let mut rng = StdRng::seed_from_u64(11);

        let mut first = Vec::from_iter((0..700).map(|_| rng.gen::<u32>()));
        let mut second = Vec::from_iter((0..1300).map(|_| rng.gen::<u32>()));
        first.sort_unstable();
        second.sort_unstable();

        let mut r1 = BatchedReader::new(write_run(&first, 512), 512).unwrap();
        let mut r2 = BatchedReader::new(write_run(&second, 512), 512).unwrap();

        let out = tempfile::tempfile().unwrap();
        let mut writer = BatchedWriter::new(out.try_clone().unwrap(), 512);
        merge_readers(&mut writer, &mut r1, &mut r2, u32::cmp).unwrap();

        let merged = read_back(out, 512);
        let mut expected = [first, second].concat();
        expected.sort_unstable();

        assert_eq!(merged.len(), 2000);
        assert_eq!(merged, expected);
    }
}
