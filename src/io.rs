//! Batched record I/O.
//!
//! Run files are raw native-endian concatenations of fixed-size records, so
//! reading and writing them is a matter of blitting bytes. The two types here
//! amortize syscalls over a buffer of records; per-record I/O would dominate
//! merge throughput otherwise.

use std::fs;
use std::io::{self, Read, Write};
use std::mem;

use bytemuck::Pod;

/// Default reader/writer buffer size, in records.
pub const DEFAULT_IO_BUF_RECORDS: usize = 8 * 1024;

/// Buffered reader over a binary file of fixed-size records.
///
/// Holds a buffer of up to `capacity` records and refills it whenever
/// [`advance`](BatchedReader::advance) steps past the last buffered record.
/// A trailing partial record is treated as end-of-file.
pub struct BatchedReader<K> {
    file: fs::File,
    buf: Vec<K>,
    pos: usize,
    count: usize,
    exhausted: bool,
}

impl<K: Pod> BatchedReader<K> {
    /// Creates a reader and fills the buffer with the first portion of the file.
    pub fn new(file: fs::File, capacity: usize) -> io::Result<Self> {
        let mut reader = BatchedReader {
            file,
            buf: vec![K::zeroed(); capacity.max(1)],
            pos: 0,
            count: 0,
            exhausted: false,
        };
        reader.refill()?;

        return Ok(reader);
    }

    fn refill(&mut self) -> io::Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.buf.as_mut_slice());
        let mut filled = 0;
        while filled < bytes.len() {
            match self.file.read(&mut bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        self.count = filled / mem::size_of::<K>();
        self.pos = 0;
        if self.count == 0 {
            self.exhausted = true;
        }

        return Ok(());
    }

    /// Checks whether a current record is available.
    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// The record at the read position.
    /// Only meaningful while [`has_more`](BatchedReader::has_more) returns `true`.
    pub fn current(&self) -> &K {
        &self.buf[self.pos]
    }

    /// Steps past the current record, refilling the buffer once it is drained.
    pub fn advance(&mut self) -> io::Result<()> {
        self.pos += 1;
        if self.pos >= self.count {
            self.refill()?;
        }

        return Ok(());
    }
}

/// Buffered writer producing a binary file of fixed-size records.
///
/// Records are staged into a buffer that is written out whenever it fills up;
/// an explicit [`flush`](BatchedWriter::flush) is required at the end.
pub struct BatchedWriter<K> {
    file: fs::File,
    buf: Vec<K>,
    pos: usize,
}

impl<K: Pod> BatchedWriter<K> {
    pub fn new(file: fs::File, capacity: usize) -> Self {
        BatchedWriter {
            file,
            buf: vec![K::zeroed(); capacity.max(1)],
            pos: 0,
        }
    }

    /// Stores one record, flushing the buffer when it fills up.
    pub fn write(&mut self, record: &K) -> io::Result<()> {
        self.buf[self.pos] = *record;
        self.pos += 1;
        if self.pos >= self.buf.len() {
            self.flush()?;
        }

        return Ok(());
    }

    /// Writes out any buffered records.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pos > 0 {
            self.file.write_all(bytemuck::cast_slice(&self.buf[..self.pos]))?;
            self.pos = 0;
        }

        return Ok(());
    }
}
