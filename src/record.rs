//! Fixed-width record streams.
//!
//! Records are 4-byte unsigned integers stored back to back in little-endian byte order.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log;

use crate::buffer::ChunkBuffer;

/// Sortable unit.
pub type Record = u32;

/// Width of a single record in bytes.
pub const RECORD_WIDTH: usize = std::mem::size_of::<Record>();

/// Bytes decoded at once when reading a chunk. A multiple of [`RECORD_WIDTH`].
pub const READ_BLOCK: usize = 64 * 1024;

/// Bytes encoded at once when writing a slice of records. A multiple of [`RECORD_WIDTH`].
const WRITE_BLOCK: usize = 4 * 1024;

/// What to do with an input whose length is not a multiple of [`RECORD_WIDTH`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrailingBytes {
    /// Fail with a malformed input error.
    Reject,
    /// Discard the partial record and log a warning.
    Truncate,
}

impl Default for TrailingBytes {
    fn default() -> Self {
        TrailingBytes::Reject
    }
}

/// Record stream error.
#[derive(Debug)]
pub enum RecordError {
    /// Underlying I/O error.
    IO(io::Error),
    /// Stream ended in the middle of a record.
    Malformed { trailing: usize },
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            RecordError::IO(err) => Some(err),
            RecordError::Malformed { .. } => None,
        }
    }
}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RecordError::IO(err) => write!(f, "I/O operation failed: {}", err),
            RecordError::Malformed { trailing } => {
                write!(f, "stream ends with a partial record ({} trailing bytes)", trailing)
            }
        }
    }
}

impl From<io::Error> for RecordError {
    fn from(err: io::Error) -> Self {
        RecordError::IO(err)
    }
}

/// Buffered sequential reader of records. The cursor only moves forward.
pub struct RecordReader<R: Read> {
    reader: io::BufReader<R>,
    trailing_bytes: TrailingBytes,
    finished: bool,
    /// Raw bytes of the block being decoded by `read_chunk`.
    block: Vec<u8>,
}

impl RecordReader<fs::File> {
    /// Opens a file as a record stream.
    pub fn open(path: &Path, trailing_bytes: TrailingBytes, buf_size: Option<usize>) -> io::Result<Self> {
        Ok(Self::new(fs::File::open(path)?, trailing_bytes, buf_size))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R, trailing_bytes: TrailingBytes, buf_size: Option<usize>) -> Self {
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, inner),
            None => io::BufReader::new(inner),
        };

        RecordReader {
            reader,
            trailing_bytes,
            finished: false,
            block: Vec::new(),
        }
    }

    /// Fills `chunk` up to its limit with the next records of the stream.
    /// Returns the number of records read, zero means end of input.
    ///
    /// Records are decoded block by block straight into the chunk storage, so reading
    /// needs at most [`READ_BLOCK`] bytes on top of the chunk itself.
    pub fn read_chunk(&mut self, chunk: &mut ChunkBuffer) -> Result<usize, RecordError> {
        if self.finished {
            return Ok(0);
        }
        if self.block.is_empty() {
            self.block = vec![0u8; READ_BLOCK];
        }

        let mut read = 0;
        while chunk.remaining() > 0 {
            let wanted = (chunk.remaining() * RECORD_WIDTH).min(self.block.len());
            let filled = fill(&mut self.reader, &mut self.block[..wanted])?;
            let complete = filled / RECORD_WIDTH;

            LittleEndian::read_u32_into(&self.block[..complete * RECORD_WIDTH], chunk.grow(complete));
            read += complete;

            if filled < wanted {
                self.finished = true;
                self.check_trailing(filled % RECORD_WIDTH)?;
                break;
            }
        }

        return Ok(read);
    }

    /// Reads a single record, [`None`] at end of input.
    pub fn next_record(&mut self) -> Result<Option<Record>, RecordError> {
        if self.finished {
            return Ok(None);
        }

        let mut bytes = [0u8; RECORD_WIDTH];
        let filled = fill(&mut self.reader, &mut bytes)?;
        if filled < RECORD_WIDTH {
            self.finished = true;
            self.check_trailing(filled)?;
            return Ok(None);
        }

        Ok(Some(LittleEndian::read_u32(&bytes)))
    }

    fn check_trailing(&self, trailing: usize) -> Result<(), RecordError> {
        if trailing == 0 {
            return Ok(());
        }

        match self.trailing_bytes {
            TrailingBytes::Reject => Err(RecordError::Malformed { trailing }),
            TrailingBytes::Truncate => {
                log::warn!("discarding {} trailing bytes of a partial record", trailing);
                Ok(())
            }
        }
    }
}

/// Reads until `buf` is full or the stream is exhausted, retrying interrupted reads.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(filled)
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Buffered sequential writer of records.
pub struct RecordWriter<W: Write> {
    writer: io::BufWriter<W>,
    written: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W, buf_size: Option<usize>) -> Self {
        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, inner),
            None => io::BufWriter::new(inner),
        };

        RecordWriter { writer, written: 0 }
    }

    pub fn write(&mut self, record: Record) -> io::Result<()> {
        let mut bytes = [0u8; RECORD_WIDTH];
        LittleEndian::write_u32(&mut bytes, record);
        self.writer.write_all(&bytes)?;
        self.written += 1;

        Ok(())
    }

    /// Writes `records` in order, encoding at most [`WRITE_BLOCK`] bytes at a time.
    pub fn write_all(&mut self, records: &[Record]) -> io::Result<()> {
        let mut block = [0u8; WRITE_BLOCK];
        for part in records.chunks(WRITE_BLOCK / RECORD_WIDTH) {
            let bytes = &mut block[..part.len() * RECORD_WIDTH];
            LittleEndian::write_u32_into(part, bytes);
            self.writer.write_all(bytes)?;
            self.written += part.len() as u64;
        }

        Ok(())
    }

    /// Number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes buffered records and returns the inner writer.
    pub fn finish(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|err| err.into_error())
    }
}

/// Overwrites the file at `path` with `records`, in order.
pub fn write_chunk(path: &Path, records: &[Record], buf_size: Option<usize>) -> io::Result<()> {
    let mut writer = RecordWriter::new(fs::File::create(path)?, buf_size);
    writer.write_all(records)?;
    writer.finish()?.sync_all()
}
