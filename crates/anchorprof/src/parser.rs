//! Reader for measurement logs.
//!
//! A log is a plain sequence of flush blocks with no global header:
//! `FlushHeader`, `name_length` name bytes, `payload_length` payload bytes.
//! A block is only handed out once all of it has been read, so a log that
//! ends mid-block yields every earlier block and then a
//! [`Error::Truncated`] diagnostic.

use crate::error::{Error, Result};
use anchorprof_trace::format::{FLUSH_HEADER_SIZE, RECORD_SIZE, decode_records};
use anchorprof_trace::{FlushHeader, ResultRecord};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Longest anchor name accepted before the header is considered corrupt.
pub const MAX_NAME_LENGTH: u64 = 64 * 1024;

/// One complete flush block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub thread_slot: u64,
    pub name: String,
    pub records: Vec<ResultRecord>,
}

pub struct LogReader<R> {
    reader: R,
    path: PathBuf,
    offset: u64,
    done: bool,
}

impl LogReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(LogReader::new(BufReader::new(file), path))
    }
}

impl<R: Read> LogReader<R> {
    /// `path` only labels diagnostics.
    pub fn new(reader: R, path: &Path) -> Self {
        LogReader {
            reader,
            path: path.to_path_buf(),
            offset: 0,
            done: false,
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next block. `Ok(None)` at a clean end of stream.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        let start = self.offset;

        let mut raw = [0u8; FLUSH_HEADER_SIZE];
        match self.read_full(&mut raw)? {
            0 => return Ok(None),
            FLUSH_HEADER_SIZE => {}
            _ => return Err(self.truncated(start, "block header")),
        }
        let header = FlushHeader::decode(&raw);

        if header.name_length > MAX_NAME_LENGTH {
            return Err(Error::Corrupt {
                path: self.path.clone(),
                offset: start,
                reason: format!(
                    "name length {} exceeds {MAX_NAME_LENGTH}",
                    header.name_length
                ),
            });
        }
        let name = self.read_exact_len(header.name_length, "anchor name")?;
        let payload = self.read_exact_len(header.payload_length, "record payload")?;

        let trailing = payload.len() % RECORD_SIZE;
        if trailing != 0 {
            log::warn!(
                "{}: block at byte {start} has {trailing} stray payload bytes",
                self.path.display()
            );
        }

        Ok(Some(Block {
            thread_slot: header.thread_slot,
            name: clean_name(&name),
            records: decode_records(&payload).collect(),
        }))
    }

    /// Fill `buf` as far as the stream allows; returns the bytes read.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    /// Read exactly `len` bytes. Memory use is bounded by what the stream
    /// actually holds, not by the declared length.
    fn read_exact_len(&mut self, len: u64, what: &'static str) -> Result<Vec<u8>> {
        let start = self.offset;
        let mut buf = Vec::new();
        let read = (&mut self.reader).take(len).read_to_end(&mut buf)?;
        self.offset += read as u64;
        if (read as u64) < len {
            return Err(self.truncated(start, what));
        }
        Ok(buf)
    }

    fn truncated(&self, offset: u64, what: &'static str) -> Error {
        Error::Truncated {
            path: self.path.clone(),
            offset,
            what,
        }
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<Block>;

    /// Stops after the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Trim surrounding whitespace and control bytes from a raw anchor name.
pub fn clean_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c.is_whitespace() || c.is_control())
        .to_string()
}
