//! Binary log format shared by the runtime writer and the offline reader.
//!
//! A log is a plain concatenation of flush blocks with no global header:
//!
//! ```text
//! FlushHeader { thread_slot: u64, name_length: u64, payload_length: u64 }
//! name bytes      (name_length, not NUL-terminated)
//! payload bytes   (payload_length / RECORD_SIZE records)
//! ```
//!
//! Each record is `{ kind: u64, value: u64 }`. All integers are little-endian.

use std::fmt;
use std::io::{self, Write};

/// Encoded size of a [`FlushHeader`].
pub const FLUSH_HEADER_SIZE: usize = 24;

/// Encoded size of a [`ResultRecord`].
pub const RECORD_SIZE: usize = 16;

/// Category of a recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResultKind {
    Cycles = 0,
    Hits = 1,
    CpuMigrations = 2,
    CacheMisses = 3,
    BranchMisses = 4,
    PageFaults = 5,
    Instructions = 6,
}

impl ResultKind {
    pub const ALL: [ResultKind; 7] = [
        ResultKind::Cycles,
        ResultKind::Hits,
        ResultKind::CpuMigrations,
        ResultKind::CacheMisses,
        ResultKind::BranchMisses,
        ResultKind::PageFaults,
        ResultKind::Instructions,
    ];

    pub fn as_u64(self) -> u64 {
        self as u64
    }

    pub fn from_u64(raw: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_u64() == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultKind::Cycles => "cycles",
            ResultKind::Hits => "hits",
            ResultKind::CpuMigrations => "cpu_migrations",
            ResultKind::CacheMisses => "cache_misses",
            ResultKind::BranchMisses => "branch_misses",
            ResultKind::PageFaults => "page_faults",
            ResultKind::Instructions => "instructions",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One `(kind, value)` pair. The kind stays raw so readers can carry
/// values written by newer writers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultRecord {
    pub kind: u64,
    pub value: u64,
}

impl ResultRecord {
    pub fn new(kind: ResultKind, value: u64) -> Self {
        ResultRecord {
            kind: kind.as_u64(),
            value,
        }
    }

    pub fn kind(&self) -> Option<ResultKind> {
        ResultKind::from_u64(self.kind)
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..8].copy_from_slice(&self.kind.to_le_bytes());
        out[8..].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; RECORD_SIZE]) -> Self {
        ResultRecord {
            kind: read_u64(&bytes[..8]),
            value: read_u64(&bytes[8..]),
        }
    }
}

/// Prefix of every flush block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushHeader {
    pub thread_slot: u64,
    pub name_length: u64,
    pub payload_length: u64,
}

impl FlushHeader {
    pub fn encode(&self) -> [u8; FLUSH_HEADER_SIZE] {
        let mut out = [0u8; FLUSH_HEADER_SIZE];
        out[..8].copy_from_slice(&self.thread_slot.to_le_bytes());
        out[8..16].copy_from_slice(&self.name_length.to_le_bytes());
        out[16..].copy_from_slice(&self.payload_length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; FLUSH_HEADER_SIZE]) -> Self {
        FlushHeader {
            thread_slot: read_u64(&bytes[..8]),
            name_length: read_u64(&bytes[8..16]),
            payload_length: read_u64(&bytes[16..]),
        }
    }

    /// Number of whole records the payload carries.
    pub fn record_count(&self) -> u64 {
        self.payload_length / RECORD_SIZE as u64
    }
}

/// Write one flush block whose payload is split across `chunks`, which must
/// add up to `payload_length` bytes. Returns the bytes written.
pub fn write_block_chunks<'a, W: Write>(
    writer: &mut W,
    thread_slot: u64,
    name: &[u8],
    payload_length: usize,
    chunks: impl IntoIterator<Item = &'a [u8]>,
) -> io::Result<usize> {
    let header = FlushHeader {
        thread_slot,
        name_length: name.len() as u64,
        payload_length: payload_length as u64,
    };
    writer.write_all(&header.encode())?;
    writer.write_all(name)?;
    let mut written = 0;
    for chunk in chunks {
        writer.write_all(chunk)?;
        written += chunk.len();
    }
    debug_assert_eq!(written, payload_length);
    Ok(FLUSH_HEADER_SIZE + name.len() + written)
}

/// Write one flush block: header, name, then the raw record payload.
pub fn write_block<W: Write>(
    writer: &mut W,
    thread_slot: u64,
    name: &[u8],
    payload: &[u8],
) -> io::Result<usize> {
    write_block_chunks(writer, thread_slot, name, payload.len(), [payload])
}

/// Decode every whole record in `payload`. Trailing partial bytes are ignored.
pub fn decode_records(payload: &[u8]) -> impl Iterator<Item = ResultRecord> + '_ {
    payload.chunks_exact(RECORD_SIZE).map(|chunk| {
        let mut raw = [0u8; RECORD_SIZE];
        raw.copy_from_slice(chunk);
        ResultRecord::decode(&raw)
    })
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}
