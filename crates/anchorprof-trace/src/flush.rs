//! Serialization of buffered results into the shared log.
//!
//! Every flush writes one block (header, anchor name, raw records) while
//! holding the single file-write mutex, so blocks from different slots may
//! interleave with each other but never inside one block.

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::format::write_block_chunks;
use crate::registry::lock;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Append-only destination for flush blocks.
pub struct LogSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    blocks: AtomicU64,
    bytes: AtomicU64,
}

impl LogSink {
    /// Open `path` for append, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::debug!("writing measurements to {}", path.display());
        Ok(LogSink {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(BufWriter::new(file))),
            blocks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks written since open.
    pub fn blocks_written(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Bytes written since open, headers and names included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn write_block(&self, thread_slot: u64, name: &[u8], arena: &Arena) -> Result<()> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(Error::NotStarted)?;

        match write_block_chunks(writer, thread_slot, name, arena.used(), arena.chunks()) {
            Ok(written) => {
                self.blocks.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(written as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.abandon(&mut guard, &err);
                Err(err.into())
            }
        }
    }

    /// Push buffered blocks to the file.
    pub fn sync(&self) -> Result<()> {
        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        if let Err(err) = writer.flush() {
            self.abandon(&mut guard, &err);
            return Err(err.into());
        }
        Ok(())
    }

    /// Flush and close the file. Later writes fail with `NotStarted`.
    pub fn close(&self) -> Result<()> {
        let Some(writer) = lock(&self.writer).take() else {
            return Ok(());
        };
        let file = match writer.into_inner() {
            Ok(file) => file,
            Err(err) => {
                let (source, writer) = err.into_parts();
                // Drop the unwritten tail without another flush attempt.
                let _ = writer.into_parts();
                log::error!("{}: final write failed: {source}", self.path.display());
                return Err(source.into());
            }
        };
        file.sync_all()?;
        log::debug!(
            "closed {} ({} blocks, {} bytes)",
            self.path.display(),
            self.blocks_written(),
            self.bytes_written()
        );
        Ok(())
    }

    /// Close the sink after a failed write. Buffered bytes of the unfinished
    /// block are discarded, so the file ends at a block boundary or in one
    /// truncated block and never has a later block spliced into a broken one.
    fn abandon(&self, writer: &mut Option<BufWriter<File>>, err: &io::Error) {
        if let Some(writer) = writer.take() {
            let (_file, _unwritten) = writer.into_parts();
        }
        log::error!(
            "{}: write failed, no further blocks will be written: {err}",
            self.path.display()
        );
    }
}

/// Write `arena`'s buffered records as one block and rewind it.
///
/// Taking the arena by `&mut` means the caller holds the slot mutex that owns
/// it. An empty arena writes nothing and is left untouched. Returns the
/// payload bytes written.
pub fn flush_arena(
    name: &str,
    thread_slot: usize,
    arena: &mut Arena,
    sink: &LogSink,
) -> Result<usize> {
    let amount = arena.used();
    if amount == 0 {
        return Ok(0);
    }
    sink.write_block(thread_slot as u64, name.as_bytes(), arena)?;
    arena.reset();
    log::trace!("flushed {amount} bytes of '{name}' from slot {thread_slot}");
    Ok(amount)
}
