//! Fixed-size table of named measurement sites.
//!
//! Every [`Anchor`] owns one result buffer and one mutex per thread slot. A
//! thread's slot is `thread_hash(pthread_self()) % thread_slots`; distinct
//! threads may land on the same slot and then share its buffer and lock.
//! That trades some contention for a table that never grows.

use crate::arena::Arena;
use crate::config::{ProfilerConfig, ThreadHash};
use crate::error::{Error, Result};
use crate::flush::{LogSink, flush_arena};
use crate::format::{RECORD_SIZE, ResultRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

/// Name written for data buffered under an anchor that was never named.
pub const UNNAMED_ANCHOR: &str = "<unnamed>";

/// Default thread hash: the splitmix64 finalizer (multiply / xor-shift).
pub fn avalanche(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Raw identity of the calling thread.
pub fn thread_identity() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

/// Add `delta` to a running total. A sum that would wrap resets the total
/// to zero and drops `delta`.
pub fn accumulate(total: u64, delta: u64) -> u64 {
    total.checked_add(delta).unwrap_or(0)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Result buffer of one anchor for one thread slot.
#[derive(Default)]
pub struct SlotBuffer {
    /// Mapped on first append.
    arena: Option<Arena>,
    /// Set by the shutdown flush; later appends are dropped.
    retired: bool,
}

impl SlotBuffer {
    pub fn buffered_bytes(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::used)
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

#[derive(Default)]
pub struct Slot {
    buffer: Mutex<SlotBuffer>,
    hits: AtomicU64,
    cycles: AtomicU64,
}

impl Slot {
    pub fn lock(&self) -> MutexGuard<'_, SlotBuffer> {
        lock(&self.buffer)
    }

    fn record_hit(&self, cycles: Option<u64>) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(delta) = cycles {
            let _ = self
                .cycles
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                    Some(accumulate(total, delta))
                });
        }
    }
}

pub struct Anchor {
    name: RwLock<Option<&'static str>>,
    slots: Box<[Slot]>,
}

impl Anchor {
    fn new(thread_slots: usize) -> Self {
        Anchor {
            name: RwLock::new(None),
            slots: (0..thread_slots).map(|_| Slot::default()).collect(),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        *self.name.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the display name. The last distinct writer wins.
    pub fn set_name(&self, name: &'static str) {
        if self.name() == Some(name) {
            return;
        }
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = Some(name);
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Measurements finalized so far, across every slot.
    pub fn hits(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.hits.load(Ordering::Relaxed))
            .sum()
    }

    /// Cycles accumulated so far, across every slot.
    pub fn cycles(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.cycles.load(Ordering::Relaxed))
            .fold(0, accumulate)
    }

    fn flush_name(&self) -> &'static str {
        self.name().unwrap_or(UNNAMED_ANCHOR)
    }
}

/// Live totals for one named anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSummary {
    pub index: usize,
    pub name: &'static str,
    pub hits: u64,
    pub cycles: u64,
}

pub struct Registry {
    anchors: Box<[Anchor]>,
    slot_capacity: usize,
    thread_hash: ThreadHash,
}

impl Registry {
    pub fn new(config: &ProfilerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Registry {
            anchors: (0..config.max_anchors)
                .map(|_| Anchor::new(config.thread_slots))
                .collect(),
            slot_capacity: config.slot_capacity,
            thread_hash: config.thread_hash,
        })
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn thread_slots(&self) -> usize {
        self.anchors.first().map_or(0, |anchor| anchor.slots.len())
    }

    pub fn anchor(&self, index: usize) -> Result<&Anchor> {
        self.anchors.get(index).ok_or(Error::AnchorOutOfRange {
            index,
            capacity: self.anchors.len(),
        })
    }

    /// Slot for a raw thread identity.
    pub fn slot_for(&self, identity: u64) -> usize {
        ((self.thread_hash)(identity) % self.thread_slots() as u64) as usize
    }

    pub fn current_slot(&self) -> usize {
        self.slot_for(thread_identity())
    }

    /// Append one finalized measurement's records to `anchor`'s buffer for
    /// `slot`, flushing to `sink` when the buffer is full.
    pub(crate) fn append(
        &self,
        anchor: &Anchor,
        slot: usize,
        records: &[ResultRecord],
        cycles: Option<u64>,
        sink: &LogSink,
    ) -> Result<()> {
        let slot_ref = &anchor.slots[slot];
        let mut buffer = slot_ref.lock();
        if buffer.retired {
            log::trace!("dropping records for retired slot {slot}");
            return Ok(());
        }

        let arena = match buffer.arena.take() {
            Some(arena) => arena,
            None => Arena::fixed(self.slot_capacity)?,
        };
        let arena = buffer.arena.insert(arena);

        for record in records {
            let bytes = record.encode();
            if arena.push(&bytes).is_some() {
                continue;
            }
            flush_arena(anchor.flush_name(), slot, arena, sink)?;
            if arena.push(&bytes).is_none() {
                return Err(Error::ArenaExhausted {
                    capacity: arena.capacity(),
                    requested: RECORD_SIZE,
                });
            }
        }
        slot_ref.record_hit(cycles);
        Ok(())
    }

    /// Flush every buffer holding data. Returns the payload bytes written.
    pub(crate) fn flush_all(&self, sink: &LogSink) -> Result<usize> {
        let mut flushed = 0;
        for anchor in self.anchors.iter() {
            for (slot_id, slot) in anchor.slots.iter().enumerate() {
                let mut buffer = slot.lock();
                if let Some(arena) = buffer.arena.as_mut() {
                    flushed += flush_arena(anchor.flush_name(), slot_id, arena, sink)?;
                }
            }
        }
        Ok(flushed)
    }

    /// Final flush: write out and release every buffer, then refuse further
    /// appends.
    ///
    /// Every slot is retired even after a write fails. Buffers that could not
    /// be written are dropped and the first error is returned once the whole
    /// table has been visited.
    pub(crate) fn retire_all(&self, sink: &LogSink) -> Result<usize> {
        let mut flushed = 0;
        let mut lost = 0usize;
        let mut first_error = None;
        for anchor in self.anchors.iter() {
            for (slot_id, slot) in anchor.slots.iter().enumerate() {
                let mut buffer = slot.lock();
                buffer.retired = true;
                let Some(mut arena) = buffer.arena.take() else {
                    continue;
                };
                match flush_arena(anchor.flush_name(), slot_id, &mut arena, sink) {
                    Ok(bytes) => flushed += bytes,
                    Err(err) => {
                        lost += arena.used();
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => {
                log::error!("final flush failed, {lost} buffered bytes lost: {err}");
                Err(err)
            }
            None => Ok(flushed),
        }
    }

    /// Live totals of every named anchor.
    pub fn summaries(&self) -> Vec<AnchorSummary> {
        self.anchors
            .iter()
            .enumerate()
            .filter_map(|(index, anchor)| {
                anchor.name().map(|name| AnchorSummary {
                    index,
                    name,
                    hits: anchor.hits(),
                    cycles: anchor.cycles(),
                })
            })
            .collect()
    }
}
