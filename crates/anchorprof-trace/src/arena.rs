//! Region-chained bump arena backed by anonymous mappings.
//!
//! An [`Arena`] is an append-only chain of [`Region`]s. Allocation bumps a
//! cursor in the tail region. A growable arena links a new region when the
//! tail is full; a fixed arena reports "no space" instead, which is how the
//! per-slot result buffers signal that they need a flush.
//!
//! Allocations are handed out as [`Allocation`] handles (region index,
//! offset, length) rather than raw pointers, so every access is bounds
//! checked and growth can never invalidate an earlier allocation.

use crate::error::{Error, Result};
use memmap2::MmapMut;

/// One contiguous mapping with a bump cursor.
pub struct Region {
    map: MmapMut,
    cursor: usize,
}

impl Region {
    fn new(size: usize) -> Result<Self> {
        let map = MmapMut::map_anon(size).map_err(|source| Error::ArenaMap { size, source })?;
        Ok(Region { map, cursor: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    fn bump(&mut self, size: usize) -> Option<usize> {
        let end = self.cursor.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }
        let offset = self.cursor;
        self.cursor = end;
        Some(offset)
    }
}

/// Handle to bytes previously returned by [`Arena::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    region: usize,
    offset: usize,
    len: usize,
}

impl Allocation {
    pub fn region(&self) -> usize {
        self.region
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct Arena {
    regions: Vec<Region>,
    growable: bool,
}

impl Arena {
    /// Map `initial_size` bytes as the first region.
    pub fn new(initial_size: usize, growable: bool) -> Result<Self> {
        if initial_size == 0 {
            return Err(Error::InvalidConfig(
                "arena size must be greater than zero".to_string(),
            ));
        }
        Ok(Arena {
            regions: vec![Region::new(initial_size)?],
            growable,
        })
    }

    /// Fixed-capacity arena: allocation past the end returns `None`.
    pub fn fixed(capacity: usize) -> Result<Self> {
        Self::new(capacity, false)
    }

    pub fn growable(initial_size: usize) -> Result<Self> {
        Self::new(initial_size, true)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total mapped bytes across every region.
    pub fn capacity(&self) -> usize {
        self.regions.iter().map(Region::capacity).sum()
    }

    /// Total allocated bytes across every region.
    pub fn used(&self) -> usize {
        self.regions.iter().map(Region::used).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Reserve `size` bytes.
    ///
    /// Returns `None` when a fixed arena is full, or when a growable arena
    /// cannot map a new region. Zero-sized requests always succeed.
    pub fn alloc(&mut self, size: usize) -> Option<Allocation> {
        let tail = self.regions.len() - 1;
        if let Some(offset) = self.regions[tail].bump(size) {
            return Some(Allocation {
                region: tail,
                offset,
                len: size,
            });
        }
        if !self.growable {
            return None;
        }

        // Same size as the tail by default, larger if the request needs it.
        let new_size = self.regions[tail].capacity().max(size);
        let mut region = match Region::new(new_size) {
            Ok(region) => region,
            Err(e) => {
                log::warn!("arena growth failed: {e}");
                return None;
            }
        };
        let offset = region.bump(size)?;
        self.regions.push(region);
        Some(Allocation {
            region: tail + 1,
            offset,
            len: size,
        })
    }

    /// Allocate and copy `bytes` in.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Allocation> {
        let allocation = self.alloc(bytes.len())?;
        self.get_mut(allocation).copy_from_slice(bytes);
        Some(allocation)
    }

    pub fn get(&self, allocation: Allocation) -> &[u8] {
        let region = &self.regions[allocation.region];
        &region.map[allocation.offset..allocation.offset + allocation.len]
    }

    pub fn get_mut(&mut self, allocation: Allocation) -> &mut [u8] {
        let region = &mut self.regions[allocation.region];
        &mut region.map[allocation.offset..allocation.offset + allocation.len]
    }

    /// Allocated bytes of each region, in allocation order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.regions
            .iter()
            .map(|region| &region.map[..region.cursor])
            .filter(|chunk| !chunk.is_empty())
    }

    /// Rewind to empty. The first region's mapping is kept; regions added by
    /// growth are released.
    pub fn reset(&mut self) {
        self.regions.truncate(1);
        self.regions[0].cursor = 0;
    }
}
