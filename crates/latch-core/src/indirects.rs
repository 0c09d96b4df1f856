//! Indirect cell allocation
//!
//! An indirect cell is one pointer-sized slot the patched method entry jumps
//! through. Redirection is toggled by storing either the stub entry or the
//! call-original block into the cell; the patched code itself never changes
//! again. Cells are grouped into regions placed within rel32 reach of the
//! method entry, with a bitmap tracking slot occupancy per region.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use latch_common::{Error, Result};
use tracing::debug;

use crate::caves::CaveFinder;
use crate::regions::{MemoryRegion, RegionAllocator};

const SLOT_SIZE: usize = std::mem::size_of::<usize>();

/// Per-region slot occupancy, one bit per pointer slot.
pub struct SlotBitmap {
    words: Vec<u64>,
    slots: usize,
}

impl SlotBitmap {
    pub fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
            slots,
        }
    }

    pub fn is_reserved(&self, index: usize) -> bool {
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn reserve(&mut self, index: usize) {
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    pub fn release(&mut self, index: usize) {
        self.words[index / 64] &= !(1u64 << (index % 64));
    }

    /// First free slot index, skipping fully reserved words.
    pub fn first_free(&self) -> Option<usize> {
        for (wi, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            let index = wi * 64 + word.trailing_ones() as usize;
            if index < self.slots {
                return Some(index);
            }
        }
        None
    }

    pub fn has_free(&self) -> bool {
        self.first_free().is_some()
    }
}

/// One allocated pointer slot.
#[derive(Debug)]
pub struct IndirectCell {
    address: usize,
    region_base: usize,
    index: usize,
}

impl IndirectCell {
    pub fn address(&self) -> usize {
        self.address
    }

    fn cell(&self) -> &AtomicUsize {
        // The slot lives in an always-mapped region the allocator owns and
        // is pointer aligned by construction.
        unsafe { &*(self.address as *const AtomicUsize) }
    }

    /// Atomically repoints the cell; this is the enable/disable primitive.
    pub fn store(&self, target: usize) {
        self.cell().store(target, Ordering::SeqCst);
    }

    pub fn load(&self) -> usize {
        self.cell().load(Ordering::SeqCst)
    }
}

struct IndirectRegion {
    memory: Arc<MemoryRegion>,
    bitmap: SlotBitmap,
}

impl IndirectRegion {
    fn new(memory: Arc<MemoryRegion>) -> Self {
        let slots = memory.size() / SLOT_SIZE;
        Self {
            memory,
            bitmap: SlotBitmap::new(slots),
        }
    }

    fn take_slot(&mut self) -> Option<IndirectCell> {
        let index = self.bitmap.first_free()?;
        self.bitmap.reserve(index);
        self.memory.set_exhausted(!self.bitmap.has_free());
        Some(IndirectCell {
            address: self.memory.base() + index * SLOT_SIZE,
            region_base: self.memory.base(),
            index,
        })
    }
}

pub struct IndirectAllocator {
    regions: Vec<IndirectRegion>,
    region_size: usize,
}

impl IndirectAllocator {
    pub fn new(region_size: usize) -> Self {
        Self {
            regions: Vec::new(),
            region_size,
        }
    }

    /// Allocates a pointer slot within rel32 reach of `near`: an existing
    /// region with a free slot, else a fresh near allocation, else a cave.
    pub fn create_indirect(
        &mut self,
        region_alloc: &mut RegionAllocator,
        cave_finder: &mut CaveFinder,
        near: usize,
    ) -> Result<IndirectCell> {
        for region in &mut self.regions {
            if region.memory.is_within_reach(near) && region.bitmap.has_free() {
                return region
                    .take_slot()
                    .ok_or_else(|| Error::Internal("free bitmap slot vanished".into()));
            }
        }

        let memory = match region_alloc.allocate_near(near, self.region_size) {
            Some(memory) => memory,
            None => cave_finder.free_cave_near(near, SLOT_SIZE)?,
        };
        debug!(
            target: "latch_core::indirects",
            base = format_args!("{:#x}", memory.base()),
            size = memory.size(),
            backing = ?memory.backing(),
            "new indirects region"
        );

        self.regions.push(IndirectRegion::new(memory));
        let region = self.regions.last_mut().unwrap();
        region
            .take_slot()
            .ok_or_else(|| crate::regions::exhausted(near))
    }

    /// Zeroes the cell and returns its slot to the owning region.
    pub fn dispose(&mut self, cell: IndirectCell) {
        cell.store(0);
        if let Some(region) = self
            .regions
            .iter_mut()
            .find(|r| r.memory.base() == cell.region_base)
        {
            region.bitmap.release(cell.index);
            region.memory.set_exhausted(false);
        }
    }
}
