//! Backing memory regions
//!
//! Every byte the engine hands out for stub code, pointer cells or chain
//! nodes comes from a [`MemoryRegion`]: either pages we reserved ourselves or
//! a cave borrowed from a loaded image. Owned regions are freed exactly once
//! when the region is dropped; caves are never freed because the pages belong
//! to the module that was mapped there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use latch_common::{Error, Result};
use tracing::warn;

use crate::vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Pages reserved and committed by us
    Owned,
    /// Zero-padding tail inside a foreign image region
    Cave { image_base: usize },
}

#[derive(Debug)]
pub struct MemoryRegion {
    base: usize,
    size: usize,
    backing: Backing,
    /// A region with no free capacity left; cleared again when something is
    /// returned to it.
    exhausted: AtomicBool,
}

impl MemoryRegion {
    pub fn owned(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            backing: Backing::Owned,
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn cave(image_base: usize, base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            backing: Backing::Cave { image_base },
            exhausted: AtomicBool::new(size == 0),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn is_within_reach(&self, address: usize) -> bool {
        vm::within_reach(self.base, self.size, address)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn set_exhausted(&self, value: bool) {
        // A zero-capacity cave stays exhausted forever.
        if self.size == 0 {
            return;
        }
        self.exhausted.store(value, Ordering::Release);
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.backing == Backing::Owned {
            if let Err(e) = vm::free(self.base, self.size) {
                warn!(target: "latch_core::regions", base = format_args!("{:#x}", self.base), "failed to release region: {e}");
            }
        }
    }
}

/// Owner of every region reserved from the OS.
#[derive(Default)]
pub struct RegionAllocator {
    regions: Vec<Arc<MemoryRegion>>,
}

impl RegionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, size: usize) -> Result<Arc<MemoryRegion>> {
        let base = vm::alloc(size)?;
        let region = Arc::new(MemoryRegion::owned(base, size));
        self.regions.push(Arc::clone(&region));
        Ok(region)
    }

    /// Reserves pages within rel32 reach of `address`, or reports `None`
    /// when no free range exists there (the caller falls back to a cave).
    pub fn allocate_near(&mut self, address: usize, size: usize) -> Option<Arc<MemoryRegion>> {
        let base = vm::alloc_near(address, size, vm::REL32_REACH)?;
        let region = Arc::new(MemoryRegion::owned(base, size));
        self.regions.push(Arc::clone(&region));
        Some(region)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

/// Keeps an error shape for allocation failure consistent across callers.
pub fn exhausted(address: usize) -> Error {
    Error::ResourceExhausted(format!(
        "no allocatable region or cave within rel32 reach of {address:#x}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_region_reach() {
        let region = MemoryRegion::owned(0x10000, 0x1000);
        assert!(region.is_within_reach(0x20000));
        assert!(!region.is_within_reach(0x10000 + vm::REL32_REACH + 0x1000));
    }

    #[test]
    fn test_zero_capacity_cave_stays_exhausted() {
        let cave = MemoryRegion::cave(0x40000, 0x41000, 0);
        assert!(cave.is_exhausted());
        cave.set_exhausted(false);
        assert!(cave.is_exhausted());
    }

    #[test]
    fn test_cave_exhaustion_toggle() {
        let cave = MemoryRegion::cave(0x40000, 0x41000, 0x100);
        assert!(!cave.is_exhausted());
        cave.set_exhausted(true);
        assert!(cave.is_exhausted());
        cave.set_exhausted(false);
        assert!(!cave.is_exhausted());
    }

    #[test]
    fn test_allocator_tracks_regions() {
        let mut allocator = RegionAllocator::new();
        let region = allocator.allocate(vm::page_size()).unwrap();
        assert_eq!(allocator.region_count(), 1);
        assert_ne!(region.base(), 0);
        assert_eq!(region.backing(), Backing::Owned);
    }
}
