//! Code cave discovery
//!
//! When no fresh pages can be reserved within rel32 reach of a target, the
//! engine borrows the zero-padded tail of an executable image region that is
//! already mapped nearby. Found caves are memoized by their image region base
//! so the same tail is never offered twice, and an exhausted cave is skipped
//! until capacity is returned to it.

use std::sync::Arc;

use latch_common::{MemoryKind, RegionInfo, Result};
use tracing::debug;

use crate::regions::{self, MemoryRegion};
use crate::vm;

/// Bytes at the cave's front kept untouched so a trailing instruction of the
/// preceding code is never overwritten.
const CAVE_MARGIN: usize = 8;

/// The scan never walks below the first 64 KiB of address space.
const LOW_ADDRESS_LIMIT: usize = 0x10000;

#[derive(Default)]
pub struct CaveFinder {
    caves: Vec<Arc<MemoryRegion>>,
}

impl CaveFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cave within rel32 reach of `address` with at least
    /// `min_capacity` usable bytes, discovering a new one if every known
    /// cave is out of reach or exhausted.
    pub fn free_cave_near(
        &mut self,
        address: usize,
        min_capacity: usize,
    ) -> Result<Arc<MemoryRegion>> {
        for cave in &self.caves {
            if cave.is_within_reach(address) && !cave.is_exhausted() && cave.size() >= min_capacity
            {
                return Ok(Arc::clone(cave));
            }
        }
        self.discover(address, min_capacity)
    }

    fn discover(&mut self, address: usize, min_capacity: usize) -> Result<Arc<MemoryRegion>> {
        loop {
            let cave = self
                .scan_up(address)
                .or_else(|| self.scan_down(address))
                .ok_or_else(|| regions::exhausted(address))?;
            self.caves.push(Arc::clone(&cave));

            if !cave.is_exhausted() && cave.size() >= min_capacity {
                return Ok(cave);
            }
            // Too small; it stays memoized so the scan moves past it.
        }
    }

    fn scan_up(&self, address: usize) -> Option<Arc<MemoryRegion>> {
        let mut info = vm::query(address).ok()?;
        loop {
            if self.suits(&info, address) {
                return Some(self.build_cave(&info));
            }
            info = vm::query_above(&info)?;
            if !vm::within_reach(info.base, info.size, address) {
                return None;
            }
        }
    }

    fn scan_down(&self, address: usize) -> Option<Arc<MemoryRegion>> {
        let mut info = vm::query(address).ok()?;
        loop {
            info = vm::query_below(&info)?;
            if info.base < LOW_ADDRESS_LIMIT
                || !vm::within_reach(info.base, info.size, address)
            {
                return None;
            }
            if self.suits(&info, address) {
                return Some(self.build_cave(&info));
            }
        }
    }

    fn suits(&self, info: &RegionInfo, _address: usize) -> bool {
        info.kind == MemoryKind::Image
            && info.protection.execute
            && !self.caves.iter().any(|c| {
                matches!(c.backing(), regions::Backing::Cave { image_base } if image_base == info.base)
            })
    }

    fn build_cave(&self, info: &RegionInfo) -> Arc<MemoryRegion> {
        let zeros = count_trailing_zeros(info);
        let mut capacity = zeros.saturating_sub(CAVE_MARGIN);
        let mut start = info.end() - capacity;
        // Pointer slots are carved straight out of the cave; keep its base
        // pointer-aligned.
        let aligned = (start + 7) & !7;
        capacity = capacity.saturating_sub(aligned - start);
        start = aligned;

        if capacity > 0 {
            // The tail must be patchable in place.
            let _ = vm::protect(start, capacity, latch_common::Protection::rwx());
        }

        debug!(
            target: "latch_core::caves",
            image = format_args!("{:#x}", info.base),
            start = format_args!("{:#x}", start),
            capacity,
            "found code cave"
        );
        Arc::new(MemoryRegion::cave(info.base, start, capacity))
    }
}

fn count_trailing_zeros(info: &RegionInfo) -> usize {
    let bytes = vm::read_bytes(info.base, info.size);
    bytes.iter().rev().take_while(|&&b| b == 0).count()
}
