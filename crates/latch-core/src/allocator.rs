//! Method allocator facade
//!
//! One object owning every allocator the hooking machinery draws from:
//! backing regions, cave discovery, routine placement, indirect cells and
//! chain nodes. The environment wraps it in a single mutex; concurrent
//! allocation requests serialize here.

use latch_common::Result;

use crate::caves::CaveFinder;
use crate::chain::{ChainNode, HookChain, NodePool};
use crate::indirects::{IndirectAllocator, IndirectCell};
use crate::regions::RegionAllocator;
use crate::routines::{Routine, RoutineAllocator};

#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub routine_region_size: usize,
    pub node_region_size: usize,
    pub indirect_region_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            routine_region_size: 0x10000,
            node_region_size: 0x10000,
            indirect_region_size: 0x1000,
        }
    }
}

pub struct MethodAllocator {
    regions: RegionAllocator,
    caves: CaveFinder,
    routines: RoutineAllocator,
    indirects: IndirectAllocator,
    nodes: NodePool,
}

impl MethodAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            regions: RegionAllocator::new(),
            caves: CaveFinder::new(),
            routines: RoutineAllocator::new(config.routine_region_size),
            indirects: IndirectAllocator::new(config.indirect_region_size),
            nodes: NodePool::new(config.node_region_size),
        }
    }

    /// Pointer slot within rel32 reach of `near`.
    pub fn create_indirect(&mut self, near: usize) -> Result<IndirectCell> {
        self.indirects
            .create_indirect(&mut self.regions, &mut self.caves, near)
    }

    pub fn dispose_indirect(&mut self, cell: IndirectCell) {
        self.indirects.dispose(cell);
    }

    /// Zeroed routine block for in-place assembly.
    pub fn reserve_routine(&mut self, size: usize) -> Result<Routine> {
        self.routines.reserve(&mut self.regions, size)
    }

    pub fn shrink_routine(&mut self, routine: Routine, new_size: usize) -> Routine {
        self.routines.shrink(routine, new_size)
    }

    pub fn remove_routine(&mut self, routine: Routine) {
        self.routines.remove(routine)
    }

    /// Chain with its root node allocated from the node pool.
    pub fn create_chain(&mut self) -> Result<HookChain> {
        HookChain::create(&mut self.nodes, &mut self.regions)
    }

    pub fn chain_append(&mut self, chain: &mut HookChain, address: usize) -> Result<()> {
        chain.append(&mut self.nodes, &mut self.regions, address)
    }

    pub fn chain_remove(&mut self, chain: &mut HookChain, address: usize) -> bool {
        chain.remove(&mut self.nodes, address)
    }

    pub fn dispose_chain(&mut self, chain: &mut HookChain) {
        chain.dispose(&mut self.nodes);
    }

    pub fn alloc_node(&mut self, value: usize) -> Result<*mut ChainNode> {
        self.nodes.alloc_node(&mut self.regions, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_wires_suballocators() {
        let mut allocator = MethodAllocator::new(AllocatorConfig::default());

        let routine = allocator.reserve_routine(64).unwrap();
        assert_ne!(routine.address, 0);
        allocator.remove_routine(routine);

        let mut chain = allocator.create_chain().unwrap();
        allocator.chain_append(&mut chain, 0x111).unwrap();
        assert_eq!(chain.addresses(), vec![0x111]);
        allocator.dispose_chain(&mut chain);

        let near = test_facade_wires_suballocators as usize;
        let cell = allocator.create_indirect(near).unwrap();
        cell.store(near);
        assert_eq!(cell.load(), near);
        allocator.dispose_indirect(cell);
    }
}
