//! Hook chains
//!
//! The dispatch loop inside a generated stub walks a singly linked list of
//! `{hook address, next}` nodes in plain data memory. Nodes come from a
//! dedicated pool of non-relocating regions, so node addresses embedded in
//! generated code stay valid across chain mutation. A chain always owns a
//! root node once created (empty chain, not null chain) plus a stable root
//! slot cell the stub reads the current root from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use latch_common::Result;

use crate::regions::{MemoryRegion, RegionAllocator};
use crate::vm;

/// Root node value while the chain holds no hooks. Marks the node occupied
/// so the pool's vacancy scan never hands it out again; the stub generator
/// emits no dispatch loop for an empty chain, so it is never called.
const EMPTY_SENTINEL: usize = 1;

/// Node layout the generated code walks: value at +0, next at +8.
#[repr(C)]
pub struct ChainNode {
    pub value: usize,
    pub next: *mut ChainNode,
}

impl ChainNode {
    fn is_vacant(&self) -> bool {
        self.value == 0 && self.next.is_null()
    }
}

/// Pool of chain nodes carved from owned regions. Nodes never move.
pub struct NodePool {
    regions: Vec<Arc<MemoryRegion>>,
    region_size: usize,
}

impl NodePool {
    pub fn new(region_size: usize) -> Self {
        Self {
            regions: Vec::new(),
            region_size,
        }
    }

    pub fn alloc_node(
        &mut self,
        region_alloc: &mut RegionAllocator,
        value: usize,
    ) -> Result<*mut ChainNode> {
        if let Some(node) = self.find_vacant() {
            unsafe {
                (*node).value = value;
                (*node).next = std::ptr::null_mut();
            }
            return Ok(node);
        }

        let memory = region_alloc.allocate(self.region_size)?;
        vm::zero(memory.base(), memory.size());
        self.regions.push(memory);
        let node = self.find_vacant().expect("fresh node region is empty");
        unsafe {
            (*node).value = value;
            (*node).next = std::ptr::null_mut();
        }
        Ok(node)
    }

    pub fn free_node(&mut self, node: *mut ChainNode) {
        unsafe {
            (*node).value = 0;
            (*node).next = std::ptr::null_mut();
        }
    }

    fn find_vacant(&self) -> Option<*mut ChainNode> {
        let node_size = std::mem::size_of::<ChainNode>();
        for region in &self.regions {
            let count = region.size() / node_size;
            for i in 0..count {
                let node = (region.base() + i * node_size) as *mut ChainNode;
                if unsafe { (*node).is_vacant() } {
                    return Some(node);
                }
            }
        }
        None
    }
}

/// Ordered hook chain for one registration.
pub struct HookChain {
    root: *mut ChainNode,
    /// Stable cell holding the current root pointer; generated code loads
    /// the root through this address, so the cell must outlive every stub
    /// built against it. Boxed to pin its location.
    root_slot: Box<AtomicUsize>,
    len: usize,
}

// Nodes live in pool regions and all mutation goes through the registration
// lock; the raw pointers are plain addresses to the stub.
unsafe impl Send for HookChain {}

impl HookChain {
    pub fn create(pool: &mut NodePool, region_alloc: &mut RegionAllocator) -> Result<Self> {
        let root = pool.alloc_node(region_alloc, EMPTY_SENTINEL)?;
        let root_slot = Box::new(AtomicUsize::new(root as usize));
        Ok(Self {
            root,
            root_slot,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the cell the stub reads the root node pointer from.
    pub fn root_slot_address(&self) -> usize {
        self.root_slot.as_ref() as *const AtomicUsize as usize
    }

    /// Appends a hook at the tail. The first hook takes over the root
    /// node's sentinel value rather than allocating.
    pub fn append(
        &mut self,
        pool: &mut NodePool,
        region_alloc: &mut RegionAllocator,
        address: usize,
    ) -> Result<()> {
        if self.len == 0 {
            unsafe {
                (*self.root).value = address;
            }
            self.len = 1;
            return Ok(());
        }

        let node = pool.alloc_node(region_alloc, address)?;
        unsafe {
            let mut last = self.root;
            while !(*last).next.is_null() {
                last = (*last).next;
            }
            (*last).next = node;
        }
        self.len += 1;
        Ok(())
    }

    /// Unlinks the first node holding `address`. Returns false when the
    /// chain does not contain it.
    pub fn remove(&mut self, pool: &mut NodePool, address: usize) -> bool {
        if self.len == 0 {
            return false;
        }

        unsafe {
            if (*self.root).value == address {
                if (*self.root).next.is_null() {
                    (*self.root).value = EMPTY_SENTINEL;
                } else {
                    let old_root = self.root;
                    self.root = (*old_root).next;
                    self.root_slot.store(self.root as usize, Ordering::SeqCst);
                    pool.free_node(old_root);
                }
                self.len -= 1;
                return true;
            }

            let mut prev = self.root;
            let mut node = (*prev).next;
            while !node.is_null() {
                if (*node).value == address {
                    (*prev).next = (*node).next;
                    pool.free_node(node);
                    self.len -= 1;
                    return true;
                }
                prev = node;
                node = (*node).next;
            }
        }
        false
    }

    /// Hook addresses in call order.
    pub fn addresses(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }
        unsafe {
            let mut node = self.root;
            while !node.is_null() {
                out.push((*node).value);
                node = (*node).next;
            }
        }
        out
    }

    /// Returns every node to the pool. Called when the registration goes
    /// away; the chain must not be walked by any stub afterwards.
    pub fn dispose(&mut self, pool: &mut NodePool) {
        unsafe {
            let mut node = self.root;
            while !node.is_null() {
                let next = (*node).next;
                pool.free_node(node);
                node = next;
            }
        }
        self.len = 0;
        self.root = std::ptr::null_mut();
        self.root_slot.store(0, Ordering::SeqCst);
    }
}
