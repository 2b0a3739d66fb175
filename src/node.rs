//! The node pool: a fixed-capacity arena of region descriptors plus an
//! integer free-index stack, rendered as plain indices into a `Vec` rather
//! than an intrusive pointer-linked free list - every region this crate
//! tracks is an opaque offset range, never real memory, so there is
//! nothing to dereference.

use alloc::vec;
use alloc::vec::Vec;

use crate::NO_SPACE;

/// Node indices are 32 bits wide by default. Enable the `u16-indices`
/// feature to halve per-node metadata overhead at the cost of capping
/// `max_allocs` at 65535.
#[cfg(not(feature = "u16-indices"))]
pub type NodeIndex = u32;

/// See the 32-bit [`NodeIndex`] for details; this is the narrow variant
/// enabled by the `u16-indices` feature.
#[cfg(feature = "u16-indices")]
pub type NodeIndex = u16;

/// Sentinel meaning "no link", distinct from [`NO_SPACE`]. Always the
/// widest value representable by [`NodeIndex`].
pub(crate) const UNUSED: NodeIndex = NodeIndex::MAX;

/// A tracked region, free or used.
///
/// `bin_prev`/`bin_next` are only meaningful while `used` is `false`.
/// `neighbor_prev`/`neighbor_next` thread every live region - free or used
/// - in offset order, and are used solely to find coalescing candidates on
/// free.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub offset: u32,
    pub size: u32,
    pub used: bool,

    pub bin_prev: NodeIndex,
    pub bin_next: NodeIndex,

    pub neighbor_prev: NodeIndex,
    pub neighbor_next: NodeIndex,
}

impl Node {
    const fn unused() -> Self {
        Self {
            offset: 0,
            size: 0,
            used: false,
            bin_prev: UNUSED,
            bin_next: UNUSED,
            neighbor_prev: UNUSED,
            neighbor_next: UNUSED,
        }
    }
}

/// Fixed-capacity pool of [`Node`]s plus a free-index stack, allocating
/// and releasing descriptor slots in O(1).
///
/// The pool has `max_allocs + 1` slots: one extra is always needed to
/// represent the initial whole-range free node alongside every concurrently
/// live region.
pub(crate) struct NodePool {
    nodes: Vec<Node>,
    free_nodes: Vec<NodeIndex>,
    /// Stack pointer into `free_nodes`. Wraps to `NO_SPACE` (`u32::MAX`)
    /// when the last slot is popped - this is an intentional unsigned
    /// underflow, not a bug, and avoids a branch on every pop.
    free_offset: u32,
}

impl NodePool {
    /// An allocator with no arena yet: zero capacity, nothing poppable.
    pub const fn empty() -> Self {
        Self { nodes: Vec::new(), free_nodes: Vec::new(), free_offset: NO_SPACE }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// (Re)initializes the pool to `max_allocs + 1` slots, with the free
    /// stack pre-loaded in reverse order so that index 0 pops first. This
    /// ordering is observable through `metadata` values and is part of the
    /// reproducible-tests contract.
    pub fn new(max_allocs: u32) -> Self {
        let capacity = max_allocs as usize + 1;

        let nodes = vec![Node::unused(); capacity];
        let free_nodes = (0..=max_allocs).map(|i| (max_allocs - i) as NodeIndex).collect();

        Self { nodes, free_nodes, free_offset: max_allocs }
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_offset == NO_SPACE
    }

    /// `storage_report` treats one slot remaining as "nothing has ever
    /// been allocated" - an odd boundary, preserved deliberately rather
    /// than reinterpreted.
    pub fn is_down_to_last_slot(&self) -> bool {
        self.free_offset == 0
    }

    pub fn alloc_slot(&mut self) -> NodeIndex {
        debug_assert!(!self.is_exhausted());

        let index = self.free_nodes[self.free_offset as usize];
        self.free_offset = self.free_offset.wrapping_sub(1);
        index
    }

    pub fn release_slot(&mut self, node_index: NodeIndex) {
        self.free_offset = self.free_offset.wrapping_add(1);
        self.free_nodes[self.free_offset as usize] = node_index;
    }

    #[inline]
    pub fn get(&self, index: NodeIndex) -> &Node {
        &self.nodes[index as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index as usize]
    }

    pub fn contains(&self, index: NodeIndex) -> bool {
        (index as usize) < self.nodes.len()
    }

    pub fn set(&mut self, index: NodeIndex, node: Node) {
        self.nodes[index as usize] = node;
    }
}
