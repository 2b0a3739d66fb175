//! The allocator facade: composes the SmallFloat codec, the two-level
//! bitmap index, the node pool, and the per-bin and neighbor linked lists
//! into `allocate`/`free`/`reset`/report operations.

use core::fmt;

use crate::bitmap::{self, LEAF_BINS_LOG2, LEAF_BIN_MASK, TOP_BINS_COUNT};
use crate::node::{NodeIndex, NodePool, UNUSED};
use crate::smallfloat;
use crate::NO_SPACE;

const BINS_COUNT: usize = 256;

/// A single outstanding allocation: an offset into the tracked range, plus
/// an opaque node index the allocator uses to free it again.
///
/// `metadata` is meaningless to callers beyond passing it back to
/// [`Allocator::free`] or [`Allocator::free_by_index`]; treat it as an
/// opaque handle, not an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub offset: u32,
    pub metadata: u32,
}

/// A coarse snapshot of free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageReport {
    pub total_free_space: u32,
    /// The representable value of the highest non-empty bin. This is an
    /// *underestimate* of the true largest free block (it only resolves
    /// to bin granularity), but always satisfies
    /// `total_free_space >= largest_free_region`.
    pub largest_free_region: u32,
}

/// One size class's occupancy, as returned by
/// [`Allocator::storage_report_full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageReportRegion {
    pub size: u32,
    pub count: u32,
}

/// A full per-bin breakdown of free regions.
#[derive(Clone, Copy)]
pub struct StorageReportFull {
    pub free_regions: [StorageReportRegion; BINS_COUNT],
}

impl fmt::Debug for StorageReportFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageReportFull")
            .field(
                "occupied_bins",
                &self.free_regions.iter().filter(|r| r.count > 0).count(),
            )
            .finish()
    }
}

/// A two-level segregated-fit offset allocator.
///
/// `Allocator` owns no memory of its own; it only tracks which offsets in
/// `[0, size)` have been handed out. It is a single-owner, non-reentrant
/// data structure - wrap it in a mutex if you need to share it across
/// threads.
pub struct Allocator {
    size: u32,
    max_allocs: u32,
    free_storage: u32,

    /// Bit `t` set means `used_bins[t]` has at least one nonzero leaf bit.
    used_bins_top: u32,
    /// `used_bins[t]`, bit `l` set means bin `(t << 3) | l` is non-empty.
    used_bins: [u8; TOP_BINS_COUNT],
    /// Head node index of each bin's free list, or `UNUSED`.
    bin_indices: [NodeIndex; BINS_COUNT],

    pool: NodePool,
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("size", &self.size)
            .field("max_allocs", &self.max_allocs)
            .field("free_storage", &self.free_storage)
            .field("used_bins_top", &format_args!("{:#034b}", self.used_bins_top))
            .finish()
    }
}

impl Default for Allocator {
    /// Equivalent to `Allocator::with_max_allocs(65535)`.
    fn default() -> Self {
        Self::with_max_allocs(65535)
    }
}

impl Allocator {
    /// Constructs an allocator with zero capacity. No offset can be
    /// allocated until [`reset`](Allocator::reset) is called with a
    /// nonzero size.
    ///
    /// # Panics
    /// Panics if the `u16-indices` feature is enabled and `max_allocs` is
    /// not strictly less than `u16::MAX` - the pool needs `max_allocs + 1`
    /// slots, and the highest slot index must stay below the `UNUSED`
    /// sentinel (`u16::MAX`) or a live node becomes indistinguishable from
    /// "no link".
    pub fn with_max_allocs(max_allocs: u32) -> Self {
        #[cfg(feature = "u16-indices")]
        assert!(
            max_allocs < u16::MAX as u32,
            "max_allocs must be strictly less than u16::MAX when `u16-indices` is enabled, \
             so the highest node index stays below the UNUSED sentinel"
        );

        Self {
            size: 0,
            max_allocs,
            free_storage: 0,
            used_bins_top: 0,
            used_bins: [0; TOP_BINS_COUNT],
            bin_indices: [UNUSED; BINS_COUNT],
            pool: NodePool::empty(),
        }
    }

    /// The size most recently passed to `reset`, or 0 if never called.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Reinitializes the allocator to track a fresh range `[0, new_size)`.
    ///
    /// A no-op if `new_size` equals the size from the last `reset` call.
    /// Otherwise every bit of metadata is rebuilt from scratch, including
    /// the free-node stack, which always determinstically yields node
    /// index 0 on the first subsequent allocation.
    pub fn reset(&mut self, new_size: u32) {
        if !self.pool.is_empty() && new_size == self.size {
            return;
        }

        self.size = new_size;
        self.free_storage = 0;
        self.used_bins_top = 0;
        self.used_bins = [0; TOP_BINS_COUNT];
        self.bin_indices = [UNUSED; BINS_COUNT];
        self.pool = NodePool::new(self.max_allocs);

        if new_size > 0 {
            self.insert_node_into_bin(new_size, 0);
        }
    }

    /// Attempts to carve `size` units out of the tracked range.
    ///
    /// Returns `None` if the request is larger than the largest free
    /// region, if no bin could fit it, or if the node pool is out of
    /// descriptor slots (at most `max_allocs` live regions at a time).
    pub fn allocate(&mut self, size: u32) -> Option<Allocation> {
        if size == 0 || self.pool.is_exhausted() {
            return None;
        }

        let min_bin_index = smallfloat::round_up(size);
        let bin_index = self.find_non_empty_bin_at_or_after(min_bin_index)?;

        let node_index = self.bin_indices[bin_index as usize];
        self.remove_from_bin(node_index);

        let node_total_size = self.pool.get(node_index).size;

        self.pool.get_mut(node_index).size = size;
        self.pool.get_mut(node_index).used = true;

        let remainder_size = node_total_size - size;
        if remainder_size > 0 {
            let node_offset = self.pool.get(node_index).offset;
            let remainder_index = self.insert_node_into_bin(remainder_size, node_offset + size);

            let next_neighbor = self.pool.get(node_index).neighbor_next;
            if next_neighbor != UNUSED {
                self.pool.get_mut(next_neighbor).neighbor_prev = remainder_index;
            }

            self.pool.get_mut(remainder_index).neighbor_prev = node_index;
            self.pool.get_mut(remainder_index).neighbor_next = next_neighbor;
            self.pool.get_mut(node_index).neighbor_next = remainder_index;
        }

        Some(Allocation { offset: self.pool.get(node_index).offset, metadata: node_index as u32 })
    }

    /// Releases a previously returned [`Allocation`]. Equivalent to
    /// `free_by_index(allocation.metadata)`.
    pub fn free(&mut self, allocation: Allocation) {
        self.free_by_index(allocation.metadata);
    }

    /// Releases the region identified by `metadata` (an
    /// [`Allocation::metadata`] value), coalescing it with any adjacent
    /// free regions.
    ///
    /// A no-op if `metadata == NO_SPACE` or the allocator has never been
    /// `reset`. Freeing a node that is not currently marked used (an
    /// invalid or double free) is a `debug_assert!` failure in debug
    /// builds and a silent no-op in release builds - it is not
    /// recoverable and not the allocator's job to detect in release.
    pub fn free_by_index(&mut self, metadata: u32) {
        if metadata == NO_SPACE || self.pool.is_empty() {
            return;
        }

        let node_index = metadata as NodeIndex;
        if !self.pool.contains(node_index) {
            return;
        }

        if !self.pool.get(node_index).used {
            debug_assert!(false, "double free or invalid free of node {node_index}");
            return;
        }

        let mut offset = self.pool.get(node_index).offset;
        let mut size = self.pool.get(node_index).size;

        let mut neighbor_prev = self.pool.get(node_index).neighbor_prev;
        let mut neighbor_next = self.pool.get(node_index).neighbor_next;

        if neighbor_prev != UNUSED && !self.pool.get(neighbor_prev).used {
            let prev_index = neighbor_prev;
            offset = self.pool.get(prev_index).offset;
            size += self.pool.get(prev_index).size;

            self.remove_from_bin(prev_index);
            debug_assert_eq!(self.pool.get(prev_index).neighbor_next, node_index);
            neighbor_prev = self.pool.get(prev_index).neighbor_prev;
            self.pool.release_slot(prev_index);
        }

        if neighbor_next != UNUSED && !self.pool.get(neighbor_next).used {
            let next_index = neighbor_next;
            size += self.pool.get(next_index).size;

            self.remove_from_bin(next_index);
            debug_assert_eq!(self.pool.get(next_index).neighbor_prev, node_index);
            neighbor_next = self.pool.get(next_index).neighbor_next;
            self.pool.release_slot(next_index);
        }

        self.pool.release_slot(node_index);

        let merged_index = self.insert_node_into_bin(size, offset);
        self.pool.get_mut(merged_index).neighbor_prev = neighbor_prev;
        self.pool.get_mut(merged_index).neighbor_next = neighbor_next;

        if neighbor_prev != UNUSED {
            self.pool.get_mut(neighbor_prev).neighbor_next = merged_index;
        }
        if neighbor_next != UNUSED {
            self.pool.get_mut(neighbor_next).neighbor_prev = merged_index;
        }
    }

    /// The size of a live allocation, or 0 if `allocation` is not a
    /// currently-live node.
    ///
    /// A stale handle whose slot has since been recycled by `free`/
    /// `allocate` into an unrelated node is indistinguishable from a
    /// truly-unused index, so both report 0 rather than the recycled
    /// node's size.
    pub fn allocation_size(&self, allocation: Allocation) -> u32 {
        if allocation.metadata == NO_SPACE {
            return 0;
        }

        let node_index = allocation.metadata as NodeIndex;
        if !self.pool.contains(node_index) {
            return 0;
        }

        let node = self.pool.get(node_index);
        if !node.used {
            return 0;
        }

        node.size
    }

    /// A coarse free-space snapshot. See [`StorageReport`].
    pub fn storage_report(&self) -> StorageReport {
        if self.pool.is_down_to_last_slot() {
            return StorageReport::default();
        }

        let largest_free_region = if self.used_bins_top == 0 {
            0
        } else {
            let top = 31 - self.used_bins_top.leading_zeros();
            let leaf_byte = self.used_bins[top as usize];
            let leaf = 7 - leaf_byte.leading_zeros();
            smallfloat::to_uint((top << LEAF_BINS_LOG2) | leaf)
        };

        StorageReport { total_free_space: self.free_storage, largest_free_region }
    }

    /// A full per-bin breakdown of free regions. See [`StorageReportFull`].
    pub fn storage_report_full(&self) -> StorageReportFull {
        let mut free_regions = [StorageReportRegion::default(); BINS_COUNT];

        for (bin, region) in free_regions.iter_mut().enumerate() {
            let mut count = 0u32;
            let mut node_index = self.bin_indices[bin];
            while node_index != UNUSED {
                count += 1;
                node_index = self.pool.get(node_index).bin_next;
            }

            *region = StorageReportRegion { size: smallfloat::to_uint(bin as u32), count };
        }

        StorageReportFull { free_regions }
    }

    /// Inserts a new free region into its bin (chosen via `round_down`,
    /// see [`smallfloat`]), maintaining the bitmap and `free_storage`.
    /// Insertion is always at the head of the bin's list.
    fn insert_node_into_bin(&mut self, size: u32, offset: u32) -> NodeIndex {
        let bin_index = smallfloat::round_down(size);
        let top = bin_index >> LEAF_BINS_LOG2;
        let leaf = bin_index & LEAF_BIN_MASK;

        if self.bin_indices[bin_index as usize] == UNUSED {
            self.used_bins[top as usize] |= 1 << leaf;
            self.used_bins_top |= 1 << top;
        }

        let head_index = self.bin_indices[bin_index as usize];
        let node_index = self.pool.alloc_slot();

        self.pool.set(
            node_index,
            crate::node::Node {
                offset,
                size,
                used: false,
                bin_prev: UNUSED,
                bin_next: head_index,
                neighbor_prev: UNUSED,
                neighbor_next: UNUSED,
            },
        );

        if head_index != UNUSED {
            self.pool.get_mut(head_index).bin_prev = node_index;
        }
        self.bin_indices[bin_index as usize] = node_index;

        self.free_storage += size;

        node_index
    }

    /// Unlinks a free node from its bin, updating the bitmap if the bin
    /// becomes empty, and decrementing `free_storage` - the inverse of
    /// [`insert_node_into_bin`](Self::insert_node_into_bin). Does not
    /// touch the node pool's free-slot stack: callers decide separately
    /// whether the node is being reused (as `allocate` does with the bin
    /// head) or discarded (as `free_by_index` does once it has read out
    /// the fields it needs).
    fn remove_from_bin(&mut self, node_index: NodeIndex) {
        let bin_prev = self.pool.get(node_index).bin_prev;
        let bin_next = self.pool.get(node_index).bin_next;
        self.free_storage -= self.pool.get(node_index).size;

        if bin_prev != UNUSED {
            // interior or tail node: unlink directly, no bitmap change.
            self.pool.get_mut(bin_prev).bin_next = bin_next;
            if bin_next != UNUSED {
                self.pool.get_mut(bin_next).bin_prev = bin_prev;
            }
            return;
        }

        // head node: recompute which bin it belongs to and repoint it.
        let bin_index = smallfloat::round_down(self.pool.get(node_index).size);
        self.bin_indices[bin_index as usize] = bin_next;

        if bin_next != UNUSED {
            self.pool.get_mut(bin_next).bin_prev = UNUSED;
            return;
        }

        // bin is now empty: clear its bitmap bit, and the top bit too if
        // that was the last leaf in its top-bin group.
        let top = bin_index >> LEAF_BINS_LOG2;
        let leaf = bin_index & LEAF_BIN_MASK;

        self.used_bins[top as usize] &= !(1 << leaf);
        if self.used_bins[top as usize] == 0 {
            self.used_bins_top &= !(1 << top);
        }
    }

    /// Finds the smallest non-empty bin `>= min_bin_index`, scanning the
    /// top-level bitmap first and falling back to the next non-empty top
    /// bin group if the exact top bin has no sufficiently-large leaf.
    fn find_non_empty_bin_at_or_after(&self, min_bin_index: u32) -> Option<u32> {
        let top = min_bin_index >> LEAF_BINS_LOG2;
        let leaf = min_bin_index & LEAF_BIN_MASK;

        if self.used_bins_top & (1 << top) != 0 {
            let leaf_bitmap = self.used_bins[top as usize] as u32;
            if let Some(found_leaf) = bitmap::find_lowest_set_bit_at_or_after(leaf_bitmap, leaf) {
                return Some((top << LEAF_BINS_LOG2) | found_leaf);
            }
        }

        // no adequate leaf in this top bin; jump to the next non-empty
        // top bin entirely - every leaf set there is by definition a
        // larger bin than anything in the current top bin's group.
        let found_top = bitmap::find_lowest_set_bit_at_or_after(self.used_bins_top, top + 1)?;
        let leaf_bitmap = self.used_bins[found_top as usize] as u32;
        let found_leaf = leaf_bitmap.trailing_zeros();

        Some((found_top << LEAF_BINS_LOG2) | found_leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_allocator_has_no_capacity_until_reset() {
        let mut allocator = Allocator::with_max_allocs(8);
        assert_eq!(allocator.allocate(1), None);

        allocator.reset(100);
        let a = allocator.allocate(1).expect("should fit after reset");
        assert_eq!(a.offset, 0);
    }

    #[test]
    fn sequential_allocations_are_contiguous_and_in_order() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(300);

        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(100).unwrap();
        let c = allocator.allocate(100).unwrap();

        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 100);
        assert_eq!(c.offset, 200);
        assert_eq!(allocator.allocate(1), None);
    }

    #[test]
    fn freeing_releases_space_back_to_the_report() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(256);

        let a = allocator.allocate(64).unwrap();
        assert_eq!(allocator.storage_report().total_free_space, 192);

        allocator.free(a);
        assert_eq!(allocator.storage_report().total_free_space, 256);
    }

    #[test]
    fn freeing_a_middle_block_coalesces_both_neighbors() {
        // A, B, C adjacent; freeing B then A then C (or any order) should
        // ultimately merge back into one region covering the whole range.
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(300);

        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(100).unwrap();
        let c = allocator.allocate(100).unwrap();

        allocator.free(b);
        allocator.free(a);
        allocator.free(c);

        let report = allocator.storage_report();
        assert_eq!(report.total_free_space, 300);
        assert_eq!(report.largest_free_region, 300);

        // the fully-coalesced range should itself be reusable as one block.
        let whole = allocator.allocate(300).expect("should merge into one region");
        assert_eq!(whole.offset, 0);
    }

    #[test]
    fn coalescing_only_merges_free_neighbors_not_used_ones() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(300);

        let a = allocator.allocate(100).unwrap();
        let _b = allocator.allocate(100).unwrap();
        let c = allocator.allocate(100).unwrap();

        allocator.free(a);
        allocator.free(c);

        // b is still live, so a and c remain two separate free regions.
        assert_eq!(allocator.storage_report().largest_free_region, 100);
    }

    #[test]
    fn exhausting_node_pool_fails_allocation_even_with_space_left() {
        // max_allocs=2 gives the pool 3 descriptor slots. Each partial
        // allocation here consumes one slot for the used block and one for
        // the leftover remainder, so the second allocate call exhausts the
        // pool even though 200 units of the range are still untracked-free.
        let mut allocator = Allocator::with_max_allocs(2);
        allocator.reset(300);

        let _a = allocator.allocate(50).unwrap();
        let _b = allocator.allocate(50).unwrap();

        assert!(allocator.storage_report().total_free_space >= 200);
        assert_eq!(allocator.allocate(50), None);
    }

    #[test]
    fn small_allocation_returns_exact_size_and_files_remainder_for_reuse() {
        // reset(1024); allocate(1) should carve exactly 1 unit at offset 0
        // and leave a 1023-unit remainder that a later allocate(1023) can
        // still claim, starting right after the first allocation.
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(1024);

        let a = allocator.allocate(1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(allocator.allocation_size(a), 1);

        let b = allocator.allocate(1023).unwrap();
        assert_eq!(b.offset, 1);
    }

    #[test]
    fn node_pool_capacity_bounds_concurrent_allocations_independent_of_space() {
        // max_allocs=3 gives the pool 4 descriptor slots. Each 1-unit
        // allocation out of a much larger range consumes one slot for the
        // used block and one for the leftover remainder, so the pool runs
        // out of descriptors well before the tracked range itself fills up.
        let mut allocator = Allocator::with_max_allocs(3);
        allocator.reset(1024);

        let mut successes = 0;
        while allocator.allocate(1).is_some() {
            successes += 1;
            assert!(successes <= 3, "node pool should bound live allocations to max_allocs");
        }

        assert_eq!(successes, 3);
    }

    #[test]
    fn zero_size_request_always_fails() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(100);
        assert_eq!(allocator.allocate(0), None);
    }

    #[test]
    fn oversized_request_fails_without_disturbing_state() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(100);

        assert_eq!(allocator.allocate(1000), None);
        assert_eq!(allocator.storage_report().total_free_space, 100);
    }

    #[test]
    fn free_by_index_with_no_space_sentinel_is_a_no_op() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(100);
        allocator.free_by_index(NO_SPACE);
        assert_eq!(allocator.storage_report().total_free_space, 100);
    }

    #[test]
    fn free_on_never_reset_allocator_is_a_no_op() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.free_by_index(0);
    }

    #[test]
    fn allocation_size_reports_requested_not_bin_size() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(1000);

        let a = allocator.allocate(100).unwrap();
        assert_eq!(allocator.allocation_size(a), 100);
    }

    #[test]
    fn allocation_size_of_freed_region_is_zero() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(1000);

        let a = allocator.allocate(100).unwrap();
        let metadata = a.metadata;
        allocator.free(a);

        assert_eq!(allocator.allocation_size(Allocation { offset: 0, metadata }), 0);
    }

    #[test]
    fn reset_to_same_size_is_a_no_op_preserving_allocations() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(100);
        let a = allocator.allocate(50).unwrap();

        allocator.reset(100);
        // still the same live allocation: a second reset to the same size
        // must not have torn down existing state.
        assert_eq!(allocator.allocation_size(a), 50);
    }

    #[test]
    fn reset_to_a_new_size_discards_previous_allocations() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(100);
        let _a = allocator.allocate(50).unwrap();

        allocator.reset(200);
        assert_eq!(allocator.storage_report().total_free_space, 200);

        let b = allocator.allocate(50).unwrap();
        assert_eq!(b.offset, 0);
    }

    #[test]
    fn storage_report_full_accounts_for_every_free_region() {
        let mut allocator = Allocator::with_max_allocs(8);
        allocator.reset(1000);

        let _a = allocator.allocate(300).unwrap();
        let full = allocator.storage_report_full();

        let total: u64 = full
            .free_regions
            .iter()
            .map(|r| r.size as u64 * r.count as u64)
            .sum();
        // every region's advertised bin size underestimates its true size,
        // so the summed report is always <= the true free total.
        assert!(total <= allocator.storage_report().total_free_space as u64);
    }

    #[test]
    fn largest_free_region_never_exceeds_total_free_space() {
        let mut allocator = Allocator::with_max_allocs(16);
        allocator.reset(10_000);

        let mut live = vec![];
        for size in [100, 2000, 50, 777, 4096] {
            if let Some(a) = allocator.allocate(size) {
                live.push(a);
            }
        }

        let report = allocator.storage_report();
        assert!(report.largest_free_region <= report.total_free_space);
    }

    #[test]
    fn fuzz_like_allocate_free_stress_maintains_invariants() {
        let mut allocator = Allocator::with_max_allocs(256);
        let size = 1 << 20;
        allocator.reset(size);

        let mut live: Vec<Allocation> = Vec::new();
        let mut total_live_size: u64 = 0;
        let rng = fastrand::Rng::with_seed(0xA11_0CA7_0);

        for _ in 0..20_000 {
            if !live.is_empty() && (rng.bool() || live.len() >= 200) {
                let index = rng.usize(..live.len());
                let a = live.swap_remove(index);
                total_live_size -= allocator.allocation_size(a) as u64;
                allocator.free(a);
            } else {
                let request_size = 1 + rng.u32(..4096);
                if let Some(a) = allocator.allocate(request_size) {
                    total_live_size += allocator.allocation_size(a) as u64;
                    live.push(a);
                }
            }

            let report = allocator.storage_report();
            assert!(report.total_free_space as u64 + total_live_size <= size as u64);
            assert!(report.largest_free_region <= report.total_free_space);
        }

        for a in live {
            total_live_size -= allocator.allocation_size(a) as u64;
            allocator.free(a);
        }
        assert_eq!(total_live_size, 0);
        assert_eq!(allocator.storage_report().total_free_space, size);
    }
}
