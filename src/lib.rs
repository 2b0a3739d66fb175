//! A fast two-level segregated-fit offset allocator.
//!
//! This crate tracks offsets into an externally-owned range - a GPU heap, a
//! ring buffer, a file's byte range, anything addressable by a `u32` offset
//! and length - without ever touching the underlying memory itself. It is
//! the bookkeeping half of a suballocator: callers own the real resource and
//! use [`Allocator`] purely to decide which offsets are free.
//!
//! Offsets are handed out via [`Allocator::allocate`] and returned via
//! [`Allocator::free`]. Freed regions are coalesced with their immediate
//! neighbors in offset order, so fragmentation only grows with the number
//! of concurrently live allocations, not with allocator lifetime.
//!
//! Size classes are tracked with a [`smallfloat`] quantization scheme (256
//! bins covering the full `u32` range at ~12.5% worst-case overhead) and a
//! two-level [`bitmap`] index, so both `allocate` and `free` run in
//! bounded, allocation-free time - no scanning a free list, no per-call
//! heap traffic beyond the fixed-capacity node pool itself.
//!
//! Enable the `u16-indices` feature to halve per-node metadata overhead
//! when `max_allocs` is known to fit in 16 bits. Disable the default `std`
//! feature to build against `alloc` alone.
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod allocator;
mod bitmap;
mod node;
mod smallfloat;

pub use allocator::{
    Allocation, Allocator, StorageReport, StorageReportFull, StorageReportRegion,
};

/// Sentinel value meaning "no region" / "allocation failed", matching the
/// representation used throughout this family of allocators. Callers
/// should generally prefer matching on the `Option<Allocation>` that
/// [`Allocator::allocate`] returns over comparing against this constant
/// directly.
pub const NO_SPACE: u32 = 0xFFFF_FFFF;

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn reexports_are_reachable() {
        let mut allocator = Allocator::with_max_allocs(16);
        allocator.reset(1024);

        let a = allocator.allocate(128).expect("should fit");
        assert_eq!(a.offset, 0);
        assert_eq!(allocator.allocation_size(a), 128);

        let report: StorageReport = allocator.storage_report();
        assert_eq!(report.total_free_space, 1024 - 128);

        let full: StorageReportFull = allocator.storage_report_full();
        assert!(full.free_regions.iter().any(|r| r.count > 0));

        allocator.free(a);
        assert_eq!(allocator.storage_report().total_free_space, 1024);
    }

    #[test]
    fn no_space_constant_matches_u32_max() {
        assert_eq!(NO_SPACE, u32::MAX);
    }
}
