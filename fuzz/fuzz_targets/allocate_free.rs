#![no_main]

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use offset_allocator::Allocator;

#[derive(Arbitrary, Debug)]
enum Action {
    /// Allocate the given size (masked down to stay well under the pool's
    /// total tracked range, so most requests are satisfiable).
    Allocate { size: u16 },
    /// Free the ith currently-live allocation.
    Free { index: u8 },
    /// Reset the allocator to a new tracked size, discarding all live
    /// allocations along with it.
    Reset { size: u16 },
}
use Action::*;

const POOL_SIZE: u32 = 1 << 20;
const MAX_ALLOCS: u32 = 512;

fuzz_target!(|actions: Vec<Action>| {
    let mut allocator = Allocator::with_max_allocs(MAX_ALLOCS);
    allocator.reset(POOL_SIZE);

    let mut live = Vec::new();

    for action in actions {
        match action {
            Allocate { size } => {
                if size == 0 {
                    continue;
                }

                if let Some(allocation) = allocator.allocate(size as u32) {
                    assert_eq!(allocator.allocation_size(allocation), size as u32);
                    live.push(allocation);
                }
            }
            Free { index } => {
                if index as usize >= live.len() {
                    continue;
                }

                let allocation = live.swap_remove(index as usize);
                allocator.free(allocation);
            }
            Reset { size } => {
                // `reset` is a documented no-op when `size` matches the
                // allocator's current size, leaving existing live handles
                // intact - only discard our own bookkeeping when a reset
                // actually took effect.
                let previous_size = allocator.size();
                allocator.reset(size as u32);
                if allocator.size() != previous_size {
                    live.clear();
                }
            }
        }

        let report = allocator.storage_report();
        assert!(report.largest_free_region <= report.total_free_space);
        assert!(report.total_free_space <= allocator.size());
    }

    for allocation in live {
        allocator.free(allocation);
    }

    assert_eq!(allocator.storage_report().total_free_space, allocator.size());
});
