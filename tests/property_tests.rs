//! Property-based tests for the device memory manager and dispatch geometry.
//!
//! Key invariants:
//! - tryAllocate returns aligned data inside the heap or fails with OutOfMemory
//! - reset reproduces the first allocation
//! - relative/absolute address translation round-trips inside the region
//! - call-stack frames never overlap within one generation
//! - dispatch grids always multiply back to the global size

use accel_rt::dispatch::KernelLaunchDescriptor;
use accel_rt::{AccelError, Config, MemoryManager};
use proptest::prelude::*;

const MIB: u64 = 1 << 20;

fn manager(heap: u64, call_stack: u64) -> MemoryManager {
    MemoryManager::new(
        "prop-device",
        &Config::new().heap_size(heap).call_stack_limit(call_stack),
    )
}

proptest! {
    #[test]
    fn try_allocate_aligns_or_reports_oom(
        header in 0u64..256,
        align_log2 in 0u32..13,
        requests in prop::collection::vec(0u64..(MIB / 4), 1..12),
    ) {
        let alignment = 1u64 << align_log2;
        let mut mm = manager(MIB, 8192);

        for bytes in requests {
            let before = mm.heap_position();
            let data_start = (before + header).div_ceil(alignment) * alignment;
            let fits = data_start - header + bytes < mm.heap_limit();

            match mm.try_allocate(bytes, header, alignment) {
                Ok(h) => {
                    prop_assert!(fits);
                    prop_assert_eq!((h + header) % alignment, 0);
                    prop_assert!(h + bytes < mm.heap_limit());
                    prop_assert!(h >= before);
                    prop_assert_eq!(mm.heap_position(), h + bytes);
                }
                Err(AccelError::OutOfMemory { required, available, .. }) => {
                    prop_assert!(!fits);
                    prop_assert_eq!(required, bytes);
                    prop_assert_eq!(available, mm.heap_limit() - before);
                    prop_assert_eq!(mm.heap_position(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }
    }

    #[test]
    fn reset_reproduces_first_offset(
        header in 0u64..64,
        align_log2 in 0u32..10,
        first in 1u64..4096,
        rest in prop::collection::vec(1u64..4096, 0..8),
    ) {
        let alignment = 1u64 << align_log2;
        let mut mm = manager(MIB, 8192);
        let expected = mm.try_allocate(first, header, alignment).unwrap();
        for bytes in rest {
            mm.try_allocate(bytes, 0, 64).unwrap();
        }
        mm.create_call_stack(4).unwrap();

        mm.reset();
        prop_assert_eq!(mm.try_allocate(first, header, alignment).unwrap(), expected);
    }

    #[test]
    fn address_translation_round_trips(
        base in 0x1000u64..(1 << 47),
        offset in 0u64..MIB,
    ) {
        let mut mm = manager(MIB, 8192);
        mm.init(base).unwrap();
        let absolute = mm.to_absolute_device_address(offset).unwrap();
        prop_assert_eq!(mm.to_relative_device_address(absolute), offset);
    }

    #[test]
    fn call_stack_frames_never_overlap(
        arg_counts in prop::collection::vec(0usize..200, 1..40),
        limit in 256u64..16 * 1024,
    ) {
        let mut mm = manager(MIB, limit);
        let mut frames = Vec::new();

        for max_args in arg_counts {
            match mm.create_call_stack(max_args) {
                Ok(frame) => {
                    prop_assert_eq!(frame.offset() % 128, 0);
                    prop_assert!(frame.buffer().end() < mm.call_stack_size());
                    frames.push(frame.buffer());
                }
                Err(err) => prop_assert!(err.is_bailout()),
            }
            prop_assert!(mm.call_stack_allocated() <= mm.call_stack_size());
            prop_assert_eq!(
                mm.call_stack_remaining(),
                mm.call_stack_size() - mm.call_stack_allocated()
            );
        }

        for (i, a) in frames.iter().enumerate() {
            for b in &frames[i + 1..] {
                prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn dispatch_grid_covers_global_size_exactly(
        global in prop::array::uniform3(1u32..4096),
        suggested in prop::array::uniform3(1u32..1024),
    ) {
        let launch = KernelLaunchDescriptor::compute(global, suggested);
        for dim in 0..3 {
            prop_assert!(launch.group_size[dim] <= suggested[dim]);
            prop_assert_eq!(global[dim] % launch.group_size[dim], 0);
            prop_assert_eq!(launch.dispatch_grid[dim] * launch.group_size[dim], global[dim]);
        }
    }
}

#[test]
fn dispatch_grid_for_256_by_64() {
    let launch = KernelLaunchDescriptor::compute([256, 1, 1], [64, 1, 1]);
    assert_eq!(launch.group_size, [64, 1, 1]);
    assert_eq!(launch.dispatch_grid, [4, 1, 1]);
}
