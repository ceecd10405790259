use voxel_lod_streaming::engine_state::buffer_state::free_list::{AllocationHandle, FreeListAllocator};
use voxel_lod_streaming::error::AllocatorError;

/// Blocks of live allocations never overlap and stay inside the capacity.
fn assert_disjoint(allocator: &FreeListAllocator<u32>, live: &[(AllocationHandle, u32)]) {
    let mut ranges: Vec<(u32, u32)> = live
        .iter()
        .map(|(handle, tag)| {
            let allocation = allocator.get(*handle).unwrap();
            assert_eq!(allocation.user_data, *tag);
            (allocation.offset, allocation.offset + allocation.size)
        })
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    if let Some(last) = ranges.last() {
        assert!(last.1 <= allocator.capacity());
    }
}

#[test]
fn random_allocate_free_keeps_invariants() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut allocator = FreeListAllocator::<u32>::new(4096, 4);
    let mut live: Vec<(AllocationHandle, u32)> = Vec::new();

    for step in 0..5000u32 {
        if live.is_empty() || rng.u8(..) < 150 {
            let size = rng.u32(1..=200);
            match allocator.allocate(size, step) {
                Ok(handle) => live.push((handle, step)),
                Err(AllocatorError::OutOfCapacity { requested, largest_free }) => {
                    assert!(requested > largest_free);
                    if rng.bool() {
                        allocator.grow(allocator.capacity() + 1024).unwrap();
                    }
                }
                Err(err) => panic!("unexpected error {err}"),
            }
        } else {
            let (handle, _) = live.swap_remove(rng.usize(..live.len()));
            allocator.free(handle).unwrap();
            assert!(allocator.get(handle).is_none());
        }

        allocator.validate().unwrap();
        assert_eq!(allocator.allocation_count(), live.len());
        if step % 97 == 0 {
            assert_disjoint(&allocator, &live);
        }
    }

    for (handle, _) in live.drain(..) {
        allocator.free(handle).unwrap();
    }
    allocator.validate().unwrap();
    assert_eq!(allocator.used(), 0);
    assert_eq!(allocator.blocks().len(), 1);
    assert_eq!(allocator.largest_free_block(), allocator.capacity());
}

#[test]
fn double_free_is_rejected() {
    let mut allocator = FreeListAllocator::<u32>::new(64, 1);
    let handle = allocator.allocate(8, 1).unwrap();
    allocator.free(handle).unwrap();
    assert_eq!(
        allocator.free(handle),
        Err(AllocatorError::UnknownHandle(handle.get()))
    );
    allocator.validate().unwrap();
}
