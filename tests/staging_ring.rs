use std::sync::Arc;

use voxel_lod_streaming::engine_state::buffer_state::staging_ring::StagingRing;
use voxel_lod_streaming::engine_state::buffer_state::{StagingBuffer, StagingBufferId, StagingMemory};
use voxel_lod_streaming::error::StagingError;

fn ring(capacity: usize) -> StagingRing {
    StagingRing::new(StagingBuffer {
        id: StagingBufferId(7),
        memory: Arc::new(StagingMemory::new(capacity)),
    })
}

#[test]
fn concurrent_copies_land_in_disjoint_ranges() {
    let ring = ring(1 << 20);
    let threads = 8u8;
    let per_thread = 64usize;

    let handles: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let ring = &ring;
                scope.spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(t as u64);
                    (0..per_thread)
                        .map(|_| {
                            let len = rng.usize(1..=512);
                            (ring.copy(&vec![t; len]).unwrap(), t, len)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(ring.live_copies(), threads as usize * per_thread);
    let mut ranges = Vec::new();
    for (handle, tag, len) in &handles {
        let block = ring.get_block(*handle).unwrap();
        assert_eq!(block.size, *len);
        let bytes = unsafe { ring.memory().read(block.offset, block.size).unwrap() };
        assert!(bytes.iter().all(|b| b == tag), "copy of thread {tag} was overwritten");
        ranges.push((block.offset, block.offset + block.size));
    }
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }

    for (handle, _, _) in handles {
        ring.release(handle).unwrap();
    }
    assert_eq!(ring.live_copies(), 0);
    assert_eq!(ring.live_bytes(), 0);
}

#[test]
fn contended_small_ring_never_overwrites() {
    let ring = ring(4096);
    std::thread::scope(|scope| {
        for t in 0..4u8 {
            let ring = &ring;
            scope.spawn(move || {
                for _ in 0..500 {
                    match ring.copy(&[t; 200]) {
                        Ok(handle) => {
                            let block = ring.get_block(handle).unwrap();
                            let bytes = unsafe { ring.memory().read(block.offset, block.size).unwrap() };
                            assert!(bytes.iter().all(|b| *b == t));
                            ring.release(handle).unwrap();
                        }
                        Err(StagingError::Exhausted { .. }) => std::thread::yield_now(),
                        Err(err) => panic!("unexpected error {err}"),
                    }
                }
            });
        }
    });
    assert_eq!(ring.live_copies(), 0);
}
