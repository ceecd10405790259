//! # Staging Ring Buffer
//!
//! A bump allocator over one CPU-visible staging buffer that many worker
//! threads copy finished meshes into.
//!
//! ## Architecture
//!
//! The cursor and the copy-handle table live behind one mutex. A writer holds
//! it only long enough to reserve a range and claim a slot; the byte copy
//! itself happens afterwards, outside the lock, so concurrent writers overlap
//! on disjoint memory.
//!
//! When a reservation would run past the end, the cursor wraps to the start.
//! Every live copy handle keeps its range reserved until the main thread
//! releases it (once the GPU batch that read it has completed), and a
//! reservation that would overlap a live range fails with
//! [`StagingError::Exhausted`] instead of overwriting bytes still in flight.
//! Workers treat that as "try again later".
//!
//! ## Handles
//!
//! A [`CopyHandle`] is a slot index plus the slot's generation. Released slots
//! go back on a free list and bump their generation, so a handle used after
//! release is reported as [`StagingError::StaleHandle`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StagingError;

use super::staging_memory::{StagingBuffer, StagingBufferId, StagingMemory};

/// Copies are placed on this alignment, which keeps quad words aligned and
/// satisfies GPU copy alignment.
pub const STAGING_ALIGNMENT: usize = 8;

/// Reference to one staged copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyHandle {
    slot: u32,
    generation: u32,
}

/// A staged byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedBlock {
    /// Start of the copy inside the staging buffer.
    pub offset: usize,
    /// Bytes copied.
    pub size: usize,
}

struct CopySlot {
    block: StagedBlock,
    /// Bytes reserved, `size` rounded up to [`STAGING_ALIGNMENT`].
    reserved: usize,
    generation: u32,
    live: bool,
}

struct RingState {
    cursor: usize,
    slots: Vec<CopySlot>,
    free_slots: Vec<u32>,
    live: usize,
    live_bytes: usize,
}

impl RingState {
    fn overlaps_live(&self, offset: usize, len: usize) -> bool {
        let end = offset + len;
        self.slots.iter().any(|slot| {
            slot.live && slot.block.offset < end && offset < slot.block.offset + slot.reserved
        })
    }
}

/// Thread-safe ring of staged copies over one staging buffer.
pub struct StagingRing {
    buffer: StagingBufferId,
    memory: Arc<StagingMemory>,
    state: Mutex<RingState>,
}

impl StagingRing {
    /// Wraps a staging buffer obtained from the backend.
    pub fn new(buffer: StagingBuffer) -> Self {
        Self {
            buffer: buffer.id,
            memory: buffer.memory,
            state: Mutex::new(RingState {
                cursor: 0,
                slots: Vec::new(),
                free_slots: Vec::new(),
                live: 0,
                live_bytes: 0,
            }),
        }
    }

    /// Copies `data` into the ring. Callable from any thread.
    ///
    /// # Returns
    /// - `Ok(handle)` naming the staged range
    /// - `Err(StagingError::Exhausted)` when the next free region is still live
    /// - `Err(StagingError::TooLarge)` when `data` can never fit
    pub fn copy(&self, data: &[u8]) -> Result<CopyHandle, StagingError> {
        let size = data.len();
        if size == 0 {
            return Err(StagingError::Empty);
        }
        let capacity = self.memory.len();
        let reserved = size.next_multiple_of(STAGING_ALIGNMENT);
        if reserved > capacity {
            return Err(StagingError::TooLarge {
                requested: size,
                capacity,
            });
        }

        let (handle, offset) = {
            let mut state = self.state.lock();
            let mut offset = state.cursor;
            if offset + reserved > capacity {
                offset = 0;
            }
            if state.overlaps_live(offset, reserved) {
                return Err(StagingError::Exhausted { requested: size });
            }
            state.cursor = offset + reserved;

            let block = StagedBlock { offset, size };
            let handle = match state.free_slots.pop() {
                Some(slot) => {
                    let entry = &mut state.slots[slot as usize];
                    entry.block = block;
                    entry.reserved = reserved;
                    entry.live = true;
                    CopyHandle {
                        slot,
                        generation: entry.generation,
                    }
                }
                None => {
                    let slot = state.slots.len() as u32;
                    state.slots.push(CopySlot {
                        block,
                        reserved,
                        generation: 0,
                        live: true,
                    });
                    CopyHandle {
                        slot,
                        generation: 0,
                    }
                }
            };
            state.live += 1;
            state.live_bytes += reserved;
            (handle, offset)
        };

        // SAFETY: `[offset, offset + reserved)` was just reserved for this
        // handle and overlaps no other live copy. Nobody reads it until the
        // handle reaches the main thread, which happens after this write.
        unsafe { self.memory.write(offset, data) }.map_err(|_| StagingError::TooLarge {
            requested: size,
            capacity,
        })?;
        Ok(handle)
    }

    /// Location of a live copy.
    pub fn get_block(&self, handle: CopyHandle) -> Result<StagedBlock, StagingError> {
        let state = self.state.lock();
        match state.slots.get(handle.slot as usize) {
            Some(slot) if slot.live && slot.generation == handle.generation => Ok(slot.block),
            _ => Err(StagingError::StaleHandle),
        }
    }

    /// Returns a copy's range and slot to the ring.
    pub fn release(&self, handle: CopyHandle) -> Result<(), StagingError> {
        let mut state = self.state.lock();
        let RingState {
            slots, free_slots, ..
        } = &mut *state;
        let reserved = match slots.get_mut(handle.slot as usize) {
            Some(slot) if slot.live && slot.generation == handle.generation => {
                slot.live = false;
                slot.generation = slot.generation.wrapping_add(1);
                free_slots.push(handle.slot);
                slot.reserved
            }
            _ => return Err(StagingError::StaleHandle),
        };
        state.live -= 1;
        state.live_bytes -= reserved;
        if state.live == 0 {
            state.cursor = 0;
        }
        Ok(())
    }

    /// Releases every live copy and rewinds the cursor. Only valid once none
    /// of the staged bytes are still needed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let RingState {
            slots, free_slots, ..
        } = &mut *state;
        free_slots.clear();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.live {
                slot.live = false;
                slot.generation = slot.generation.wrapping_add(1);
            }
            free_slots.push(index as u32);
        }
        state.cursor = 0;
        state.live = 0;
        state.live_bytes = 0;
    }

    /// Staging buffer the ring lives in; the source of upload copy commands.
    pub fn buffer(&self) -> StagingBufferId {
        self.buffer
    }

    /// The bytes behind the ring.
    pub fn memory(&self) -> &Arc<StagingMemory> {
        &self.memory
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Live copies.
    pub fn live_copies(&self) -> usize {
        self.state.lock().live
    }

    /// Bytes reserved by live copies.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> StagingRing {
        StagingRing::new(StagingBuffer {
            id: StagingBufferId(1),
            memory: Arc::new(StagingMemory::new(capacity)),
        })
    }

    fn staged_bytes(ring: &StagingRing, handle: CopyHandle) -> Vec<u8> {
        let block = ring.get_block(handle).unwrap();
        unsafe { ring.memory().read(block.offset, block.size).unwrap().to_vec() }
    }

    #[test]
    fn copies_are_aligned_and_readable() {
        let ring = ring(64);
        let a = ring.copy(&[1, 2, 3]).unwrap();
        let b = ring.copy(&[4; 8]).unwrap();

        assert_eq!(ring.get_block(a).unwrap(), StagedBlock { offset: 0, size: 3 });
        assert_eq!(ring.get_block(b).unwrap(), StagedBlock { offset: 8, size: 8 });
        assert_eq!(staged_bytes(&ring, a), vec![1, 2, 3]);
        assert_eq!(staged_bytes(&ring, b), vec![4; 8]);
        assert_eq!(ring.live_bytes(), 16);
    }

    #[test]
    fn wrap_refuses_to_overwrite_live_copies() {
        let ring = ring(32);
        let a = ring.copy(&[1; 16]).unwrap();
        let _b = ring.copy(&[2; 8]).unwrap();

        // 16 more bytes do not fit at the cursor, and the start is still live.
        assert_eq!(
            ring.copy(&[3; 16]),
            Err(StagingError::Exhausted { requested: 16 })
        );

        ring.release(a).unwrap();
        let c = ring.copy(&[3; 16]).unwrap();
        assert_eq!(ring.get_block(c).unwrap().offset, 0);
        assert_eq!(staged_bytes(&ring, c), vec![3; 16]);
    }

    #[test]
    fn released_handles_go_stale() {
        let ring = ring(32);
        let a = ring.copy(&[1; 4]).unwrap();
        ring.release(a).unwrap();

        assert_eq!(ring.get_block(a), Err(StagingError::StaleHandle));
        assert_eq!(ring.release(a), Err(StagingError::StaleHandle));

        let b = ring.copy(&[2; 4]).unwrap();
        assert_ne!(a, b);
        ring.reset();
        assert_eq!(ring.get_block(b), Err(StagingError::StaleHandle));
        assert_eq!(ring.live_copies(), 0);
    }

    #[test]
    fn rejects_empty_and_oversized_copies() {
        let ring = ring(16);
        assert_eq!(ring.copy(&[]), Err(StagingError::Empty));
        assert_eq!(
            ring.copy(&[0; 17]),
            Err(StagingError::TooLarge {
                requested: 17,
                capacity: 16
            })
        );
    }
}
