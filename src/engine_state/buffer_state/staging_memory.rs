//! CPU-visible staging memory shared between worker threads and the main thread.
//!
//! Writers reserve disjoint byte ranges under a lock elsewhere (the staging
//! ring) and then copy into them concurrently without holding it. The memory
//! type only provides the raw access; range ownership is the caller's job,
//! which is why both accessors are `unsafe`.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::error::GpuError;

/// Identifies a staging buffer handed out by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StagingBufferId(pub u64);

/// Fixed-size byte storage with interior mutability.
pub struct StagingMemory {
    bytes: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access goes through `write`/`read`, whose callers guarantee that
// no two threads touch overlapping ranges where at least one of them writes.
unsafe impl Sync for StagingMemory {}

impl StagingMemory {
    /// Allocates `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the memory holds zero bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn check(&self, offset: usize, size: usize) -> Result<(), GpuError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(GpuError::OutOfRange {
                offset: offset as u64,
                size: size as u64,
                len: self.bytes.len() as u64,
            }),
        }
    }

    /// Copies `data` to `offset`.
    ///
    /// # Safety
    /// No other thread may read or write `[offset, offset + data.len())` for
    /// the duration of the call.
    pub unsafe fn write(&self, offset: usize, data: &[u8]) -> Result<(), GpuError> {
        self.check(offset, data.len())?;
        let base = UnsafeCell::raw_get(self.bytes.as_ptr());
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len()) };
        Ok(())
    }

    /// Borrows `[offset, offset + size)`.
    ///
    /// # Safety
    /// No thread may write the range while the returned slice is alive.
    pub unsafe fn read(&self, offset: usize, size: usize) -> Result<&[u8], GpuError> {
        self.check(offset, size)?;
        let base = UnsafeCell::raw_get(self.bytes.as_ptr()) as *const u8;
        // SAFETY: bounds checked above; absence of writers is the caller's contract.
        Ok(unsafe { std::slice::from_raw_parts(base.add(offset), size) })
    }
}

/// A staging buffer checked out from a backend.
#[derive(Clone)]
pub struct StagingBuffer {
    /// Backend id, used as the source of copy commands.
    pub id: StagingBufferId,
    /// The bytes behind the id.
    pub memory: Arc<StagingMemory>,
}

/// Reusable staging buffers, kept by backends so repeated acquisitions of
/// similar sizes stop allocating after warm-up.
#[derive(Default)]
pub struct StagingBufferPool {
    next_id: u64,
    free: Vec<StagingBuffer>,
    in_use: Vec<StagingBuffer>,
}

impl StagingBufferPool {
    /// Hands out the smallest free buffer of at least `min_size` bytes,
    /// allocating one when none fits.
    pub fn acquire(&mut self, min_size: usize) -> StagingBuffer {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.memory.len() >= min_size)
            .min_by_key(|(_, b)| b.memory.len())
            .map(|(index, _)| index);

        let buffer = match best {
            Some(index) => self.free.swap_remove(index),
            None => {
                self.next_id += 1;
                StagingBuffer {
                    id: StagingBufferId(self.next_id),
                    memory: Arc::new(StagingMemory::new(min_size.max(1))),
                }
            }
        };
        self.in_use.push(buffer.clone());
        buffer
    }

    /// Returns a buffer to the free list.
    pub fn release(&mut self, id: StagingBufferId) -> Result<(), GpuError> {
        let index = self
            .in_use
            .iter()
            .position(|b| b.id == id)
            .ok_or(GpuError::UnknownStagingBuffer(id.0))?;
        let buffer = self.in_use.swap_remove(index);
        self.free.push(buffer);
        Ok(())
    }

    /// Looks up a checked-out buffer.
    pub fn get(&self, id: StagingBufferId) -> Result<&Arc<StagingMemory>, GpuError> {
        self.in_use
            .iter()
            .find(|b| b.id == id)
            .map(|b| &b.memory)
            .ok_or(GpuError::UnknownStagingBuffer(id.0))
    }

    /// Buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Buffers ever created.
    pub fn created(&self) -> usize {
        self.in_use.len() + self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_bounds_checked() {
        let memory = StagingMemory::new(8);
        unsafe {
            memory.write(4, &[1, 2, 3, 4]).unwrap();
            assert_eq!(memory.read(4, 4).unwrap(), &[1, 2, 3, 4]);
            assert!(memory.write(6, &[0; 4]).is_err());
            assert!(memory.read(usize::MAX, 2).is_err());
        }
    }

    #[test]
    fn pool_reuses_smallest_fitting_buffer() {
        let mut pool = StagingBufferPool::default();
        let small = pool.acquire(64);
        let large = pool.acquire(1024);
        pool.release(small.id).unwrap();
        pool.release(large.id).unwrap();

        let again = pool.acquire(32);
        assert_eq!(again.id, small.id);
        assert_eq!(pool.created(), 2);
        assert!(pool.release(StagingBufferId(99)).is_err());
    }
}
