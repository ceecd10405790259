//! # Free-List Allocator
//!
//! Manages offsets inside a caller-supplied linear capacity. It never touches
//! memory itself: the chunk mesh manager uses one instance for quad storage
//! and one for draw slots, and maps the offsets onto GPU buffers.
//!
//! ## Policy
//!
//! * **Best fit**: an allocation takes the smallest free block that can hold
//!   the alignment-rounded size. Ties go to the lowest offset.
//! * **Total coalescing**: a freed block merges with its free neighbours on
//!   both sides, so no two adjacent blocks are ever both free.
//! * **Dense handles**: freed handles are recycled before new ones are minted,
//!   keeping side tables indexed by handle compact.
//! * **No self-growth**: a request that does not fit fails with
//!   [`AllocatorError::OutOfCapacity`]. The caller grows with [`FreeListAllocator::grow`]
//!   and retries.
//!
//! ## Invariants
//!
//! Blocks are stored in ascending offset order and tile `[0, capacity)`
//! exactly. [`FreeListAllocator::validate`] checks this along with the handle
//! table and is cheap enough to call after every operation in tests.

use std::fmt;
use std::num::NonZeroU32;

use crate::error::AllocatorError;

/// Opaque handle of a live allocation. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationHandle(NonZeroU32);

impl AllocationHandle {
    fn from_index(index: usize) -> Self {
        // Index 0 maps to handle 1, which is never zero.
        Self(NonZeroU32::MIN.saturating_add(index as u32))
    }

    /// Dense zero-based index of this handle.
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Raw non-zero value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for AllocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocationHandle({})", self.0)
    }
}

/// A live allocation as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation<U> {
    /// Start of the block.
    pub offset: u32,
    /// Size of the block after alignment rounding.
    pub size: u32,
    /// Value attached at allocation time.
    pub user_data: U,
}

/// One record of the offset space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<U> {
    /// Start of the block.
    pub offset: u32,
    /// Length of the block.
    pub size: u32,
    /// Owning handle, `None` for free blocks.
    pub handle: Option<AllocationHandle>,
    /// Value attached at allocation time; default for free blocks.
    pub user_data: U,
}

impl<U> Block<U> {
    /// Whether the block is free.
    pub fn is_free(&self) -> bool {
        self.handle.is_none()
    }
}

const NO_OFFSET: u32 = u32::MAX;

/// Best-fit offset allocator with coalescing and dense handle reuse.
pub struct FreeListAllocator<U = ()> {
    blocks: Vec<Block<U>>,
    /// Offset of each handle's block, [`NO_OFFSET`] when the handle is free.
    handle_offsets: Vec<u32>,
    free_handles: Vec<AllocationHandle>,
    capacity: u32,
    alignment: u32,
    used: u32,
    allocation_count: usize,
}

impl<U: Copy + Default> FreeListAllocator<U> {
    /// Creates an allocator over `[0, capacity)` rounding every request up to
    /// a multiple of `alignment` (treated as 1 when zero).
    pub fn new(capacity: u32, alignment: u32) -> Self {
        let mut blocks = Vec::new();
        if capacity > 0 {
            blocks.push(Block {
                offset: 0,
                size: capacity,
                handle: None,
                user_data: U::default(),
            });
        }
        Self {
            blocks,
            handle_offsets: Vec::new(),
            free_handles: Vec::new(),
            capacity,
            alignment: alignment.max(1),
            used: 0,
            allocation_count: 0,
        }
    }

    /// Reserves `size` units and attaches `user_data` to the block.
    ///
    /// # Returns
    /// - `Ok(handle)` for the new allocation
    /// - `Err(AllocatorError::OutOfCapacity)` when no free block fits; grow and retry
    /// - `Err(AllocatorError::ZeroSize)` for `size == 0`
    pub fn allocate(&mut self, size: u32, user_data: U) -> Result<AllocationHandle, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::ZeroSize);
        }
        let requested = self.align(size)?;

        let mut best: Option<usize> = None;
        let mut largest_free = 0;
        for (index, block) in self.blocks.iter().enumerate() {
            if !block.is_free() {
                continue;
            }
            largest_free = largest_free.max(block.size);
            if block.size < requested {
                continue;
            }
            match best {
                Some(current) if self.blocks[current].size <= block.size => {}
                _ => best = Some(index),
            }
            if block.size == requested {
                break;
            }
        }
        let Some(index) = best else {
            return Err(AllocatorError::OutOfCapacity {
                requested,
                largest_free,
            });
        };

        let handle = self.next_handle();
        let offset = self.blocks[index].offset;
        let remainder = self.blocks[index].size - requested;

        let block = &mut self.blocks[index];
        block.size = requested;
        block.handle = Some(handle);
        block.user_data = user_data;

        if remainder > 0 {
            self.blocks.insert(
                index + 1,
                Block {
                    offset: offset + requested,
                    size: remainder,
                    handle: None,
                    user_data: U::default(),
                },
            );
        }

        self.handle_offsets[handle.index()] = offset;
        self.used += requested;
        self.allocation_count += 1;
        Ok(handle)
    }

    /// Releases an allocation, coalescing with free neighbours.
    ///
    /// # Returns
    /// The number of units returned to the free space.
    pub fn free(&mut self, handle: AllocationHandle) -> Result<u32, AllocatorError> {
        let mut index = self.block_index(handle)?;
        let freed = self.blocks[index].size;

        let block = &mut self.blocks[index];
        block.handle = None;
        block.user_data = U::default();

        if index + 1 < self.blocks.len() && self.blocks[index + 1].is_free() {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }
        if index > 0 && self.blocks[index - 1].is_free() {
            let current = self.blocks.remove(index);
            index -= 1;
            self.blocks[index].size += current.size;
        }

        self.handle_offsets[handle.index()] = NO_OFFSET;
        self.free_handles.push(handle);
        self.used -= freed;
        self.allocation_count -= 1;
        Ok(freed)
    }

    /// Looks up a live allocation.
    pub fn get(&self, handle: AllocationHandle) -> Option<Allocation<U>> {
        let index = self.block_index(handle).ok()?;
        let block = &self.blocks[index];
        Some(Allocation {
            offset: block.offset,
            size: block.size,
            user_data: block.user_data,
        })
    }

    /// Extends the managed capacity. The new space joins a trailing free block.
    pub fn grow(&mut self, new_capacity: u32) -> Result<(), AllocatorError> {
        if new_capacity < self.capacity {
            return Err(AllocatorError::Shrink {
                current: self.capacity,
                requested: new_capacity,
            });
        }
        let added = new_capacity - self.capacity;
        if added == 0 {
            return Ok(());
        }

        match self.blocks.last_mut() {
            Some(last) if last.is_free() => last.size += added,
            _ => self.blocks.push(Block {
                offset: self.capacity,
                size: added,
                handle: None,
                user_data: U::default(),
            }),
        }
        self.capacity = new_capacity;
        Ok(())
    }

    /// Checks every structural invariant.
    pub fn validate(&self) -> Result<(), AllocatorError> {
        let corrupted = |msg: String| Err(AllocatorError::Corrupted(msg));

        let mut expected_offset = 0u32;
        let mut used = 0u32;
        let mut live = 0usize;
        let mut previous_free = false;

        for block in &self.blocks {
            if block.offset != expected_offset {
                return corrupted(format!(
                    "block at {} does not start where the previous ended ({expected_offset})",
                    block.offset
                ));
            }
            if block.size == 0 {
                return corrupted(format!("empty block at {}", block.offset));
            }
            if block.is_free() && previous_free {
                return corrupted(format!("adjacent free blocks at {}", block.offset));
            }
            if let Some(handle) = block.handle {
                if self.handle_offsets.get(handle.index()) != Some(&block.offset) {
                    return corrupted(format!("handle {} points elsewhere", handle.get()));
                }
                used += block.size;
                live += 1;
            }
            previous_free = block.is_free();
            expected_offset = block.offset + block.size;
        }

        if expected_offset != self.capacity {
            return corrupted(format!(
                "blocks cover {expected_offset} units but capacity is {}",
                self.capacity
            ));
        }
        if used != self.used || live != self.allocation_count {
            return corrupted("usage counters disagree with blocks".to_string());
        }
        let mapped = self.handle_offsets.iter().filter(|o| **o != NO_OFFSET).count();
        if mapped != live || mapped + self.free_handles.len() != self.handle_offsets.len() {
            return corrupted("handle table disagrees with blocks".to_string());
        }
        Ok(())
    }

    /// Total managed units.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Units held by live allocations.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Units not held by any allocation.
    pub fn free_units(&self) -> u32 {
        self.capacity - self.used
    }

    /// Live allocations.
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    /// Size of the largest free block.
    pub fn largest_free_block(&self) -> u32 {
        self.blocks
            .iter()
            .filter(|b| b.is_free())
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    /// One past the highest handle index ever issued.
    pub fn handle_high_water(&self) -> usize {
        self.handle_offsets.len()
    }

    /// End of the highest live allocation.
    pub fn used_end(&self) -> u32 {
        self.blocks
            .iter()
            .rev()
            .find(|b| !b.is_free())
            .map(|b| b.offset + b.size)
            .unwrap_or(0)
    }

    /// Blocks in offset order.
    pub fn blocks(&self) -> &[Block<U>] {
        &self.blocks
    }

    /// Rounds `size` up to the allocator's alignment.
    pub fn align(&self, size: u32) -> Result<u32, AllocatorError> {
        size.checked_next_multiple_of(self.alignment)
            .ok_or(AllocatorError::OutOfCapacity {
                requested: size,
                largest_free: self.largest_free_block(),
            })
    }

    fn next_handle(&mut self) -> AllocationHandle {
        if let Some(handle) = self.free_handles.pop() {
            return handle;
        }
        let handle = AllocationHandle::from_index(self.handle_offsets.len());
        self.handle_offsets.push(NO_OFFSET);
        handle
    }

    fn block_index(&self, handle: AllocationHandle) -> Result<usize, AllocatorError> {
        let unknown = AllocatorError::UnknownHandle(handle.get());
        let offset = *self.handle_offsets.get(handle.index()).ok_or(unknown.clone())?;
        if offset == NO_OFFSET {
            return Err(unknown);
        }
        let index = self
            .blocks
            .binary_search_by_key(&offset, |b| b.offset)
            .map_err(|_| unknown.clone())?;
        if self.blocks[index].handle != Some(handle) {
            return Err(unknown);
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(allocator: &mut FreeListAllocator, size: u32) -> AllocationHandle {
        let handle = allocator.allocate(size, ()).unwrap();
        allocator.validate().unwrap();
        handle
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut allocator = FreeListAllocator::new(90, 1);
        let a = alloc(&mut allocator, 30);
        let _b = alloc(&mut allocator, 10);
        let c = alloc(&mut allocator, 10);
        let _d = alloc(&mut allocator, 10);
        // Holes: [0,30), [40,50) and the tail [60,90).
        allocator.free(a).unwrap();
        allocator.free(c).unwrap();
        allocator.validate().unwrap();

        let e = alloc(&mut allocator, 8);
        assert_eq!(allocator.get(e).unwrap().offset, 40);

        // Two equal 30-unit holes: lowest offset wins.
        let f = alloc(&mut allocator, 30);
        assert_eq!(allocator.get(f).unwrap().offset, 0);
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut allocator = FreeListAllocator::new(30, 1);
        let a = alloc(&mut allocator, 10);
        let b = alloc(&mut allocator, 10);
        let c = alloc(&mut allocator, 10);

        allocator.free(a).unwrap();
        allocator.free(c).unwrap();
        assert_eq!(allocator.blocks().len(), 3);

        assert_eq!(allocator.free(b).unwrap(), 10);
        allocator.validate().unwrap();
        assert_eq!(allocator.blocks().len(), 1);
        assert_eq!(allocator.largest_free_block(), 30);
    }

    #[test]
    fn exhaustion_reports_largest_free() {
        let mut allocator = FreeListAllocator::new(16, 4);
        let _a = alloc(&mut allocator, 5);
        assert_eq!(allocator.used(), 8);
        assert_eq!(
            allocator.allocate(9, ()),
            Err(AllocatorError::OutOfCapacity {
                requested: 12,
                largest_free: 8
            })
        );
        assert_eq!(allocator.allocate(0, ()), Err(AllocatorError::ZeroSize));
    }

    #[test]
    fn grow_extends_trailing_free_block() {
        let mut allocator = FreeListAllocator::new(10, 1);
        let _a = alloc(&mut allocator, 6);
        allocator.grow(15).unwrap();
        allocator.validate().unwrap();
        assert_eq!(allocator.largest_free_block(), 9);

        let _b = alloc(&mut allocator, 9);
        allocator.grow(20).unwrap();
        allocator.validate().unwrap();
        assert_eq!(allocator.blocks().last().unwrap().size, 5);
        assert!(matches!(allocator.grow(5), Err(AllocatorError::Shrink { .. })));
    }

    #[test]
    fn handles_are_reused_densely() {
        let mut allocator = FreeListAllocator::new(10, 1);
        let a = alloc(&mut allocator, 1);
        let b = alloc(&mut allocator, 1);
        assert_eq!((a.index(), b.index()), (0, 1));

        allocator.free(a).unwrap();
        let c = alloc(&mut allocator, 1);
        assert_eq!(c, a);
        assert_eq!(allocator.handle_high_water(), 2);
        assert!(matches!(allocator.free(a), Ok(1)));
        assert_eq!(allocator.free(a), Err(AllocatorError::UnknownHandle(a.get())));
    }

    #[test]
    fn user_data_travels_with_block() {
        let mut allocator: FreeListAllocator<u32> = FreeListAllocator::new(8, 1);
        let handle = allocator.allocate(3, 77).unwrap();
        assert_eq!(
            allocator.get(handle),
            Some(Allocation {
                offset: 0,
                size: 3,
                user_data: 77
            })
        );
    }
}
