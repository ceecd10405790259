//! # Buffer State Module
//!
//! The GPU side of the streaming core: the backend seam through which the core
//! talks to the renderer, plus the CPU-side bookkeeping that decides where
//! bytes live.
//!
//! ## Key Features
//!
//! * [`GpuBackend`]: the only surface the core consumes from a renderer.
//!   Submit a batch of copies and get a completion signal, check out pooled
//!   staging buffers, and create or resize device buffers.
//! * [`free_list::FreeListAllocator`]: best-fit management of offsets inside a
//!   device buffer.
//! * [`staging_ring::StagingRing`]: the shared staging buffer worker threads
//!   copy finished meshes into.
//! * [`headless::HeadlessBackend`] and [`wgpu_backend::WgpuBackend`]: an
//!   in-memory backend for tests and tools, and the real one.
//!
//! ## Architecture
//!
//! Device buffers are referred to by [`BufferId`] and never by reference, so
//! the core keeps no borrows into the renderer. A resize hands back a new id;
//! the core retires the old id and destroys it once nothing in flight can
//! still reference it.

use std::fmt::Debug;

use bytemuck::NoUninit;
use wgpu::util::DrawIndirectArgs;

pub use wgpu::BufferUsages;

use crate::error::GpuError;

pub mod free_list;
pub mod headless;
pub mod staging_memory;
pub mod staging_ring;
pub mod wgpu_backend;

pub use staging_memory::{StagingBuffer, StagingBufferId, StagingMemory};

/// Identifies a device buffer owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Identifies one submitted copy batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

/// Where the bytes of a copy come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySource {
    /// A staging buffer checked out from the backend.
    Staging(StagingBufferId),
    /// Another device buffer.
    Device(BufferId),
}

/// One raw copy of the batch handed to [`GpuBackend::submit_copy_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCommand {
    /// Source buffer.
    pub src: CopySource,
    /// Byte offset in the source.
    pub src_offset: u64,
    /// Destination device buffer.
    pub dst: BufferId,
    /// Byte offset in the destination.
    pub dst_offset: u64,
    /// Bytes to copy.
    pub size: u64,
}

/// The renderer collaborator consumed by the streaming core.
///
/// All calls happen on the main thread.
pub trait GpuBackend {
    /// Checks out a CPU-visible staging buffer of at least `min_size` bytes.
    fn acquire_staging_buffer(&mut self, min_size: usize) -> Result<StagingBuffer, GpuError>;

    /// Returns a staging buffer to the backend's pool.
    fn release_staging_buffer(&mut self, buffer: StagingBufferId) -> Result<(), GpuError>;

    /// Creates a device buffer of `size` bytes. With `old`, the old contents
    /// are copied into the new buffer; the old buffer stays alive until
    /// [`GpuBackend::destroy_buffer`] is called for it.
    fn create_or_resize_buffer(
        &mut self,
        old: Option<BufferId>,
        size: u64,
        usage: BufferUsages,
        label: &'static str,
    ) -> Result<BufferId, GpuError>;

    /// Destroys a device buffer.
    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), GpuError>;

    /// Size of a device buffer in bytes.
    fn buffer_size(&self, buffer: BufferId) -> Result<u64, GpuError>;

    /// Submits all copies as one batch. Completion is asynchronous.
    fn submit_copy_batch(&mut self, commands: &[CopyCommand]) -> Result<SubmissionId, GpuError>;

    /// Advances completion tracking without blocking.
    fn poll(&mut self) -> Result<(), GpuError>;

    /// Whether a batch has finished on the device.
    fn is_complete(&self, submission: SubmissionId) -> bool;

    /// Blocks until a batch has finished.
    fn wait(&mut self, submission: SubmissionId) -> Result<(), GpuError>;
}

/// Types that can be written to a GPU buffer as raw bytes.
pub trait AsBytes {
    /// The value's bytes.
    fn as_bytes(&self) -> &[u8];
}

impl<T> AsBytes for Vec<T>
where
    T: NoUninit,
{
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }
}

impl<T> AsBytes for [T]
where
    T: NoUninit,
{
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }
}

impl AsBytes for DrawIndirectArgs {
    fn as_bytes(&self) -> &[u8] {
        DrawIndirectArgs::as_bytes(self)
    }
}

/// Size of one indirect draw command in bytes.
pub const DRAW_INDIRECT_SIZE: u64 = std::mem::size_of::<DrawIndirectArgs>() as u64;

/// Checks a `[offset, offset + size)` access against a buffer length.
pub(crate) fn check_range(offset: u64, size: u64, len: u64) -> Result<(), GpuError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(GpuError::OutOfRange { offset, size, len }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_args_are_four_words() {
        let args = DrawIndirectArgs {
            vertex_count: 6,
            instance_count: 1,
            first_vertex: 12,
            first_instance: 3,
        };
        let bytes = AsBytes::as_bytes(&args);
        assert_eq!(bytes.len() as u64, DRAW_INDIRECT_SIZE);
        assert_eq!(&bytes[..4], &6u32.to_ne_bytes());
        assert_eq!(&bytes[12..], &3u32.to_ne_bytes());
    }

    #[test]
    fn range_check_catches_overflow() {
        assert!(check_range(4, 4, 8).is_ok());
        assert!(check_range(5, 4, 8).is_err());
        assert!(check_range(u64::MAX, 2, 8).is_err());
    }
}
