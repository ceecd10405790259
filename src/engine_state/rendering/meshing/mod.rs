//! Mesh generation and GPU-side mesh management for chunk rendering.
//!
//! This module turns worker-produced meshes into renderer-visible GPU state.
//! The key goals are:
//! 1. Draw every chunk with one multi-draw-indirect call
//! 2. Batch all uploads of a frame into a single copy submission
//! 3. Never free or destroy anything the GPU may still read
//!
//! # Architecture
//! - `ChunkMeshManager`: owns the quad, metadata and indirect buffers and the
//!   allocators that place meshes and draws inside them
//! - `draw_data`: the per-draw record layout shared with the shader
//! - `mesh/`: the greedy mesher and the packed quad format
//!
//! # Buffers
//! - **Quad buffer**: packed `u64` quads. A chunk's quads occupy one block
//!   handed out by a best-fit [`FreeListAllocator`] in units of quads.
//! - **Metadata buffer**: one [`ChunkDrawData`] per draw slot.
//! - **Indirect buffer**: one `DrawIndirectArgs` per draw slot, in lockstep
//!   with the metadata buffer. Draw slots come from a second allocator whose
//!   handle rides along as the quad allocation's `user_data`.
//!
//! # Frame Lifecycle
//! 1. `upload_chunk_meshes` reserves space and records copies out of the
//!    staging ring
//! 2. `free_meshes` zeroes draw commands and defers the frees
//! 3. `flush` resizes buffers that outgrew their allocation, then submits
//!    every recorded copy as one batch
//! 4. `poll` retires completed batches: staged ranges go back to the ring,
//!    deferred frees go back to the allocators, and buffers retired by a
//!    resize are destroyed once the renderer's frames in flight are past them
//!
//! # Growth
//! When an allocation does not fit, the allocator grows to 1.5× its capacity
//! (or just enough to fit, if that is more) and the allocation is retried
//! once. The physical buffer follows on the next flush.

use std::collections::VecDeque;
use std::sync::Arc;

use bitvec::vec::BitVec;
use log::{debug, info, warn};
use wgpu::util::DrawIndirectArgs;

pub mod draw_data;
pub mod mesh;

pub use draw_data::{ChunkDrawData, DRAW_DATA_SIZE, VERTICES_PER_QUAD};
pub use mesh::{generate_mesh, pack_quad, MeshData, MeshScratch, Quad, QUAD_SIZE};

use crate::config::GpuConfig;
use crate::engine_state::buffer_state::free_list::{AllocationHandle, FreeListAllocator};
use crate::engine_state::buffer_state::staging_ring::{CopyHandle, StagingRing};
use crate::engine_state::buffer_state::{
    AsBytes, BufferId, BufferUsages, CopyCommand, CopySource, GpuBackend, StagingBufferId,
    SubmissionId, DRAW_INDIRECT_SIZE,
};
use crate::error::{AllocatorError, StreamingError};

/// Label of the packed quad buffer.
pub const QUAD_BUFFER_NAME: &str = "Chunk Quad Buffer";
/// Label of the per-draw metadata buffer.
pub const DRAW_DATA_BUFFER_NAME: &str = "Chunk Draw Data Buffer";
/// Label of the indirect draw buffer.
pub const INDIRECT_BUFFER_NAME: &str = "Chunk Indirect Buffer";

/// A finished mesh waiting in the staging ring, produced by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshUpload {
    /// Minimum corner of the chunk in world voxels.
    pub position: [i32; 3],
    /// World voxels per chunk voxel.
    pub lod_scale: u32,
    /// Quads per face, in mesher face order.
    pub face_counts: [u32; 6],
    /// Total quads staged.
    pub quad_count: u32,
    /// Solid voxels in the chunk.
    pub num_solid: u32,
    /// Where the packed quads were staged.
    pub staging_copy_handle: CopyHandle,
}

/// A staged range waiting to be copied into the quad buffer.
struct PendingCopy {
    handle: CopyHandle,
    src_offset: u64,
    dst_offset: u64,
    size: u64,
}

/// Submitted work and the resources it pins until it completes.
struct InFlightBatch {
    submission: SubmissionId,
    ring_handles: Vec<CopyHandle>,
    staging: Option<StagingBufferId>,
    freed_meshes: Vec<AllocationHandle>,
}

/// A buffer replaced by a resize.
struct RetiredBuffer {
    buffer: BufferId,
    /// First batch submitted against the replacement.
    submission: Option<SubmissionId>,
    frame: u64,
}

/// Quad, metadata and indirect buffers plus the allocators behind them.
pub struct ChunkMeshManager {
    quad_allocator: FreeListAllocator<Option<AllocationHandle>>,
    draw_allocator: FreeListAllocator<()>,
    staging: Arc<StagingRing>,
    quad_buffer: BufferId,
    draw_data_buffer: BufferId,
    indirect_buffer: BufferId,
    pending_copies: Vec<PendingCopy>,
    pending_draws: Vec<(u32, ChunkDrawData)>,
    pending_frees: Vec<AllocationHandle>,
    in_flight: VecDeque<InFlightBatch>,
    retired: Vec<RetiredBuffer>,
    live_slots: BitVec,
    active_draws: usize,
    frame: u64,
    frames_in_flight: u64,
    resize_count: usize,
    grow_count: usize,
}

impl ChunkMeshManager {
    /// Creates the three buffers at their configured initial sizes.
    ///
    /// # Arguments
    /// * `backend` - renderer collaborator that owns the buffers
    /// * `config` - initial capacities and frames in flight
    /// * `staging` - the ring workers stage meshes into
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        config: &GpuConfig,
        staging: Arc<StagingRing>,
    ) -> Result<Self, StreamingError> {
        let quad_allocator = FreeListAllocator::new(config.initial_quad_capacity, 1);
        let draw_allocator = FreeListAllocator::new(config.initial_draw_capacity, 1);

        let quad_buffer = backend.create_or_resize_buffer(
            None,
            config.initial_quad_capacity as u64 * QUAD_SIZE,
            BufferUsages::STORAGE,
            QUAD_BUFFER_NAME,
        )?;
        let draw_data_buffer = backend.create_or_resize_buffer(
            None,
            config.initial_draw_capacity as u64 * DRAW_DATA_SIZE,
            BufferUsages::STORAGE,
            DRAW_DATA_BUFFER_NAME,
        )?;
        let indirect_buffer = backend.create_or_resize_buffer(
            None,
            config.initial_draw_capacity as u64 * DRAW_INDIRECT_SIZE,
            BufferUsages::INDIRECT | BufferUsages::STORAGE,
            INDIRECT_BUFFER_NAME,
        )?;

        Ok(Self {
            quad_allocator,
            draw_allocator,
            staging,
            quad_buffer,
            draw_data_buffer,
            indirect_buffer,
            pending_copies: Vec::new(),
            pending_draws: Vec::new(),
            pending_frees: Vec::new(),
            in_flight: VecDeque::new(),
            retired: Vec::new(),
            live_slots: BitVec::repeat(false, config.initial_draw_capacity as usize),
            active_draws: 0,
            frame: 0,
            frames_in_flight: config.frames_in_flight as u64,
            resize_count: 0,
            grow_count: 0,
        })
    }

    /// Places each upload in the quad buffer and claims a draw slot for it.
    ///
    /// # Returns
    /// One entry per upload, `None` for uploads without quads. Handles are
    /// owned by the caller until passed to [`Self::free_meshes`].
    ///
    /// # Implementation Details
    /// - The copies are only recorded; nothing reaches the GPU before `flush`
    /// - Zero-quad uploads release their staging range immediately
    /// - On error nothing of the batch remains: placed meshes are freed and
    ///   every staging range of the batch is released
    pub fn upload_chunk_meshes(
        &mut self,
        uploads: &[MeshUpload],
    ) -> Result<Vec<Option<AllocationHandle>>, StreamingError> {
        let copies_before = self.pending_copies.len();
        let draws_before = self.pending_draws.len();
        let mut handles = Vec::with_capacity(uploads.len());
        for (i, upload) in uploads.iter().enumerate() {
            if upload.quad_count == 0 {
                self.release_staged(upload.staging_copy_handle);
                handles.push(None);
                continue;
            }
            match self.place_upload(upload) {
                Ok(quads) => handles.push(Some(quads)),
                Err(err) => {
                    warn!("Upload batch failed at mesh {i} of {}: {err}", uploads.len());
                    self.abandon_uploads(&handles, copies_before, draws_before);
                    for rest in &uploads[i..] {
                        self.release_staged(rest.staging_copy_handle);
                    }
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }

    /// Allocates space and a draw slot for one upload and records its copy.
    /// Leaves no allocation behind when it fails.
    fn place_upload(&mut self, upload: &MeshUpload) -> Result<AllocationHandle, StreamingError> {
        let block = self.staging.get_block(upload.staging_copy_handle)?;

        let draw = Self::allocate_growing(&mut self.draw_allocator, 1, (), &mut self.grow_count)?;
        let quads = match Self::allocate_growing(
            &mut self.quad_allocator,
            upload.quad_count,
            Some(draw),
            &mut self.grow_count,
        ) {
            Ok(quads) => quads,
            Err(err) => {
                self.draw_allocator.free(draw)?;
                return Err(err.into());
            }
        };

        let offsets = Self::offset_of(&self.quad_allocator, quads).and_then(|quad_offset| {
            Self::offset_of(&self.draw_allocator, draw).map(|slot| (quad_offset, slot))
        });
        let (quad_offset, slot) = match offsets {
            Ok(offsets) => offsets,
            Err(err) => {
                self.quad_allocator.free(quads)?;
                self.draw_allocator.free(draw)?;
                return Err(err.into());
            }
        };

        self.pending_copies.push(PendingCopy {
            handle: upload.staging_copy_handle,
            src_offset: block.offset as u64,
            dst_offset: quad_offset as u64 * QUAD_SIZE,
            size: block.size as u64,
        });
        self.pending_draws.push((
            slot,
            ChunkDrawData {
                position: upload.position,
                lod_scale: upload.lod_scale,
                face_counts: upload.face_counts,
                quad_offset,
                quad_count: upload.quad_count,
            },
        ));

        if self.live_slots.len() <= slot as usize {
            self.live_slots.resize(slot as usize + 1, false);
        }
        self.live_slots.set(slot as usize, true);
        self.active_draws += 1;
        Ok(quads)
    }

    /// Undoes the uploads placed so far by a failing batch. None of them has
    /// been submitted, so their space is freed at once.
    fn abandon_uploads(&mut self, placed: &[Option<AllocationHandle>], copies_before: usize, draws_before: usize) {
        let abandoned: Vec<CopyHandle> = self.pending_copies.drain(copies_before..).map(|c| c.handle).collect();
        for handle in abandoned {
            self.release_staged(handle);
        }
        self.pending_draws.truncate(draws_before);

        for &quads in placed.iter().flatten() {
            let draw = self.quad_allocator.get(quads).and_then(|a| a.user_data);
            if let Some(slot) = draw.and_then(|d| Self::offset_of(&self.draw_allocator, d).ok()) {
                self.live_slots.set(slot as usize, false);
                self.active_draws -= 1;
            }
            if let Some(draw) = draw {
                if let Err(err) = self.draw_allocator.free(draw) {
                    warn!("Failed to return draw slot of abandoned mesh: {err}");
                }
            }
            if let Err(err) = self.quad_allocator.free(quads) {
                warn!("Failed to return space of abandoned mesh: {err}");
            }
        }
    }

    /// Stops drawing the given meshes and frees their space once the GPU is
    /// done with the frame that stopped drawing them.
    pub fn free_meshes(&mut self, handles: &[AllocationHandle]) -> Result<(), StreamingError> {
        for &handle in handles {
            let allocation = self
                .quad_allocator
                .get(handle)
                .ok_or(AllocatorError::UnknownHandle(handle.get()))?;
            let draw = allocation
                .user_data
                .ok_or_else(|| AllocatorError::Corrupted(format!("mesh {handle:?} has no draw slot")))?;
            let slot = Self::offset_of(&self.draw_allocator, draw)?;

            // Already freed this frame.
            if !self.live_slots.get(slot as usize).is_some_and(|bit| *bit) {
                return Err(AllocatorError::UnknownHandle(handle.get()).into());
            }
            self.live_slots.set(slot as usize, false);
            self.active_draws -= 1;
            self.pending_draws.push((slot, ChunkDrawData::default()));
            self.pending_frees.push(handle);
        }
        Ok(())
    }

    /// Submits everything recorded since the last flush as one batch.
    ///
    /// # Returns
    /// The batch's submission, or `None` when there was nothing to submit.
    pub fn flush<B: GpuBackend>(&mut self, backend: &mut B) -> Result<Option<SubmissionId>, StreamingError> {
        self.frame += 1;
        let resized = self.fit_buffers(backend)?;

        if self.pending_copies.is_empty()
            && self.pending_draws.is_empty()
            && self.pending_frees.is_empty()
            && !resized
        {
            return Ok(None);
        }

        let mut commands = Vec::with_capacity(self.pending_copies.len() + 2 * self.pending_draws.len());
        let source = CopySource::Staging(self.staging.buffer());
        let mut ring_handles = Vec::with_capacity(self.pending_copies.len());
        for copy in self.pending_copies.drain(..) {
            commands.push(CopyCommand {
                src: source,
                src_offset: copy.src_offset,
                dst: self.quad_buffer,
                dst_offset: copy.dst_offset,
                size: copy.size,
            });
            ring_handles.push(copy.handle);
        }

        let staging = if self.pending_draws.is_empty() {
            None
        } else {
            Some(self.stage_draws(backend, &mut commands)?)
        };

        let submission = backend.submit_copy_batch(&commands)?;
        for retired in self.retired.iter_mut().filter(|r| r.submission.is_none()) {
            retired.submission = Some(submission);
        }
        self.in_flight.push_back(InFlightBatch {
            submission,
            ring_handles,
            staging,
            freed_meshes: std::mem::take(&mut self.pending_frees),
        });
        debug!(
            "Submitted batch {:?} with {} copies, {} active draws",
            submission,
            commands.len(),
            self.active_draws
        );
        Ok(Some(submission))
    }

    /// Retires completed batches and destroys buffers nothing references anymore.
    pub fn poll<B: GpuBackend>(&mut self, backend: &mut B) -> Result<(), StreamingError> {
        backend.poll()?;
        while self
            .in_flight
            .front()
            .is_some_and(|batch| backend.is_complete(batch.submission))
        {
            if let Some(batch) = self.in_flight.pop_front() {
                self.complete_batch(backend, batch)?;
            }
        }

        let frame = self.frame;
        let frames_in_flight = self.frames_in_flight;
        let mut index = 0;
        while index < self.retired.len() {
            let retired = &self.retired[index];
            let done = retired.submission.is_some_and(|s| backend.is_complete(s))
                && frame >= retired.frame + frames_in_flight;
            if done {
                let retired = self.retired.swap_remove(index);
                backend.destroy_buffer(retired.buffer)?;
                debug!("Destroyed retired buffer {:?}", retired.buffer);
            } else {
                index += 1;
            }
        }
        Ok(())
    }

    /// Waits for every submitted batch and destroys all retired buffers.
    pub fn finish<B: GpuBackend>(&mut self, backend: &mut B) -> Result<(), StreamingError> {
        if let Some(last) = self.in_flight.back() {
            backend.wait(last.submission)?;
        }
        while let Some(batch) = self.in_flight.pop_front() {
            backend.wait(batch.submission)?;
            self.complete_batch(backend, batch)?;
        }
        for retired in self.retired.drain(..) {
            backend.destroy_buffer(retired.buffer)?;
        }
        Ok(())
    }

    /// Chunks currently drawn.
    pub fn active_draw_count(&self) -> usize {
        self.active_draws
    }

    /// Commands the renderer should issue from the indirect buffer.
    /// Includes zeroed slots below the highest live one.
    pub fn draw_command_count(&self) -> u32 {
        self.draw_allocator.used_end()
    }

    /// The packed quad buffer.
    pub fn quad_buffer(&self) -> BufferId {
        self.quad_buffer
    }

    /// The per-draw metadata buffer.
    pub fn draw_data_buffer(&self) -> BufferId {
        self.draw_data_buffer
    }

    /// The indirect draw buffer.
    pub fn indirect_buffer(&self) -> BufferId {
        self.indirect_buffer
    }

    /// Physical buffer resizes so far.
    pub fn resize_count(&self) -> usize {
        self.resize_count
    }

    /// Allocator growth events so far.
    pub fn grow_count(&self) -> usize {
        self.grow_count
    }

    /// Batches submitted and not yet retired.
    pub fn batches_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Buffers waiting for deferred destruction.
    pub fn retired_buffers(&self) -> usize {
        self.retired.len()
    }

    /// Placement of meshes in the quad buffer.
    pub fn quad_allocator(&self) -> &FreeListAllocator<Option<AllocationHandle>> {
        &self.quad_allocator
    }

    /// Placement of draws in the metadata and indirect buffers.
    pub fn draw_allocator(&self) -> &FreeListAllocator<()> {
        &self.draw_allocator
    }

    /// Draw slot of a live mesh.
    pub fn draw_slot(&self, handle: AllocationHandle) -> Option<u32> {
        let draw = self.quad_allocator.get(handle)?.user_data?;
        self.draw_allocator.get(draw).map(|a| a.offset)
    }

    fn allocate_growing<U: Copy + Default>(
        allocator: &mut FreeListAllocator<U>,
        size: u32,
        user_data: U,
        grow_count: &mut usize,
    ) -> Result<AllocationHandle, AllocatorError> {
        match allocator.allocate(size, user_data) {
            Err(AllocatorError::OutOfCapacity { .. }) => {
                let old = allocator.capacity();
                let needed = allocator
                    .used_end()
                    .checked_add(allocator.align(size)?)
                    .ok_or(AllocatorError::OutOfCapacity {
                        requested: size,
                        largest_free: allocator.largest_free_block(),
                    })?;
                let grown = old.saturating_mul(3).div_ceil(2).max(needed);
                allocator.grow(grown)?;
                *grow_count += 1;
                debug!("Allocator grown from {old} to {grown} units");
                allocator.allocate(size, user_data)
            }
            result => result,
        }
    }

    fn offset_of<U: Copy + Default>(
        allocator: &FreeListAllocator<U>,
        handle: AllocationHandle,
    ) -> Result<u32, AllocatorError> {
        allocator
            .get(handle)
            .map(|a| a.offset)
            .ok_or(AllocatorError::UnknownHandle(handle.get()))
    }

    /// Resizes any physical buffer smaller than its allocator's capacity.
    fn fit_buffers<B: GpuBackend>(&mut self, backend: &mut B) -> Result<bool, StreamingError> {
        let quad_bytes = self.quad_allocator.capacity() as u64 * QUAD_SIZE;
        let draw_slots = self.draw_allocator.capacity() as u64;

        let mut resized = false;
        let frame = self.frame;
        for (buffer, needed, usage, label) in [
            (&mut self.quad_buffer, quad_bytes, BufferUsages::STORAGE, QUAD_BUFFER_NAME),
            (
                &mut self.draw_data_buffer,
                draw_slots * DRAW_DATA_SIZE,
                BufferUsages::STORAGE,
                DRAW_DATA_BUFFER_NAME,
            ),
            (
                &mut self.indirect_buffer,
                draw_slots * DRAW_INDIRECT_SIZE,
                BufferUsages::INDIRECT | BufferUsages::STORAGE,
                INDIRECT_BUFFER_NAME,
            ),
        ] {
            let current = backend.buffer_size(*buffer)?;
            if current >= needed {
                continue;
            }
            let old = *buffer;
            *buffer = backend.create_or_resize_buffer(Some(old), needed, usage, label)?;
            self.retired.push(RetiredBuffer {
                buffer: old,
                submission: None,
                frame,
            });
            self.resize_count += 1;
            resized = true;
            info!("Resized {label} from {current} to {needed} bytes");
        }
        Ok(resized)
    }

    /// Writes pending draw records into a fresh staging buffer and records
    /// their copies.
    fn stage_draws<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        commands: &mut Vec<CopyCommand>,
    ) -> Result<StagingBufferId, StreamingError> {
        let records: Vec<ChunkDrawData> = self.pending_draws.iter().map(|(_, d)| *d).collect();
        let mut args = Vec::with_capacity(records.len() * DRAW_INDIRECT_SIZE as usize);
        for (slot, data) in &self.pending_draws {
            let command = if data.is_stale() {
                DrawIndirectArgs {
                    vertex_count: 0,
                    instance_count: 0,
                    first_vertex: 0,
                    first_instance: 0,
                }
            } else {
                data.indirect_args(*slot)
            };
            args.extend_from_slice(command.as_bytes());
        }

        let record_bytes = records.as_bytes();
        let buffer = backend.acquire_staging_buffer(record_bytes.len() + args.len())?;
        // SAFETY: the buffer was just checked out and nothing else holds it.
        unsafe {
            buffer.memory.write(0, record_bytes)?;
            buffer.memory.write(record_bytes.len(), &args)?;
        }

        let source = CopySource::Staging(buffer.id);
        for (i, (slot, _)) in self.pending_draws.drain(..).enumerate() {
            commands.push(CopyCommand {
                src: source,
                src_offset: i as u64 * DRAW_DATA_SIZE,
                dst: self.draw_data_buffer,
                dst_offset: slot as u64 * DRAW_DATA_SIZE,
                size: DRAW_DATA_SIZE,
            });
            commands.push(CopyCommand {
                src: source,
                src_offset: record_bytes.len() as u64 + i as u64 * DRAW_INDIRECT_SIZE,
                dst: self.indirect_buffer,
                dst_offset: slot as u64 * DRAW_INDIRECT_SIZE,
                size: DRAW_INDIRECT_SIZE,
            });
        }
        Ok(buffer.id)
    }

    fn complete_batch<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        batch: InFlightBatch,
    ) -> Result<(), StreamingError> {
        for handle in batch.ring_handles {
            self.release_staged(handle);
        }
        if let Some(staging) = batch.staging {
            backend.release_staging_buffer(staging)?;
        }
        for handle in batch.freed_meshes {
            if let Some(draw) = self.quad_allocator.get(handle).and_then(|a| a.user_data) {
                self.draw_allocator.free(draw)?;
            }
            self.quad_allocator.free(handle)?;
        }
        Ok(())
    }

    fn release_staged(&self, handle: CopyHandle) {
        if let Err(err) = self.staging.release(handle) {
            debug!("Staged copy already released: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_state::buffer_state::headless::HeadlessBackend;

    fn setup(
        quads: u32,
        draws: u32,
        latency: u64,
    ) -> (HeadlessBackend, Arc<StagingRing>, ChunkMeshManager) {
        let mut backend = HeadlessBackend::with_latency(latency);
        let ring = Arc::new(StagingRing::new(backend.acquire_staging_buffer(1 << 16).unwrap()));
        let config = GpuConfig {
            staging_ring_bytes: 1 << 16,
            initial_quad_capacity: quads,
            initial_draw_capacity: draws,
            frames_in_flight: 1,
        };
        let manager = ChunkMeshManager::new(&mut backend, &config, Arc::clone(&ring)).unwrap();
        (backend, ring, manager)
    }

    fn staged(ring: &StagingRing, quads: u32, marker: u64) -> MeshUpload {
        let words: Vec<u64> = (0..quads as u64).map(|i| marker + i).collect();
        MeshUpload {
            position: [marker as i32, 0, 0],
            lod_scale: 1,
            face_counts: [quads, 0, 0, 0, 0, 0],
            quad_count: quads,
            num_solid: 1,
            staging_copy_handle: ring.copy(words.as_bytes()).unwrap(),
        }
    }

    fn read_words(backend: &HeadlessBackend, buffer: BufferId, offset: u32, count: u32) -> Vec<u64> {
        let bytes = backend.read_buffer(buffer).unwrap();
        let start = offset as usize * 8;
        bytemuck::pod_collect_to_vec(&bytes[start..start + count as usize * 8])
    }

    fn read_draw(backend: &HeadlessBackend, manager: &ChunkMeshManager, slot: u32) -> ChunkDrawData {
        let bytes = backend.read_buffer(manager.draw_data_buffer()).unwrap();
        let start = (slot as u64 * DRAW_DATA_SIZE) as usize;
        bytemuck::pod_read_unaligned(&bytes[start..start + DRAW_DATA_SIZE as usize])
    }

    #[test]
    fn uploads_land_in_one_batch() {
        let (mut backend, ring, mut manager) = setup(64, 4, 0);
        let uploads = vec![staged(&ring, 3, 100), staged(&ring, 5, 200)];
        let handles = manager.upload_chunk_meshes(&uploads).unwrap();
        let submission = manager.flush(&mut backend).unwrap();
        assert!(submission.is_some());
        assert_eq!(backend.submitted_batches(), 1);
        assert_eq!(manager.active_draw_count(), 2);

        let second = handles[1].unwrap();
        let offset = manager.quad_allocator().get(second).unwrap().offset;
        assert_eq!(read_words(&backend, manager.quad_buffer(), offset, 5), vec![200, 201, 202, 203, 204]);

        let slot = manager.draw_slot(second).unwrap();
        let draw = read_draw(&backend, &manager, slot);
        assert_eq!(draw.position, [200, 0, 0]);
        assert_eq!(draw.quad_offset, offset);
        assert_eq!(draw.quad_count, 5);

        manager.poll(&mut backend).unwrap();
        assert_eq!(ring.live_copies(), 0);
        assert_eq!(backend.staging_in_use(), 1);
    }

    #[test]
    fn zero_quad_uploads_are_skipped() {
        let (_backend, ring, mut manager) = setup(64, 4, 0);
        let mut empty = staged(&ring, 1, 0);
        empty.quad_count = 0;
        let handles = manager.upload_chunk_meshes(&[empty]).unwrap();
        assert_eq!(handles, vec![None]);
        assert_eq!(manager.quad_allocator().allocation_count(), 0);
        assert_eq!(ring.live_copies(), 0);
    }

    #[test]
    fn frees_wait_for_the_zeroing_batch() {
        let (mut backend, ring, mut manager) = setup(64, 4, 2);
        let handles = manager.upload_chunk_meshes(&[staged(&ring, 4, 1)]).unwrap();
        manager.flush(&mut backend).unwrap();
        let handle = handles[0].unwrap();
        let slot = manager.draw_slot(handle).unwrap();

        manager.free_meshes(&[handle]).unwrap();
        assert_eq!(manager.active_draw_count(), 0);
        assert!(manager.free_meshes(&[handle]).is_err());
        manager.flush(&mut backend).unwrap();
        assert!(read_draw(&backend, &manager, slot).is_stale());
        assert_eq!(manager.quad_allocator().used(), 4);

        manager.poll(&mut backend).unwrap();
        assert_eq!(manager.quad_allocator().used(), 4);
        manager.poll(&mut backend).unwrap();
        assert_eq!(manager.quad_allocator().used(), 0);
        assert_eq!(manager.draw_allocator().used(), 0);
        manager.quad_allocator().validate().unwrap();
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let (mut backend, ring, mut manager) = setup(64, 4, 0);
        let kept = manager.upload_chunk_meshes(&[staged(&ring, 2, 1)]).unwrap()[0].unwrap();
        manager.flush(&mut backend).unwrap();
        manager.poll(&mut backend).unwrap();
        let quads_used = manager.quad_allocator().used();
        let draws_used = manager.draw_allocator().used();

        let first = staged(&ring, 3, 100);
        let gone = staged(&ring, 4, 200);
        ring.release(gone.staging_copy_handle).unwrap();
        let last = staged(&ring, 5, 300);
        assert!(manager.upload_chunk_meshes(&[first, gone, last]).is_err());

        assert_eq!(manager.active_draw_count(), 1);
        assert_eq!(manager.quad_allocator().used(), quads_used);
        assert_eq!(manager.draw_allocator().used(), draws_used);
        assert_eq!(ring.live_copies(), 0);
        manager.quad_allocator().validate().unwrap();
        assert_eq!(manager.flush(&mut backend).unwrap(), None);

        // The surviving mesh is still intact and freeable.
        let slot = manager.draw_slot(kept).unwrap();
        assert_eq!(read_draw(&backend, &manager, slot).quad_count, 2);
        manager.free_meshes(&[kept]).unwrap();
        assert_eq!(manager.active_draw_count(), 0);
    }

    #[test]
    fn overflow_grows_once_by_half() {
        let (mut backend, ring, mut manager) = setup(1000, 8, 0);
        let uploads: Vec<_> = (0..4).map(|i| staged(&ring, 300, i * 1000)).collect();
        manager.upload_chunk_meshes(&uploads).unwrap();
        assert_eq!(manager.grow_count(), 1);
        assert_eq!(manager.quad_allocator().capacity(), 1500);

        manager.flush(&mut backend).unwrap();
        assert_eq!(manager.resize_count(), 1);
        assert_eq!(backend.buffer_size(manager.quad_buffer()).unwrap(), 1500 * QUAD_SIZE);
    }

    #[test]
    fn retired_buffers_outlive_frames_in_flight() {
        let (mut backend, ring, mut manager) = setup(2, 8, 0);
        let old = manager.quad_buffer();
        manager.upload_chunk_meshes(&[staged(&ring, 3, 7)]).unwrap();
        manager.flush(&mut backend).unwrap();
        assert_ne!(manager.quad_buffer(), old);
        assert_eq!(manager.retired_buffers(), 1);

        // Retired in frame 1, one frame in flight: destroyable from frame 2.
        manager.poll(&mut backend).unwrap();
        assert_eq!(manager.retired_buffers(), 1);
        manager.flush(&mut backend).unwrap();
        manager.poll(&mut backend).unwrap();
        assert_eq!(manager.retired_buffers(), 0);
        assert_eq!(backend.destroyed_buffers(), &[old]);
        assert_eq!(read_words(&backend, manager.quad_buffer(), 0, 3), vec![7, 8, 9]);
    }
}
