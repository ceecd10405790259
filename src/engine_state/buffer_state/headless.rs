//! In-memory [`GpuBackend`] used by tests, tools, and the headless demo.
//!
//! Device buffers are plain byte vectors. Copies are applied when the batch is
//! submitted, but a batch only reports completion after a configurable number
//! of [`GpuBackend::poll`] calls, which lets tests exercise the "not complete
//! yet" paths of deferred frees and buffer retirement.

use std::collections::HashMap;

use log::debug;

use crate::error::GpuError;

use super::staging_memory::StagingBufferPool;
use super::{
    check_range, BufferId, BufferUsages, CopyCommand, CopySource, GpuBackend, StagingBuffer,
    StagingBufferId, SubmissionId,
};

struct HeadlessBuffer {
    label: &'static str,
    usage: BufferUsages,
    bytes: Vec<u8>,
}

/// Backend that keeps "device" memory on the heap.
pub struct HeadlessBackend {
    buffers: HashMap<BufferId, HeadlessBuffer>,
    staging: StagingBufferPool,
    next_buffer: u64,
    next_submission: u64,
    /// Poll tick at which each submission completes.
    ready_at: HashMap<SubmissionId, u64>,
    tick: u64,
    completion_latency: u64,
    device_lost: bool,
    destroyed: Vec<BufferId>,
    submitted_batches: usize,
    submitted_copies: usize,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// A backend whose batches complete immediately.
    pub fn new() -> Self {
        Self::with_latency(0)
    }

    /// A backend whose batches complete after `polls` calls to `poll`.
    pub fn with_latency(polls: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            staging: StagingBufferPool::default(),
            next_buffer: 0,
            next_submission: 0,
            ready_at: HashMap::new(),
            tick: 0,
            completion_latency: polls,
            device_lost: false,
            destroyed: Vec::new(),
            submitted_batches: 0,
            submitted_copies: 0,
        }
    }

    /// Makes every later device call fail with [`GpuError::DeviceLost`].
    pub fn lose_device(&mut self) {
        self.device_lost = true;
    }

    /// Contents of a live device buffer.
    pub fn read_buffer(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.bytes.as_slice())
    }

    /// Label and usage a live buffer was created with.
    pub fn buffer_info(&self, buffer: BufferId) -> Option<(&'static str, BufferUsages)> {
        self.buffers.get(&buffer).map(|b| (b.label, b.usage))
    }

    /// Buffers destroyed so far, in order.
    pub fn destroyed_buffers(&self) -> &[BufferId] {
        &self.destroyed
    }

    /// Live device buffers.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Staging buffers currently checked out.
    pub fn staging_in_use(&self) -> usize {
        self.staging.in_use()
    }

    /// Batches submitted so far.
    pub fn submitted_batches(&self) -> usize {
        self.submitted_batches
    }

    /// Copy commands submitted so far.
    pub fn submitted_copies(&self) -> usize {
        self.submitted_copies
    }

    fn ensure_device(&self) -> Result<(), GpuError> {
        if self.device_lost {
            return Err(GpuError::DeviceLost("headless device marked lost".to_string()));
        }
        Ok(())
    }

    fn apply(&mut self, command: &CopyCommand) -> Result<(), GpuError> {
        let bytes = match command.src {
            CopySource::Staging(id) => {
                let memory = self.staging.get(id)?;
                // SAFETY: staged ranges are only written before their copy
                // handle is handed to the main thread, and this runs there.
                let src = unsafe { memory.read(command.src_offset as usize, command.size as usize)? };
                src.to_vec()
            }
            CopySource::Device(id) => {
                let src = self
                    .buffers
                    .get(&id)
                    .ok_or(GpuError::UnknownBuffer(id.0))?;
                check_range(command.src_offset, command.size, src.bytes.len() as u64)?;
                let start = command.src_offset as usize;
                src.bytes[start..start + command.size as usize].to_vec()
            }
        };

        let dst = self
            .buffers
            .get_mut(&command.dst)
            .ok_or(GpuError::UnknownBuffer(command.dst.0))?;
        check_range(command.dst_offset, command.size, dst.bytes.len() as u64)?;
        let start = command.dst_offset as usize;
        dst.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }
}

impl GpuBackend for HeadlessBackend {
    fn acquire_staging_buffer(&mut self, min_size: usize) -> Result<StagingBuffer, GpuError> {
        self.ensure_device()?;
        Ok(self.staging.acquire(min_size))
    }

    fn release_staging_buffer(&mut self, buffer: StagingBufferId) -> Result<(), GpuError> {
        self.staging.release(buffer)
    }

    fn create_or_resize_buffer(
        &mut self,
        old: Option<BufferId>,
        size: u64,
        usage: BufferUsages,
        label: &'static str,
    ) -> Result<BufferId, GpuError> {
        self.ensure_device()?;
        let mut bytes = vec![0u8; size as usize];
        if let Some(old) = old {
            let previous = self
                .buffers
                .get(&old)
                .ok_or(GpuError::UnknownBuffer(old.0))?;
            let kept = previous.bytes.len().min(bytes.len());
            bytes[..kept].copy_from_slice(&previous.bytes[..kept]);
        }

        self.next_buffer += 1;
        let id = BufferId(self.next_buffer);
        debug!("Created headless buffer {label} ({size} bytes) as {id:?}");
        self.buffers.insert(id, HeadlessBuffer { label, usage, bytes });
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), GpuError> {
        self.buffers
            .remove(&buffer)
            .ok_or(GpuError::UnknownBuffer(buffer.0))?;
        self.destroyed.push(buffer);
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> Result<u64, GpuError> {
        self.buffers
            .get(&buffer)
            .map(|b| b.bytes.len() as u64)
            .ok_or(GpuError::UnknownBuffer(buffer.0))
    }

    fn submit_copy_batch(&mut self, commands: &[CopyCommand]) -> Result<SubmissionId, GpuError> {
        self.ensure_device()?;
        for command in commands {
            self.apply(command)?;
        }

        self.next_submission += 1;
        let id = SubmissionId(self.next_submission);
        self.ready_at.insert(id, self.tick + self.completion_latency);
        self.submitted_batches += 1;
        self.submitted_copies += commands.len();
        Ok(id)
    }

    fn poll(&mut self) -> Result<(), GpuError> {
        self.ensure_device()?;
        self.tick += 1;
        Ok(())
    }

    fn is_complete(&self, submission: SubmissionId) -> bool {
        self.ready_at
            .get(&submission)
            .is_some_and(|ready| *ready <= self.tick)
    }

    fn wait(&mut self, submission: SubmissionId) -> Result<(), GpuError> {
        self.ensure_device()?;
        if let Some(ready) = self.ready_at.get(&submission) {
            self.tick = self.tick.max(*ready);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_complete_after_latency() {
        let mut backend = HeadlessBackend::with_latency(2);
        let staging = backend.acquire_staging_buffer(8).unwrap();
        unsafe { staging.memory.write(0, &[9; 8]).unwrap() };
        let dst = backend
            .create_or_resize_buffer(None, 16, BufferUsages::STORAGE, "test")
            .unwrap();

        let submission = backend
            .submit_copy_batch(&[CopyCommand {
                src: CopySource::Staging(staging.id),
                src_offset: 0,
                dst,
                dst_offset: 8,
                size: 8,
            }])
            .unwrap();

        assert!(!backend.is_complete(submission));
        backend.poll().unwrap();
        assert!(!backend.is_complete(submission));
        backend.poll().unwrap();
        assert!(backend.is_complete(submission));
        assert_eq!(&backend.read_buffer(dst).unwrap()[8..], &[9; 8]);
    }

    #[test]
    fn resize_keeps_contents() {
        let mut backend = HeadlessBackend::new();
        let staging = backend.acquire_staging_buffer(4).unwrap();
        unsafe { staging.memory.write(0, &[1, 2, 3, 4]).unwrap() };
        let old = backend
            .create_or_resize_buffer(None, 4, BufferUsages::STORAGE, "grow")
            .unwrap();
        backend
            .submit_copy_batch(&[CopyCommand {
                src: CopySource::Staging(staging.id),
                src_offset: 0,
                dst: old,
                dst_offset: 0,
                size: 4,
            }])
            .unwrap();

        let new = backend
            .create_or_resize_buffer(Some(old), 6, BufferUsages::STORAGE, "grow")
            .unwrap();
        assert_eq!(backend.read_buffer(new).unwrap(), &[1, 2, 3, 4, 0, 0]);
        assert!(backend.read_buffer(old).is_some());

        backend.destroy_buffer(old).unwrap();
        assert_eq!(backend.destroyed_buffers(), &[old]);
    }

    #[test]
    fn lost_device_fails_submissions() {
        let mut backend = HeadlessBackend::new();
        backend.lose_device();
        assert!(matches!(
            backend.submit_copy_batch(&[]),
            Err(GpuError::DeviceLost(_))
        ));
    }
}
