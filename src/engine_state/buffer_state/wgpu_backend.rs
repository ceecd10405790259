//! [`GpuBackend`] over a `wgpu` device.
//!
//! Staged bytes live in host memory and reach device buffers through
//! `Queue::write_buffer`; device-to-device copies (buffer growth) use a command
//! encoder. Each batch is one `Queue::submit`, and its completion flag is set
//! from `Queue::on_submitted_work_done`, which fires during `Device::poll`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::error::GpuError;

use super::staging_memory::StagingBufferPool;
use super::{
    check_range, BufferId, BufferUsages, CopyCommand, CopySource, GpuBackend, StagingBuffer,
    StagingBufferId, SubmissionId,
};

/// Requests a default adapter and device, blocking until both are ready.
pub fn request_default_device() -> Result<(wgpu::Device, wgpu::Queue), GpuError> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
        .map_err(|e| GpuError::Unavailable(e.to_string()))?;
    info!("Using adapter {:?}", adapter.get_info().name);

    pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("voxel-lod-streaming"),
        ..Default::default()
    }))
    .map_err(|e| GpuError::Unavailable(e.to_string()))
}

/// Backend that owns real device buffers.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    staging: StagingBufferPool,
    /// Batches not yet observed complete, in submission order.
    submissions: BTreeMap<SubmissionId, Arc<AtomicBool>>,
    /// Every batch up to and including this one has completed.
    completed_through: u64,
    device_lost: Arc<AtomicBool>,
    next_buffer: u64,
    next_submission: u64,
}

impl WgpuBackend {
    /// Wraps an existing device and queue.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let device_lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&device_lost);
        device.set_device_lost_callback(move |reason, message| {
            error!("Device lost ({reason:?}): {message}");
            lost_flag.store(true, Ordering::Release);
        });

        Self {
            device,
            queue,
            buffers: HashMap::new(),
            staging: StagingBufferPool::default(),
            submissions: BTreeMap::new(),
            completed_through: 0,
            device_lost,
            next_buffer: 0,
            next_submission: 0,
        }
    }

    /// The device buffer behind an id, for binding in the renderer.
    pub fn buffer(&self, id: BufferId) -> Option<&wgpu::Buffer> {
        self.buffers.get(&id)
    }

    /// The wrapped device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn ensure_device(&self) -> Result<(), GpuError> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(GpuError::DeviceLost("device lost callback fired".to_string()));
        }
        Ok(())
    }

    /// Queue work completes in submission order, so completed batches are
    /// folded into a watermark and dropped from the map.
    fn retire_completed(&mut self) {
        while let Some(entry) = self.submissions.first_entry() {
            if !entry.get().load(Ordering::Acquire) {
                break;
            }
            let (id, _) = entry.remove_entry();
            self.completed_through = id.0;
        }
    }

    fn get(&self, id: BufferId) -> Result<&wgpu::Buffer, GpuError> {
        self.buffers.get(&id).ok_or(GpuError::UnknownBuffer(id.0))
    }
}

impl GpuBackend for WgpuBackend {
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
        let size = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        if let Some(old) = old {
            let previous = self.get(old)?;
            let kept = previous.size().min(size);
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Buffer Resize Encoder"),
                });
            encoder.copy_buffer_to_buffer(previous, 0, &buffer, 0, kept);
            self.queue.submit(std::iter::once(encoder.finish()));
        }

        self.next_buffer += 1;
        let id = BufferId(self.next_buffer);
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<(), GpuError> {
        let removed = self
            .buffers
            .remove(&buffer)
            .ok_or(GpuError::UnknownBuffer(buffer.0))?;
        removed.destroy();
        Ok(())
    }

    fn buffer_size(&self, buffer: BufferId) -> Result<u64, GpuError> {
        self.get(buffer).map(|b| b.size())
    }

    fn submit_copy_batch(&mut self, commands: &[CopyCommand]) -> Result<SubmissionId, GpuError> {
        self.ensure_device()?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Mesh Upload Encoder"),
            });

        for command in commands.iter().filter(|c| c.size > 0) {
            let dst = self.get(command.dst)?;
            check_range(command.dst_offset, command.size, dst.size())?;
            match command.src {
                CopySource::Staging(id) => {
                    let memory = self.staging.get(id)?;
                    // SAFETY: staged ranges are only written before their copy
                    // handle reaches the main thread, and this runs there.
                    let bytes = unsafe {
                        memory.read(command.src_offset as usize, command.size as usize)?
                    };
                    self.queue.write_buffer(dst, command.dst_offset, bytes);
                }
                CopySource::Device(id) => {
                    let src = self.get(id)?;
                    check_range(command.src_offset, command.size, src.size())?;
                    encoder.copy_buffer_to_buffer(
                        src,
                        command.src_offset,
                        dst,
                        command.dst_offset,
                        command.size,
                    );
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        self.queue
            .on_submitted_work_done(move || flag.store(true, Ordering::Release));

        self.next_submission += 1;
        let id = SubmissionId(self.next_submission);
        self.submissions.insert(id, done);
        Ok(id)
    }

    fn poll(&mut self) -> Result<(), GpuError> {
        self.ensure_device()?;
        self.device
            .poll(wgpu::PollType::Poll)
            .map_err(|e| GpuError::DeviceLost(e.to_string()))?;
        self.retire_completed();
        Ok(())
    }

    fn is_complete(&self, submission: SubmissionId) -> bool {
        submission.0 <= self.completed_through
            || self
                .submissions
                .get(&submission)
                .is_some_and(|done| done.load(Ordering::Acquire))
    }

    fn wait(&mut self, submission: SubmissionId) -> Result<(), GpuError> {
        self.ensure_device()?;
        if self.is_complete(submission) {
            return Ok(());
        }
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| GpuError::DeviceLost(e.to_string()))?;
        self.retire_completed();
        Ok(())
    }
}
