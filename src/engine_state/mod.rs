//! # Engine State Module
//!
//! The streaming context that ties the subsystems together.
//!
//! ## Key Components
//!
//! * `TerrainStreamer` - The per-tick coordinator driven by the embedding renderer
//! * `buffer_state` - The GPU backend seam, the free-list allocator and the staging ring
//! * `rendering` - Greedy meshing and management of the chunk mesh buffers
//! * `task_management` - The bounded worker pool
//! * `voxels` - Chunk grids, terrain, height maps, the LOD octree and worker tasks
//!
//! ## Architecture
//!
//! Everything that mutates the octree, the allocators or GPU state runs on the
//! thread calling [`TerrainStreamer::update`]. Workers only read height maps
//! and write into the staging ring; their results come back through the task
//! manager's completion queue and carry a ticket that is checked against the
//! node before anything is applied.
//!
//! ## Tick Order
//!
//! 1. Retire completed GPU batches
//! 2. Drain worker results and record their uploads
//! 3. Re-evaluate LOD for the camera, releasing meshes of split or coarsened nodes
//! 4. Dispatch queued nodes while the worker pool admits them
//! 5. Submit the frame's copies as one batch

use std::sync::Arc;
use std::time::Duration;

use cgmath::Point3;
use log::{debug, error, info, warn};
use web_time::Instant;

use buffer_state::free_list::AllocationHandle;
use buffer_state::staging_ring::StagingRing;
use buffer_state::{BufferId, GpuBackend};
use rendering::meshing::{ChunkMeshManager, MeshUpload};
use task_management::TaskManager;
use voxels::height_map::HeightMapCache;
use voxels::octree::{LodOctree, NodeRef};
use voxels::tasks::{ChunkGenerationTask, GenerationResult, TaskOutcome, WorkerContext};
use voxels::terrain::TerrainGenerator;

use crate::config::StreamingConfig;
use crate::error::{GpuError, StreamingError};

pub mod buffer_state;
pub mod rendering;
pub mod task_management;
pub mod voxels;

/// Minimum time between two height-map eviction sweeps.
const EVICTION_INTERVAL: Duration = Duration::from_millis(250);

/// Counters describing the streamer at the end of the last tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingStats {
    /// Ticks run so far.
    pub ticks: u64,
    /// Live octree nodes.
    pub nodes: usize,
    /// Live chunk states.
    pub chunk_states: usize,
    /// Queue entries waiting for dispatch.
    pub pending_dispatch: usize,
    /// Tasks published whose results have not been drained.
    pub tasks_in_flight: usize,
    /// Chunks currently drawn.
    pub active_draws: usize,
    /// Commands the renderer should issue from the indirect buffer.
    pub draw_commands: u32,
    /// Quad buffer capacity, in quads.
    pub quad_capacity: u32,
    /// Quads allocated, including blocks waiting for their deferred free.
    pub quads_used: u32,
    /// Bytes held by live staging copies.
    pub staging_live_bytes: usize,
    /// Cached height maps.
    pub height_maps_cached: usize,
    /// Meshes uploaded since construction.
    pub uploads: u64,
    /// Results discarded because their node changed while they were computed.
    pub stale_results: u64,
    /// Results that asked to be dispatched again.
    pub retries: u64,
    /// Nodes that could not be meshed.
    pub failures: u64,
    /// Worker tasks that panicked.
    pub worker_panics: usize,
    /// Physical GPU buffer resizes.
    pub buffer_resizes: usize,
}

/// Streams LOD terrain meshes into GPU buffers around a moving camera.
///
/// Call [`Self::update`] once per frame with the camera position, then draw
/// [`Self::draw_command_count`] commands from [`Self::indirect_buffer`].
///
/// # Examples
///
/// ```no_run
/// use cgmath::Point3;
/// use voxel_lod_streaming::engine_state::buffer_state::headless::HeadlessBackend;
/// use voxel_lod_streaming::{StreamingConfig, TerrainStreamer};
///
/// let mut streamer = TerrainStreamer::new(StreamingConfig::default(), HeadlessBackend::new())?;
/// for frame in 0..60 {
///     streamer.update(Point3::new(frame as f32 * 8.0, 40.0, 0.0))?;
/// }
/// streamer.finish_pending_work()?;
/// # Ok::<(), voxel_lod_streaming::error::StreamingError>(())
/// ```
pub struct TerrainStreamer<B: GpuBackend> {
    backend: B,
    octree: LodOctree,
    task_manager: TaskManager<TaskOutcome>,
    mesh_manager: ChunkMeshManager,
    context: Arc<WorkerContext>,
    staging: Arc<StagingRing>,
    height_maps: Arc<HeightMapCache>,
    last_camera: Option<Point3<f32>>,
    last_eviction: Instant,
    stats: StreamingStats,
}

impl<B: GpuBackend> TerrainStreamer<B> {
    /// Validates `config` and builds every subsystem.
    ///
    /// # Arguments
    /// * `config` - streaming configuration
    /// * `backend` - renderer collaborator; the streamer owns it from here on
    pub fn new(config: StreamingConfig, mut backend: B) -> Result<Self, StreamingError> {
        config.validate()?;

        let staging = Arc::new(StagingRing::new(
            backend.acquire_staging_buffer(config.gpu.staging_ring_bytes)?,
        ));
        let height_maps = Arc::new(HeightMapCache::from_config(&config.terrain));
        let max_in_flight = config.workers.max_tasks_in_flight;
        let task_manager = TaskManager::new(config.workers.resolved_threads(), max_in_flight)?;
        let context = Arc::new(WorkerContext::new(
            TerrainGenerator::new(Arc::clone(&height_maps)),
            Arc::clone(&staging),
            max_in_flight,
        ));
        let mesh_manager = ChunkMeshManager::new(&mut backend, &config.gpu, Arc::clone(&staging))?;
        let octree = LodOctree::new(&config.octree);

        info!(
            "Terrain streamer ready: depth {}, root {} voxels at {:?}, {} tasks in flight, {} byte staging ring",
            config.octree.max_depth,
            config.octree.root_size(),
            config.octree.root_origin(),
            max_in_flight,
            config.gpu.staging_ring_bytes
        );

        Ok(Self {
            backend,
            octree,
            task_manager,
            mesh_manager,
            context,
            staging,
            height_maps,
            last_camera: None,
            last_eviction: Instant::now(),
            stats: StreamingStats::default(),
        })
    }

    /// Runs one tick for the given camera position.
    ///
    /// # Returns
    /// Whether the octree was re-evaluated, i.e. the camera entered a new cell.
    ///
    /// # Errors
    /// Allocator corruption and device loss. Both are fatal for the session.
    pub fn update(&mut self, camera: Point3<f32>) -> Result<bool, StreamingError> {
        let result = self.tick(camera);
        if let Err(StreamingError::Gpu(GpuError::DeviceLost(reason))) = &result {
            error!("GPU device lost during update: {reason}");
        }
        result
    }

    fn tick(&mut self, camera: Point3<f32>) -> Result<bool, StreamingError> {
        self.last_camera = Some(camera);
        self.mesh_manager.poll(&mut self.backend)?;

        let uploads = self.apply_outcomes();
        self.upload(uploads)?;

        let mut freed = Vec::new();
        let traversed = self.octree.update(camera, &mut freed);
        self.mesh_manager.free_meshes(&freed)?;

        self.dispatch();
        self.mesh_manager.flush(&mut self.backend)?;

        let now = Instant::now();
        if now.duration_since(self.last_eviction) >= EVICTION_INTERVAL {
            let evicted = self.height_maps.evict_expired(now);
            if evicted > 0 {
                debug!("Evicted {evicted} expired height maps");
            }
            self.last_eviction = now;
        }

        self.stats.ticks += 1;
        self.refresh_stats();
        debug!("{:?}", self.stats);
        Ok(traversed)
    }

    /// Applies drained results to the octree, returning the meshes to upload.
    fn apply_outcomes(&mut self) -> Vec<(NodeRef, MeshUpload)> {
        let mut uploads = Vec::new();
        for TaskOutcome { node, ticket, result } in self.task_manager.drain() {
            if !self.octree.accept(node, ticket) {
                debug!("Discarding stale result for node {node:?}");
                self.stats.stale_results += 1;
                if let GenerationResult::Mesh(upload) = result {
                    self.release_staged(&upload);
                }
                continue;
            }
            match result {
                GenerationResult::TerrainEmpty => self.octree.mark_empty(node, 0),
                GenerationResult::MeshEmpty { num_solid } => self.octree.mark_empty(node, num_solid),
                GenerationResult::Mesh(upload) => {
                    self.octree.begin_upload(node, upload.num_solid);
                    uploads.push((node, upload));
                }
                GenerationResult::Retry => {
                    debug!("Requeueing node {node:?}");
                    self.stats.retries += 1;
                    self.octree.requeue(node, ticket);
                }
                GenerationResult::Failed => {
                    warn!("Node {node:?} could not be meshed, leaving it empty");
                    self.stats.failures += 1;
                    self.octree.mark_empty(node, 0);
                }
            }
        }
        uploads
    }

    fn upload(&mut self, uploads: Vec<(NodeRef, MeshUpload)>) -> Result<(), StreamingError> {
        if uploads.is_empty() {
            return Ok(());
        }
        let (nodes, meshes): (Vec<NodeRef>, Vec<MeshUpload>) = uploads.into_iter().unzip();
        let handles = self.mesh_manager.upload_chunk_meshes(&meshes)?;

        let mut orphaned = Vec::new();
        for (node, handle) in nodes.into_iter().zip(handles) {
            if handle.is_some() {
                self.stats.uploads += 1;
            }
            if !self.octree.assign_mesh(node, handle) {
                orphaned.extend(handle);
            }
        }
        self.mesh_manager.free_meshes(&orphaned)
    }

    fn dispatch(&mut self) {
        while self.task_manager.can_enqueue_task() {
            let Some(request) = self.octree.next_dispatch() else {
                break;
            };
            self.task_manager
                .publish_task(ChunkGenerationTask::new(request, Arc::clone(&self.context)));
        }
    }

    fn release_staged(&self, upload: &MeshUpload) {
        if let Err(err) = self.staging.release(upload.staging_copy_handle) {
            debug!("Staged copy of a stale result already released: {err}");
        }
    }

    /// Ticks at the last camera position until no generation work is left,
    /// then waits for the GPU to finish every submitted batch.
    pub fn finish_pending_work(&mut self) -> Result<(), StreamingError> {
        if let Some(camera) = self.last_camera {
            while self.task_manager.in_flight() > 0 || self.octree.pending_count() > 0 {
                self.task_manager.wait_idle();
                self.update(camera)?;
            }
        }
        self.mesh_manager.finish(&mut self.backend)?;
        self.refresh_stats();
        Ok(())
    }

    /// Drops the whole world and returns every pool to its initial state.
    ///
    /// Blocks until running tasks finish and the GPU has completed every batch.
    pub fn reset(&mut self) -> Result<(), StreamingError> {
        self.task_manager.wait_idle();
        for outcome in self.task_manager.clear() {
            if let GenerationResult::Mesh(upload) = &outcome.result {
                self.release_staged(upload);
            }
        }

        let mut freed = Vec::new();
        self.octree.reset(&mut freed);
        self.mesh_manager.free_meshes(&freed)?;
        self.mesh_manager.flush(&mut self.backend)?;
        self.mesh_manager.finish(&mut self.backend)?;
        self.staging.reset();
        self.height_maps.clear();
        self.last_camera = None;

        info!("World reset, {} meshes released", freed.len());
        self.refresh_stats();
        Ok(())
    }

    fn refresh_stats(&mut self) {
        let quads = self.mesh_manager.quad_allocator();
        self.stats.nodes = self.octree.node_count();
        self.stats.chunk_states = self.octree.state_count();
        self.stats.pending_dispatch = self.octree.pending_count();
        self.stats.tasks_in_flight = self.task_manager.in_flight();
        self.stats.active_draws = self.mesh_manager.active_draw_count();
        self.stats.draw_commands = self.mesh_manager.draw_command_count();
        self.stats.quad_capacity = quads.capacity();
        self.stats.quads_used = quads.used();
        self.stats.staging_live_bytes = self.staging.live_bytes();
        self.stats.height_maps_cached = self.height_maps.len();
        self.stats.worker_panics = self.task_manager.panic_count();
        self.stats.buffer_resizes = self.mesh_manager.resize_count();
    }

    /// Counters as of the end of the last tick.
    pub fn stats(&self) -> StreamingStats {
        self.stats
    }

    /// Number of live draws.
    pub fn active_draw_count(&self) -> usize {
        self.mesh_manager.active_draw_count()
    }

    /// Commands to issue from the indirect buffer. Zeroed slots draw nothing.
    pub fn draw_command_count(&self) -> u32 {
        self.mesh_manager.draw_command_count()
    }

    /// Buffer of packed quads.
    pub fn quad_buffer(&self) -> BufferId {
        self.mesh_manager.quad_buffer()
    }

    /// Buffer of per-draw metadata, indexed by draw slot.
    pub fn draw_data_buffer(&self) -> BufferId {
        self.mesh_manager.draw_data_buffer()
    }

    /// Buffer of indirect draw commands, indexed by draw slot.
    pub fn indirect_buffer(&self) -> BufferId {
        self.mesh_manager.indirect_buffer()
    }

    /// Draw slot of a mesh, for looking up its records.
    pub fn draw_slot(&self, mesh: AllocationHandle) -> Option<u32> {
        self.mesh_manager.draw_slot(mesh)
    }

    /// The renderer collaborator.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the renderer collaborator.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The LOD octree.
    pub fn octree(&self) -> &LodOctree {
        &self.octree
    }

    /// The chunk mesh manager.
    pub fn mesh_manager(&self) -> &ChunkMeshManager {
        &self.mesh_manager
    }

    /// The shared staging ring.
    pub fn staging(&self) -> &StagingRing {
        &self.staging
    }

    /// The height-map cache.
    pub fn height_maps(&self) -> &HeightMapCache {
        &self.height_maps
    }
}
