//! # Chunk Generation Task
//!
//! This module defines the `ChunkGenerationTask` which turns one octree node
//! into staged mesh bytes on a worker thread. The work runs as two sequential
//! stages inside one task, so the scratch buffers each stage checks out have
//! a single owner:
//!
//! 1. **Terrain**: fill a pooled chunk grid from the height-map cache.
//! 2. **Meshing**: run the greedy mesher into pooled scratch and copy the
//!    resulting quads into the shared staging ring.
//!
//! Nothing here touches the octree or the GPU allocators. The outcome names
//! its node by [`NodeRef`] and ticket, and the main thread decides whether it
//! still applies.

use std::sync::Arc;

use log::{debug, warn};

use crate::core::{ObjectPool, PoolMode};
use crate::engine_state::buffer_state::staging_ring::StagingRing;
use crate::engine_state::rendering::meshing::{generate_mesh, MeshData, MeshScratch, MeshUpload};
use crate::engine_state::task_management::task::Task;
use crate::engine_state::voxels::chunk::Chunk;
use crate::engine_state::voxels::octree::{GenerationRequest, NodeRef};
use crate::engine_state::voxels::terrain::TerrainGenerator;
use crate::error::StagingError;

/// Shared, thread-safe state every generation task works against.
pub struct WorkerContext {
    /// Terrain source, including the height-map cache.
    pub terrain: TerrainGenerator,
    /// Padded voxel grids, one per task in flight.
    pub chunks: Arc<ObjectPool<Chunk>>,
    /// Mesher scratch.
    pub scratch: Arc<ObjectPool<MeshScratch>>,
    /// Mesher output buffers.
    pub meshes: Arc<ObjectPool<MeshData>>,
    /// Destination of finished quads.
    pub staging: Arc<StagingRing>,
}

impl WorkerContext {
    /// Builds the context with pools sized for `max_in_flight` tasks.
    pub fn new(terrain: TerrainGenerator, staging: Arc<StagingRing>, max_in_flight: usize) -> Self {
        Self {
            terrain,
            chunks: ObjectPool::new(PoolMode::Fixed(max_in_flight), Chunk::new),
            scratch: ObjectPool::new(PoolMode::Growable, MeshScratch::new),
            meshes: ObjectPool::new(PoolMode::Growable, MeshData::new),
            staging,
        }
    }
}

/// What a generation task produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    /// The chunk has no solid voxels; meshing was skipped.
    TerrainEmpty,
    /// The chunk is solid but every face is hidden.
    MeshEmpty {
        /// Solid voxels in the logical region.
        num_solid: u32,
    },
    /// Quads were staged for upload.
    Mesh(MeshUpload),
    /// A transient shortage; dispatch the node again later.
    Retry,
    /// The node cannot be meshed.
    Failed,
}

/// Result delivered to the main thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Target node.
    pub node: NodeRef,
    /// Ticket issued at dispatch.
    pub ticket: u64,
    /// What the task produced.
    pub result: GenerationResult,
}

/// Generates and meshes the chunk of one octree node.
pub struct ChunkGenerationTask {
    request: GenerationRequest,
    context: Arc<WorkerContext>,
}

impl ChunkGenerationTask {
    /// Creates a task for a dispatched node.
    ///
    /// # Arguments
    /// * `request` - the node, its ticket, minimum corner and LOD scale
    /// * `context` - pools, terrain source and staging ring
    pub fn new(request: GenerationRequest, context: Arc<WorkerContext>) -> Self {
        Self { request, context }
    }

    fn run(&self) -> GenerationResult {
        let mut chunk = match self.context.chunks.acquire() {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!("Deferring node {:?}: {err}", self.request.node);
                return GenerationResult::Retry;
            }
        };

        let terrain = match self
            .context
            .terrain
            .generate(&mut chunk, self.request.origin, self.request.scale)
        {
            Ok(terrain) => terrain,
            Err(err) => {
                debug!("Deferring node {:?}: {err}", self.request.node);
                return GenerationResult::Retry;
            }
        };
        if terrain.num_solid_voxels == 0 {
            return GenerationResult::TerrainEmpty;
        }
        if terrain.fully_solid {
            // Halo included, so no face can be visible.
            return GenerationResult::MeshEmpty {
                num_solid: terrain.num_solid_voxels,
            };
        }

        self.mesh_chunk(&chunk, terrain.num_solid_voxels)
    }

    fn mesh_chunk(&self, chunk: &Chunk, num_solid: u32) -> GenerationResult {
        let (mut scratch, mut mesh) = match (self.context.scratch.acquire(), self.context.meshes.acquire()) {
            (Ok(scratch), Ok(mesh)) => (scratch, mesh),
            _ => return GenerationResult::Retry,
        };

        let quad_count = generate_mesh(&chunk.voxels, &chunk.opaque_mask, &mut scratch, &mut mesh);
        if quad_count == 0 {
            return GenerationResult::MeshEmpty { num_solid };
        }

        let bytes: &[u8] = bytemuck::cast_slice(mesh.quads());
        match self.context.staging.copy(bytes) {
            Ok(staging_copy_handle) => GenerationResult::Mesh(MeshUpload {
                position: self.request.origin,
                lod_scale: self.request.scale,
                face_counts: mesh.face_count,
                quad_count: quad_count as u32,
                num_solid,
                staging_copy_handle,
            }),
            Err(StagingError::Exhausted { requested }) => {
                debug!(
                    "Staging ring full ({requested} bytes wanted), deferring node {:?}",
                    self.request.node
                );
                GenerationResult::Retry
            }
            Err(err) => {
                warn!("Dropping mesh of node {:?}: {err}", self.request.node);
                GenerationResult::Failed
            }
        }
    }
}

impl Task for ChunkGenerationTask {
    type Output = TaskOutcome;

    fn process(self) -> TaskOutcome {
        let result = self.run();
        TaskOutcome {
            node: self.request.node,
            ticket: self.request.ticket,
            result,
        }
    }

    fn panic_output(&self) -> TaskOutcome {
        TaskOutcome {
            node: self.request.node,
            ticket: self.request.ticket,
            result: GenerationResult::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use cgmath::Point3;

    use super::*;
    use crate::config::OctreeConfig;
    use crate::engine_state::buffer_state::{StagingBuffer, StagingBufferId, StagingMemory};
    use crate::engine_state::rendering::meshing::Quad;
    use crate::engine_state::voxels::height_map::{FlatHeightField, HeightMapCache};
    use crate::engine_state::voxels::octree::LodOctree;
    use crate::engine_state::voxels::voxel_type::VoxelType;

    fn context(height: i32, ring_bytes: usize, max_in_flight: usize) -> Arc<WorkerContext> {
        let cache = HeightMapCache::new(
            Box::new(FlatHeightField { height }),
            Duration::from_secs(1),
            NonZeroUsize::new(8).unwrap(),
        );
        let ring = StagingRing::new(StagingBuffer {
            id: StagingBufferId(1),
            memory: Arc::new(StagingMemory::new(ring_bytes)),
        });
        Arc::new(WorkerContext::new(
            TerrainGenerator::new(Arc::new(cache)),
            Arc::new(ring),
            max_in_flight,
        ))
    }

    fn request_at(origin_y: i32) -> GenerationRequest {
        let mut tree = LodOctree::new(&OctreeConfig {
            max_depth: 0,
            lod_distance_factor: 1.0,
            origin: Some([0, origin_y, 0]),
        });
        tree.update(Point3::new(0.0, 0.0, 0.0), &mut Vec::new());
        tree.next_dispatch().unwrap()
    }

    #[test]
    fn flat_ground_is_staged_as_one_top_quad_per_face() {
        let context = context(10, 1 << 20, 1);
        let request = request_at(0);
        let outcome = ChunkGenerationTask::new(request, Arc::clone(&context)).process();

        assert_eq!(outcome.node, request.node);
        let GenerationResult::Mesh(upload) = outcome.result else {
            panic!("expected a mesh, got {:?}", outcome.result);
        };
        assert_eq!(upload.num_solid, (62 * 62 * 10) as u32);
        assert_eq!(upload.position, [0, 0, 0]);
        // The halo hides the sides and the bottom; the top merges into one quad.
        assert_eq!(upload.quad_count, 1);
        assert_eq!(context.staging.live_copies(), 1);

        let block = context.staging.get_block(upload.staging_copy_handle).unwrap();
        let bytes = unsafe { context.staging.memory().read(block.offset, block.size).unwrap() };
        let word = u64::from_ne_bytes(bytes.try_into().unwrap());
        let quad = Quad::unpack(word);
        assert_eq!((quad.width, quad.height), (62, 62));
        assert_eq!(quad.voxel_type, VoxelType::Grass as u32);

        // Every pooled object was handed back.
        assert_eq!(context.chunks.available(), 1);
        assert_eq!(context.meshes.checked_out(), 0);
    }

    #[test]
    fn empty_and_buried_chunks_skip_upload() {
        let context = context(10, 1 << 20, 1);
        let sky = ChunkGenerationTask::new(request_at(100), Arc::clone(&context)).process();
        assert_eq!(sky.result, GenerationResult::TerrainEmpty);

        let buried = ChunkGenerationTask::new(request_at(-200), Arc::clone(&context)).process();
        assert_eq!(
            buried.result,
            GenerationResult::MeshEmpty {
                num_solid: 62 * 62 * 62
            }
        );
        assert_eq!(context.staging.live_copies(), 0);
    }

    #[test]
    fn exhausted_pools_and_ring_ask_for_retry() {
        let context = context(10, 8, 1);
        let held = context.chunks.acquire().unwrap();
        let outcome = ChunkGenerationTask::new(request_at(0), Arc::clone(&context)).process();
        assert_eq!(outcome.result, GenerationResult::Retry);
        drop(held);

        let first = ChunkGenerationTask::new(request_at(0), Arc::clone(&context)).process();
        assert!(matches!(first.result, GenerationResult::Mesh(_)));
        let second = ChunkGenerationTask::new(request_at(0), Arc::clone(&context)).process();
        assert_eq!(second.result, GenerationResult::Retry);
    }

    #[test]
    fn exhausted_height_pool_asks_for_retry() {
        let cache = Arc::new(HeightMapCache::with_pool_mode(
            Box::new(FlatHeightField { height: 10 }),
            Duration::from_secs(60),
            NonZeroUsize::new(8).unwrap(),
            crate::core::PoolMode::Fixed(0),
        ));
        let ring = StagingRing::new(StagingBuffer {
            id: StagingBufferId(1),
            memory: Arc::new(StagingMemory::new(1 << 16)),
        });
        let context = Arc::new(WorkerContext::new(TerrainGenerator::new(cache), Arc::new(ring), 1));

        let outcome = ChunkGenerationTask::new(request_at(0), Arc::clone(&context)).process();
        assert_eq!(outcome.result, GenerationResult::Retry);
        assert_eq!(context.chunks.checked_out(), 0);
    }

    #[test]
    fn mesh_larger_than_ring_fails() {
        let context = context(10, 4, 1);
        let outcome = ChunkGenerationTask::new(request_at(0), context).process();
        assert_eq!(outcome.result, GenerationResult::Failed);
    }
}
