//! # Voxel Terrain
//!
//! Everything between a camera position and a finished mesh in the staging
//! ring, short of the GPU side.
//!
//! ## Architecture
//!
//! * **Chunk**: the padded `PCS³` scratch grid terrain is written into
//! * **Height maps**: per-column surface heights, cached across chunks and LOD levels
//! * **Terrain**: fills a chunk from a height map at a given LOD scale
//! * **Octree**: decides which regions are meshed at which depth
//! * **Tasks**: the worker-side pipeline from octree node to staged quads
//!
//! ## Data Flow
//!
//! 1. The octree queues nodes that need a mesh
//! 2. A worker fetches the node's height map and fills a pooled chunk
//! 3. The same worker meshes the chunk and stages the quads
//! 4. The main thread checks the result's ticket and hands the quads to the mesh manager

pub mod chunk;
pub mod face;
pub mod height_map;
pub mod octree;
pub mod tasks;
pub mod terrain;
pub mod voxel_type;
