//! # Voxel Task System
//!
//! Work that runs on the terrain worker pool. A single task type chains
//! terrain generation and meshing for one octree node.

pub mod chunk_generation_task;

pub use chunk_generation_task::{
    ChunkGenerationTask, GenerationResult, TaskOutcome, WorkerContext,
};
