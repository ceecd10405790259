//! Renderer-facing side of the streaming core.
//!
//! The renderer itself lives outside this crate. What it consumes is built
//! here: the packed quad buffer, the per-draw metadata buffer and the
//! indirect command buffer, all managed by [`meshing::ChunkMeshManager`].

pub mod meshing;
