//! Mesh generation algorithms and the packed quad format they emit.

pub mod greedy;
pub mod quad;

pub use greedy::{generate_mesh, MeshData, MeshScratch};
pub use quad::{pack_quad, Quad, QUAD_SIZE};
