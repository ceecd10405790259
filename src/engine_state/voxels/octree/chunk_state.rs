//! # Chunk State
//!
//! Per-node bookkeeping of the octree: lifecycle status, dirty bits, the
//! owned mesh allocation, and the ticket that identifies the latest dispatch.
//!
//! A node is dispatched only while it is `PendingGeneration` with
//! [`ChunkFlags::NEEDS_GEN_OR_MESHING`] set and [`ChunkFlags::IN_FLIGHT`]
//! clear. [`ChunkFlags::GENERATED_EMPTY`] survives splits, so a node that
//! once produced nothing to draw is not regenerated when it coarsens.

use crate::engine_state::buffer_state::free_list::AllocationHandle;

/// Where a node is in the generate, mesh, upload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkStatus {
    /// Never visited; no chunk state exists yet.
    Unpopulated,
    /// Waiting for, or running, terrain generation and meshing.
    PendingGeneration,
    /// A mesh was produced and is being uploaded.
    PendingMesh,
    /// Owns a mesh allocation.
    MeshedLeaf,
    /// Generated, nothing to draw.
    EmptyLeaf,
    /// Represented by its children.
    Split,
}

/// Dirty bits of a [`ChunkState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    /// Terrain has never been generated for this node.
    pub const TERRAIN_GEN_DIRTY: ChunkFlags = ChunkFlags(1 << 0);
    /// The node wants a generation task and has not been handed one.
    pub const NEEDS_GEN_OR_MESHING: ChunkFlags = ChunkFlags(1 << 1);
    /// A task for the node is on a worker.
    pub const IN_FLIGHT: ChunkFlags = ChunkFlags(1 << 2);
    /// Generation finished and produced nothing to draw.
    pub const GENERATED_EMPTY: ChunkFlags = ChunkFlags(1 << 3);

    /// No bits set.
    pub const fn empty() -> Self {
        ChunkFlags(0)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: ChunkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: ChunkFlags) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn remove(&mut self, other: ChunkFlags) {
        self.0 &= !other.0;
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Per-node generation state, owned by the octree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    /// Quad allocation owned by this node.
    pub mesh_handle: Option<AllocationHandle>,
    /// Solid voxels found by the last generation.
    pub num_solid_voxels: u32,
    /// Dirty bits.
    pub flags: ChunkFlags,
    /// Lifecycle state.
    pub status: ChunkStatus,
    /// Issued with each dispatch; results carrying an older ticket are stale.
    pub ticket: u64,
}

impl ChunkState {
    /// State of a freshly visited node.
    pub fn new() -> Self {
        let mut flags = ChunkFlags::empty();
        flags.insert(ChunkFlags::TERRAIN_GEN_DIRTY);
        Self {
            mesh_handle: None,
            num_solid_voxels: 0,
            flags,
            status: ChunkStatus::Unpopulated,
            ticket: 0,
        }
    }

    /// Terrain was generated and either held nothing or meshed to no quads.
    pub fn is_known_empty(&self) -> bool {
        !self.flags.contains(ChunkFlags::TERRAIN_GEN_DIRTY)
            && (self.num_solid_voxels == 0 || self.flags.contains(ChunkFlags::GENERATED_EMPTY))
    }

    /// Whether the dispatcher should hand this node a task.
    pub fn wants_dispatch(&self) -> bool {
        self.status == ChunkStatus::PendingGeneration
            && self.flags.contains(ChunkFlags::NEEDS_GEN_OR_MESHING)
            && !self.flags.contains(ChunkFlags::IN_FLIGHT)
    }
}

impl Default for ChunkState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_and_clear() {
        let mut flags = ChunkFlags::empty();
        flags.insert(ChunkFlags::IN_FLIGHT);
        flags.insert(ChunkFlags::NEEDS_GEN_OR_MESHING);
        assert!(flags.contains(ChunkFlags::IN_FLIGHT));
        flags.remove(ChunkFlags::IN_FLIGHT);
        assert!(!flags.contains(ChunkFlags::IN_FLIGHT));
        assert_eq!(flags, ChunkFlags::NEEDS_GEN_OR_MESHING);
    }

    #[test]
    fn new_state_is_not_known_empty() {
        let mut state = ChunkState::new();
        assert!(!state.is_known_empty());
        state.flags.remove(ChunkFlags::TERRAIN_GEN_DIRTY);
        assert!(state.is_known_empty());
    }

    #[test]
    fn solid_chunk_without_faces_is_known_empty() {
        let mut state = ChunkState::new();
        state.num_solid_voxels = 62 * 62 * 62;
        state.flags = ChunkFlags::empty();
        assert!(!state.is_known_empty());
        state.flags.insert(ChunkFlags::GENERATED_EMPTY);
        assert!(state.is_known_empty());
    }

    #[test]
    fn dispatch_needs_request_and_no_running_task() {
        let mut state = ChunkState::new();
        state.status = ChunkStatus::PendingGeneration;
        assert!(!state.wants_dispatch());
        state.flags.insert(ChunkFlags::NEEDS_GEN_OR_MESHING);
        assert!(state.wants_dispatch());
        state.flags.insert(ChunkFlags::IN_FLIGHT);
        assert!(!state.wants_dispatch());
    }
}
