//! # LOD Octree
//!
//! Decides which regions of space are represented at which level of detail
//! and schedules generation work for them.
//!
//! ## Layout
//!
//! Nodes live in one arena per depth and refer to each other by index. Depth
//! 0 is the root; a node at depth `d` spans `CS << (max_depth - d)` voxels per
//! axis and is meshed at LOD scale `1 << (max_depth - d)`, so every mesh is a
//! `CS³` chunk regardless of depth. Each visited node owns a [`ChunkState`] in
//! a generational arena; the state handle travels with the node's task and
//! identifies its result on return.
//!
//! ## Traversal
//!
//! [`LodOctree::update`] walks from the root whenever the camera enters a new
//! chunk-sized cell. A node splits when it is above the leaf depth and the
//! camera is strictly closer to its centre than `lod_bounds[depth]`;
//! otherwise it is a leaf, and a leaf that was split is coarsened. Splitting
//! releases the node's own mesh before the children are visited, so any
//! root-to-leaf path holds at most one mesh, at a node without children.
//!
//! Released meshes are pushed to the caller's list rather than freed here;
//! the octree never touches GPU state.

pub mod chunk_state;
pub mod node;

use std::collections::VecDeque;

use cgmath::{MetricSpace, Point3};
use log::debug;

use crate::config::OctreeConfig;
use crate::core::{Handle, SlotArena};
use crate::engine_state::buffer_state::free_list::AllocationHandle;
use crate::engine_state::voxels::chunk::CS;

pub use chunk_state::{ChunkFlags, ChunkState, ChunkStatus};
pub use node::{DepthLevel, NodeRef, OctreeNode, NO_NODE};

use node::child_offset;

/// Work order for one node, produced by [`LodOctree::next_dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Target node.
    pub node: NodeRef,
    /// Ticket the result must carry to be accepted.
    pub ticket: u64,
    /// Minimum corner in world voxels.
    pub origin: [i32; 3],
    /// World voxels per chunk voxel.
    pub scale: u32,
}

/// Snapshot of one live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Depth level.
    pub depth: u8,
    /// Index within the level.
    pub index: u32,
    /// Minimum corner in world voxels.
    pub min: [i32; 3],
    /// Edge length in world voxels.
    pub size: i32,
    /// Lifecycle state.
    pub status: ChunkStatus,
    /// Owned quad allocation.
    pub mesh_handle: Option<AllocationHandle>,
    /// Live-children bits.
    pub presence_mask: u8,
    /// Parent index one level up.
    pub parent: Option<u32>,
}

/// Sparse LOD octree with per-node generation state.
pub struct LodOctree {
    levels: Vec<DepthLevel>,
    states: SlotArena<ChunkState>,
    pending: VecDeque<NodeRef>,
    lod_bounds: Vec<f32>,
    root_origin: [i32; 3],
    max_depth: u8,
    last_camera_cell: Option<[i32; 3]>,
    next_ticket: u64,
    root: u32,
}

impl LodOctree {
    /// Creates a tree holding only an unpopulated root.
    pub fn new(config: &OctreeConfig) -> Self {
        let max_depth = config.max_depth;
        let lod_bounds = (0..=max_depth)
            .map(|depth| config.lod_distance_factor * Self::size_at(max_depth, depth) as f32)
            .collect();

        let mut levels: Vec<DepthLevel> = (0..=max_depth).map(|_| DepthLevel::default()).collect();
        let root_origin = config.root_origin();
        let root = levels[0].allocate(root_origin, NO_NODE);

        Self {
            levels,
            states: SlotArena::new(),
            pending: VecDeque::new(),
            lod_bounds,
            root_origin,
            max_depth,
            last_camera_cell: None,
            next_ticket: 0,
            root,
        }
    }

    fn size_at(max_depth: u8, depth: u8) -> i32 {
        (CS as i32) << (max_depth - depth)
    }

    /// Edge length of a node at `depth`, in world voxels.
    pub fn node_size(&self, depth: u8) -> i32 {
        Self::size_at(self.max_depth, depth)
    }

    /// LOD scale of a node at `depth`.
    pub fn lod_scale(&self, depth: u8) -> u32 {
        1 << (self.max_depth - depth)
    }

    /// Split distance per depth.
    pub fn lod_bounds(&self) -> &[f32] {
        &self.lod_bounds
    }

    /// Leaf depth.
    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    /// Re-evaluates LOD for a camera position.
    ///
    /// Meshes released by splits and coarsening are appended to `freed`.
    ///
    /// # Returns
    /// `false` when the camera is still in the cell of the previous traversal
    /// and nothing was evaluated.
    pub fn update(&mut self, camera: Point3<f32>, freed: &mut Vec<AllocationHandle>) -> bool {
        let cs = CS as f32;
        let cell = [
            (camera.x / cs).floor() as i32,
            (camera.y / cs).floor() as i32,
            (camera.z / cs).floor() as i32,
        ];
        if self.last_camera_cell == Some(cell) {
            return false;
        }
        self.last_camera_cell = Some(cell);

        let queued = self.pending.len();
        self.visit(0, self.root, camera, freed);
        debug!(
            "Octree traversal for cell {cell:?}: {} nodes, {} newly queued, {} freed meshes",
            self.node_count(),
            self.pending.len().saturating_sub(queued),
            freed.len()
        );
        true
    }

    /// Forces the next [`Self::update`] to traverse.
    pub fn invalidate(&mut self) {
        self.last_camera_cell = None;
    }

    fn visit(&mut self, depth: u8, index: u32, camera: Point3<f32>, freed: &mut Vec<AllocationHandle>) {
        let Some(min) = self.levels[depth as usize].get(index).map(|n| n.min) else {
            return;
        };
        let state = self.populate(depth, index);

        let size = self.node_size(depth);
        let half = size as f32 * 0.5;
        let centre = Point3::new(min[0] as f32 + half, min[1] as f32 + half, min[2] as f32 + half);
        let wants_split =
            depth < self.max_depth && camera.distance(centre) < self.lod_bounds[depth as usize];

        if wants_split {
            self.split(depth, index, state, freed);
            let children = match self.levels[depth as usize].get(index) {
                Some(node) => node.children,
                None => return,
            };
            for child in children {
                if child != NO_NODE {
                    self.visit(depth + 1, child, camera, freed);
                }
            }
            return;
        }

        let status = self.states.get(state).map(|s| s.status);
        match status {
            Some(ChunkStatus::Split) => self.coarsen(depth, index, state, freed),
            Some(ChunkStatus::Unpopulated) => self.schedule(depth, index, state),
            _ => {}
        }
    }

    /// Chunk state of a node, creating it on first visit.
    fn populate(&mut self, depth: u8, index: u32) -> Handle<ChunkState> {
        let existing = self.levels[depth as usize]
            .get(index)
            .and_then(|n| n.chunk_state)
            .filter(|h| self.states.contains(*h));
        if let Some(handle) = existing {
            return handle;
        }
        let handle = self.states.insert(ChunkState::new());
        if let Some(node) = self.levels[depth as usize].get_mut(index) {
            node.chunk_state = Some(handle);
        }
        handle
    }

    fn schedule(&mut self, depth: u8, index: u32, state: Handle<ChunkState>) {
        if let Some(chunk) = self.states.get_mut(state) {
            chunk.status = ChunkStatus::PendingGeneration;
            // A task dispatched before a split may still be running; its
            // ticket is superseded on the next dispatch.
            chunk.flags.remove(ChunkFlags::IN_FLIGHT);
            chunk.flags.insert(ChunkFlags::NEEDS_GEN_OR_MESHING);
            self.pending.push_back(NodeRef { depth, index, state });
        }
    }

    fn split(
        &mut self,
        depth: u8,
        index: u32,
        state: Handle<ChunkState>,
        freed: &mut Vec<AllocationHandle>,
    ) {
        if let Some(chunk) = self.states.get_mut(state) {
            if chunk.status == ChunkStatus::Split {
                return;
            }
            if let Some(mesh) = chunk.mesh_handle.take() {
                freed.push(mesh);
            }
            chunk.status = ChunkStatus::Split;
            chunk.flags.remove(ChunkFlags::NEEDS_GEN_OR_MESHING);
            chunk.flags.remove(ChunkFlags::IN_FLIGHT);
        }

        let Some(node) = self.levels[depth as usize].get(index) else {
            return;
        };
        let (min, presence) = (node.min, node.presence_mask);
        let child_size = self.node_size(depth + 1);
        for i in 0..8 {
            if presence & (1 << i) != 0 {
                continue;
            }
            let offset = child_offset(i);
            let child_min = [
                min[0] + offset[0] * child_size,
                min[1] + offset[1] * child_size,
                min[2] + offset[2] * child_size,
            ];
            let child = self.levels[depth as usize + 1].allocate(child_min, index);
            if let Some(node) = self.levels[depth as usize].get_mut(index) {
                node.children[i] = child;
                node.presence_mask |= 1 << i;
            }
        }
    }

    fn coarsen(
        &mut self,
        depth: u8,
        index: u32,
        state: Handle<ChunkState>,
        freed: &mut Vec<AllocationHandle>,
    ) {
        let children = match self.levels[depth as usize].get_mut(index) {
            Some(node) => {
                let children = node.children;
                node.children = [NO_NODE; 8];
                node.presence_mask = 0;
                children
            }
            None => return,
        };
        for child in children {
            if child != NO_NODE {
                self.free_subtree(depth + 1, child, freed);
            }
        }

        let known_empty = self.states.get(state).is_some_and(|s| s.is_known_empty());
        if known_empty {
            if let Some(chunk) = self.states.get_mut(state) {
                chunk.status = ChunkStatus::EmptyLeaf;
            }
        } else {
            self.schedule(depth, index, state);
        }
    }

    fn free_subtree(&mut self, depth: u8, index: u32, freed: &mut Vec<AllocationHandle>) {
        let Some(node) = self.levels[depth as usize].get(index) else {
            return;
        };
        let (children, state) = (node.children, node.chunk_state);
        for child in children {
            if child != NO_NODE {
                self.free_subtree(depth + 1, child, freed);
            }
        }
        if let Some(mesh) = state
            .and_then(|h| self.states.remove(h))
            .and_then(|s| s.mesh_handle)
        {
            freed.push(mesh);
        }
        self.levels[depth as usize].release(index);
    }

    /// Takes the next node waiting for generation and marks it in flight.
    pub fn next_dispatch(&mut self) -> Option<GenerationRequest> {
        while let Some(node) = self.pending.pop_front() {
            let Some(min) = self.resolve(node).map(|n| n.min) else {
                continue;
            };
            let Some(chunk) = self.states.get_mut(node.state) else {
                continue;
            };
            // Duplicate queue entries find the request already taken.
            if !chunk.wants_dispatch() {
                continue;
            }
            self.next_ticket += 1;
            chunk.ticket = self.next_ticket;
            chunk.flags.remove(ChunkFlags::NEEDS_GEN_OR_MESHING);
            chunk.flags.insert(ChunkFlags::IN_FLIGHT);
            return Some(GenerationRequest {
                node,
                ticket: self.next_ticket,
                origin: min,
                scale: self.lod_scale(node.depth),
            });
        }
        None
    }

    /// Puts a request back in the queue after a worker gave up on it.
    pub fn requeue(&mut self, node: NodeRef, ticket: u64) {
        if !self.accept(node, ticket) {
            return;
        }
        if let Some(chunk) = self.states.get_mut(node.state) {
            chunk.flags.remove(ChunkFlags::IN_FLIGHT);
            chunk.flags.insert(ChunkFlags::NEEDS_GEN_OR_MESHING);
            self.pending.push_back(node);
        }
    }

    /// Whether a task result still applies to its node.
    pub fn accept(&self, node: NodeRef, ticket: u64) -> bool {
        if self.resolve(node).is_none() {
            return false;
        }
        self.states.get(node.state).is_some_and(|s| {
            s.status == ChunkStatus::PendingGeneration
                && s.flags.contains(ChunkFlags::IN_FLIGHT)
                && s.ticket == ticket
        })
    }

    /// Records a generation that produced nothing to draw.
    pub fn mark_empty(&mut self, node: NodeRef, num_solid_voxels: u32) {
        if let Some(chunk) = self.states.get_mut(node.state) {
            chunk.num_solid_voxels = num_solid_voxels;
            chunk.flags = ChunkFlags::GENERATED_EMPTY;
            chunk.status = ChunkStatus::EmptyLeaf;
        }
    }

    /// Records a generation whose mesh is about to be uploaded.
    pub fn begin_upload(&mut self, node: NodeRef, num_solid_voxels: u32) {
        if let Some(chunk) = self.states.get_mut(node.state) {
            chunk.num_solid_voxels = num_solid_voxels;
            chunk.flags = ChunkFlags::empty();
            chunk.status = ChunkStatus::PendingMesh;
        }
    }

    /// Completes an upload begun with [`Self::begin_upload`].
    ///
    /// # Returns
    /// `false` when the node no longer waits for this mesh; the caller still
    /// owns the handle and must free it.
    pub fn assign_mesh(&mut self, node: NodeRef, mesh: Option<AllocationHandle>) -> bool {
        if self.resolve(node).is_none() {
            return false;
        }
        match self.states.get_mut(node.state) {
            Some(chunk) if chunk.status == ChunkStatus::PendingMesh => {
                chunk.status = if mesh.is_some() {
                    ChunkStatus::MeshedLeaf
                } else {
                    chunk.flags.insert(ChunkFlags::GENERATED_EMPTY);
                    ChunkStatus::EmptyLeaf
                };
                chunk.mesh_handle = mesh;
                true
            }
            _ => false,
        }
    }

    /// Drops every node but an unpopulated root.
    ///
    /// Every mesh still owned is appended to `freed`.
    pub fn reset(&mut self, freed: &mut Vec<AllocationHandle>) {
        freed.extend(self.states.iter().filter_map(|(_, s)| s.mesh_handle));
        self.states.clear();
        for level in &mut self.levels {
            level.clear();
        }
        self.pending.clear();
        self.root = self.levels[0].allocate(self.root_origin, NO_NODE);
        self.last_camera_cell = None;
    }

    fn resolve(&self, node: NodeRef) -> Option<&OctreeNode> {
        self.levels
            .get(node.depth as usize)?
            .get(node.index)
            .filter(|n| n.chunk_state == Some(node.state))
    }

    /// State of the node a reference names, if the reference is current.
    pub fn chunk_state(&self, node: NodeRef) -> Option<&ChunkState> {
        self.resolve(node)?;
        self.states.get(node.state)
    }

    /// Snapshot of every live node, root first, then by depth.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut out = Vec::with_capacity(self.node_count());
        for (depth, level) in self.levels.iter().enumerate() {
            let depth = depth as u8;
            for (index, node) in level.iter() {
                let state = node.chunk_state.and_then(|h| self.states.get(h));
                out.push(NodeInfo {
                    depth,
                    index,
                    min: node.min,
                    size: self.node_size(depth),
                    status: state.map_or(ChunkStatus::Unpopulated, |s| s.status),
                    mesh_handle: state.and_then(|s| s.mesh_handle),
                    presence_mask: node.presence_mask,
                    parent: (node.parent != NO_NODE).then_some(node.parent),
                });
            }
        }
        out
    }

    /// Live nodes across all depths.
    pub fn node_count(&self) -> usize {
        self.levels.iter().map(DepthLevel::len).sum()
    }

    /// Live chunk states.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Queue entries waiting for dispatch, including ones that will be skipped.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn octree(max_depth: u8, factor: f32) -> LodOctree {
        LodOctree::new(&OctreeConfig {
            max_depth,
            lod_distance_factor: factor,
            origin: Some([0, 0, 0]),
        })
    }

    fn fake_handle(n: u32) -> AllocationHandle {
        let mut allocator = crate::engine_state::buffer_state::free_list::FreeListAllocator::<()>::new(64, 1);
        let mut last = None;
        for _ in 0..n {
            last = allocator.allocate(1, ()).ok();
        }
        last.unwrap()
    }

    fn drain_requests(tree: &mut LodOctree) -> Vec<GenerationRequest> {
        std::iter::from_fn(|| tree.next_dispatch()).collect()
    }

    #[test]
    fn bounds_double_per_level() {
        let tree = octree(3, 1.5);
        let bounds = tree.lod_bounds();
        assert_eq!(bounds[3], 1.5 * 62.0);
        assert_eq!(bounds[2], 2.0 * bounds[3]);
        assert_eq!(bounds[0], 8.0 * bounds[3]);
        assert_eq!(tree.node_size(0), 496);
        assert_eq!(tree.lod_scale(0), 8);
    }

    #[test]
    fn far_camera_keeps_root_as_leaf() {
        let mut tree = octree(2, 1.0);
        let mut freed = Vec::new();
        assert!(tree.update(Point3::new(10_000.0, 0.0, 0.0), &mut freed));
        assert_eq!(tree.node_count(), 1);

        let requests = drain_requests(&mut tree);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].origin, [0, 0, 0]);
        assert_eq!(requests[0].scale, 4);
    }

    #[test]
    fn unchanged_cell_skips_traversal() {
        let mut tree = octree(1, 2.0);
        let mut freed = Vec::new();
        assert!(tree.update(Point3::new(1.0, 1.0, 1.0), &mut freed));
        assert!(!tree.update(Point3::new(2.0, 3.0, 4.0), &mut freed));
        tree.invalidate();
        assert!(tree.update(Point3::new(2.0, 3.0, 4.0), &mut freed));
    }

    #[test]
    fn near_camera_splits_in_fixed_order() {
        let mut tree = octree(1, 2.0);
        let mut freed = Vec::new();
        tree.update(Point3::new(62.0, 20.0, 62.0), &mut freed);
        assert_eq!(tree.node_count(), 9);

        let origins: Vec<_> = drain_requests(&mut tree).iter().map(|r| r.origin).collect();
        assert_eq!(
            origins,
            vec![
                [0, 0, 0],
                [62, 0, 0],
                [0, 0, 62],
                [62, 0, 62],
                [0, 62, 0],
                [62, 62, 0],
                [0, 62, 62],
                [62, 62, 62],
            ]
        );
    }

    #[test]
    fn stale_tickets_are_rejected() {
        let mut tree = octree(0, 1.0);
        let mut freed = Vec::new();
        tree.update(Point3::new(0.0, 0.0, 0.0), &mut freed);
        let request = tree.next_dispatch().unwrap();
        assert!(tree.accept(request.node, request.ticket));
        assert!(!tree.accept(request.node, request.ticket + 1));

        tree.requeue(request.node, request.ticket);
        let again = tree.next_dispatch().unwrap();
        assert!(!tree.accept(request.node, request.ticket));
        assert!(tree.accept(again.node, again.ticket));
    }

    #[test]
    fn split_releases_own_mesh_and_coarsen_frees_children() {
        let mut tree = octree(1, 2.0);
        let mut freed = Vec::new();

        // Far away: the root is a leaf and gets a mesh.
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);
        let root = tree.next_dispatch().unwrap();
        tree.begin_upload(root.node, 100);
        let root_mesh = fake_handle(1);
        assert!(tree.assign_mesh(root.node, Some(root_mesh)));

        // Close: the root splits and hands back its mesh.
        tree.update(Point3::new(62.0, 20.0, 62.0), &mut freed);
        assert_eq!(freed, vec![root_mesh]);
        freed.clear();
        let child = tree.next_dispatch().unwrap();
        tree.begin_upload(child.node, 10);
        let child_mesh = fake_handle(2);
        assert!(tree.assign_mesh(child.node, Some(child_mesh)));
        // A result for a child that was dispatched but not yet finished.
        let in_flight = tree.next_dispatch().unwrap();

        // Far again: children are freed, root regenerates.
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);
        assert_eq!(freed, vec![child_mesh]);
        assert_eq!(tree.node_count(), 1);
        assert!(!tree.accept(in_flight.node, in_flight.ticket));
        assert!(tree.chunk_state(child.node).is_none());

        let root_again = tree.next_dispatch().unwrap();
        assert_eq!(root_again.node, root.node);
        assert_eq!(root_again.scale, 2);
    }

    #[test]
    fn known_empty_node_coarsens_to_empty_leaf() {
        let mut tree = octree(1, 2.0);
        let mut freed = Vec::new();
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);
        let root = tree.next_dispatch().unwrap();
        tree.mark_empty(root.node, 0);

        tree.update(Point3::new(62.0, 20.0, 62.0), &mut freed);
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);

        let info = tree.nodes();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].status, ChunkStatus::EmptyLeaf);
        assert!(drain_requests(&mut tree)
            .iter()
            .all(|r| r.node != root.node));
    }

    #[test]
    fn faceless_solid_node_is_not_regenerated_after_coarsening() {
        let mut tree = octree(1, 2.0);
        let mut freed = Vec::new();
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);
        let root = tree.next_dispatch().unwrap();
        tree.mark_empty(root.node, 62 * 62 * 62);

        tree.update(Point3::new(62.0, 20.0, 62.0), &mut freed);
        assert_eq!(drain_requests(&mut tree).len(), 8);
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);

        let info = tree.nodes();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].status, ChunkStatus::EmptyLeaf);
        assert!(drain_requests(&mut tree).is_empty());
    }

    #[test]
    fn duplicate_queue_entries_dispatch_once() {
        let mut tree = octree(1, 2.0);
        let mut freed = Vec::new();
        // Root queued, split before dispatch, then queued again on coarsen.
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);
        tree.update(Point3::new(62.0, 20.0, 62.0), &mut freed);
        tree.update(Point3::new(5000.0, 0.0, 0.0), &mut freed);
        assert!(tree.pending_count() > 1);

        let requests = drain_requests(&mut tree);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].scale, 2);
        let state = tree.chunk_state(requests[0].node).unwrap();
        assert!(state.flags.contains(ChunkFlags::IN_FLIGHT));
        assert!(!state.flags.contains(ChunkFlags::NEEDS_GEN_OR_MESHING));
    }

    #[test]
    fn reset_leaves_single_root() {
        let mut tree = octree(2, 2.0);
        let mut freed = Vec::new();
        tree.update(Point3::new(10.0, 10.0, 10.0), &mut freed);
        let request = tree.next_dispatch().unwrap();
        tree.begin_upload(request.node, 1);
        let mesh = fake_handle(1);
        tree.assign_mesh(request.node, Some(mesh));

        freed.clear();
        tree.reset(&mut freed);
        assert_eq!(freed, vec![mesh]);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.state_count(), 0);
        assert_eq!(tree.pending_count(), 0);
        assert_eq!(tree.nodes()[0].status, ChunkStatus::Unpopulated);
        assert!(!tree.accept(request.node, request.ticket));
    }
}
