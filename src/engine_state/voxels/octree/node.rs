//! Octree nodes and their per-depth storage.

use crate::core::Handle;

use super::chunk_state::ChunkState;

/// Empty child slot.
pub const NO_NODE: u32 = u32::MAX;

/// Offset of child `i` in units of the child size. Children are numbered
/// `x + 2 * z + 4 * y`, so ascending order visits y, then z, then x.
#[inline]
pub const fn child_offset(i: usize) -> [i32; 3] {
    [(i & 1) as i32, ((i >> 2) & 1) as i32, ((i >> 1) & 1) as i32]
}

/// One node of the LOD octree.
#[derive(Debug, Clone)]
pub struct OctreeNode {
    /// Child indices one level deeper, [`NO_NODE`] when absent.
    pub children: [u32; 8],
    /// Bit `i` set when `children[i]` is a live node.
    pub presence_mask: u8,
    /// Generation state. `None` until the node is first visited.
    pub chunk_state: Option<Handle<ChunkState>>,
    /// Minimum corner in world voxels.
    pub min: [i32; 3],
    /// Parent index one level up, [`NO_NODE`] for the root.
    pub parent: u32,
    live: bool,
}

impl OctreeNode {
    fn new(min: [i32; 3], parent: u32) -> Self {
        Self {
            children: [NO_NODE; 8],
            presence_mask: 0,
            chunk_state: None,
            min,
            parent,
            live: true,
        }
    }

    /// Whether the slot holds a node.
    pub fn is_live(&self) -> bool {
        self.live
    }
}

/// Arena of the nodes at one depth, reusing freed slots.
#[derive(Debug, Default)]
pub struct DepthLevel {
    nodes: Vec<OctreeNode>,
    free: Vec<u32>,
}

impl DepthLevel {
    /// Allocates a node slot.
    pub fn allocate(&mut self, min: [i32; 3], parent: u32) -> u32 {
        let node = OctreeNode::new(min, parent);
        match self.free.pop() {
            Some(index) => {
                self.nodes[index as usize] = node;
                index
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    /// Returns a slot to the free list.
    pub fn release(&mut self, index: u32) {
        if let Some(node) = self.nodes.get_mut(index as usize) {
            if node.live {
                node.live = false;
                node.chunk_state = None;
                node.children = [NO_NODE; 8];
                node.presence_mask = 0;
                self.free.push(index);
            }
        }
    }

    /// A live node.
    pub fn get(&self, index: u32) -> Option<&OctreeNode> {
        self.nodes.get(index as usize).filter(|n| n.live)
    }

    /// A live node, mutably.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut OctreeNode> {
        self.nodes.get_mut(index as usize).filter(|n| n.live)
    }

    /// Live nodes with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &OctreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.live)
            .map(|(i, n)| (i as u32, n))
    }

    /// Live node count.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Whether no node is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
    }
}

/// Identity of a node as carried by a task: position in the tree plus the
/// chunk state it had at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    /// Depth level.
    pub depth: u8,
    /// Index within the level.
    pub index: u32,
    /// State handle at dispatch.
    pub state: Handle<ChunkState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_order_is_y_then_z_then_x() {
        assert_eq!(child_offset(0), [0, 0, 0]);
        assert_eq!(child_offset(1), [1, 0, 0]);
        assert_eq!(child_offset(2), [0, 0, 1]);
        assert_eq!(child_offset(4), [0, 1, 0]);
        assert_eq!(child_offset(7), [1, 1, 1]);
    }

    #[test]
    fn released_slots_are_reused() {
        let mut level = DepthLevel::default();
        let a = level.allocate([0, 0, 0], NO_NODE);
        let b = level.allocate([1, 0, 0], NO_NODE);
        level.release(a);
        level.release(a);
        assert_eq!(level.len(), 1);
        assert!(level.get(a).is_none());

        let c = level.allocate([2, 0, 0], NO_NODE);
        assert_eq!(c, a);
        assert_eq!(level.get(c).map(|n| n.min), Some([2, 0, 0]));
        assert_eq!(level.iter().count(), 2);
        assert!(level.get(b).is_some());
    }
}
