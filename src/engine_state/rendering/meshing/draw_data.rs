//! Per-draw records shared with the renderer.
//!
//! Every live chunk mesh owns one draw slot. Slot `i` indexes both the
//! metadata buffer (one [`ChunkDrawData`]) and the indirect buffer (one
//! `DrawIndirectArgs`), and the indirect command draws with
//! `first_instance = i` so the vertex shader can find its metadata from the
//! instance index. Freed slots are zeroed, which turns their command into a
//! no-op draw.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DrawIndirectArgs;

use super::mesh::QUAD_SIZE;

/// Vertices emitted per quad by the vertex-pulling shader.
pub const VERTICES_PER_QUAD: u32 = 6;

/// Metadata of one chunk draw, as laid out in the metadata buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ChunkDrawData {
    /// Minimum corner of the chunk in world voxels.
    pub position: [i32; 3],
    /// World voxels per chunk voxel.
    pub lod_scale: u32,
    /// Quads per face, in mesher face order.
    pub face_counts: [u32; 6],
    /// First quad in the quad buffer.
    pub quad_offset: u32,
    /// Quads in the mesh.
    pub quad_count: u32,
}

/// Size of one [`ChunkDrawData`] in bytes.
pub const DRAW_DATA_SIZE: u64 = std::mem::size_of::<ChunkDrawData>() as u64;

impl ChunkDrawData {
    /// Whether this slot is unused.
    pub fn is_stale(&self) -> bool {
        self.quad_count == 0
    }

    /// Indirect command drawing this record from `slot`.
    pub fn indirect_args(&self, slot: u32) -> DrawIndirectArgs {
        DrawIndirectArgs {
            vertex_count: self.quad_count * VERTICES_PER_QUAD,
            instance_count: u32::from(!self.is_stale()),
            first_vertex: self.quad_offset * VERTICES_PER_QUAD,
            first_instance: slot,
        }
    }

    /// Byte offset of the record's quads in the quad buffer.
    pub fn quad_byte_offset(&self) -> u64 {
        self.quad_offset as u64 * QUAD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_forty_eight_bytes() {
        assert_eq!(DRAW_DATA_SIZE, 48);
        assert_eq!(std::mem::align_of::<ChunkDrawData>(), 4);
    }

    #[test]
    fn stale_record_draws_nothing() {
        let args = ChunkDrawData::default().indirect_args(3);
        assert_eq!(args.vertex_count, 0);
        assert_eq!(args.instance_count, 0);
        assert_eq!(args.first_instance, 3);
    }

    #[test]
    fn live_record_points_at_its_quads() {
        let data = ChunkDrawData {
            quad_offset: 10,
            quad_count: 4,
            ..ChunkDrawData::default()
        };
        let args = data.indirect_args(1);
        assert_eq!(args.vertex_count, 24);
        assert_eq!(args.first_vertex, 60);
        assert_eq!(args.instance_count, 1);
        assert_eq!(data.quad_byte_offset(), 80);
    }
}
