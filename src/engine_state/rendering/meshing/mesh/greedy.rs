//! Binary greedy meshing for voxel rendering.
//!
//! This module converts a padded voxel grid into merged, packed quads. It works
//! on bit columns instead of individual voxels: each `(x, z)` column of the
//! padded grid is one `u64` opacity mask, so face culling for a whole column is
//! a handful of shifts and ANDs.
//!
//! ## Algorithm
//!
//! 1. **Face masks**: for every logical column and each of the six directions,
//!    a face bit is set where the voxel is solid and its neighbour in that
//!    direction is not. Halo voxels never produce faces, but they do occlude.
//! 2. **Side faces (0-3)**: per depth layer, then per row, visible bits are
//!    merged forward into the next row when the type matches, otherwise merged
//!    right along the row while types and forward extents agree.
//! 3. **Vertical faces (4-5)**: per forward slice, then per right slice, with
//!    forward and right merge counts tracked in parallel scratch arrays.
//!
//! The mesher only writes into caller-owned buffers, so independent
//! `(voxels, scratch, out)` triples may be meshed concurrently.

use crate::engine_state::voxels::chunk::{column_index, voxel_index, CS, CS2, PCS, PCS2, PCS3};

use super::quad::pack_quad;

/// Quads reserved by a fresh [`MeshData`] and the floor for growth.
pub const INITIAL_QUAD_CAPACITY: usize = 4096;

const HALO_BITS: u64 = 1 | (1 << (PCS - 1));

/// Scratch state for one mesher invocation.
///
/// Sized once for the largest chunk the mesher accepts and reused across
/// invocations through an object pool.
pub struct MeshScratch {
    /// `CS² × 6` face visibility masks.
    face_masks: Box<[u64]>,
    /// Forward merge counts, one per `CS²` cell.
    forward_merged: Box<[u8]>,
    /// Right merge counts for the vertical faces, one per bit.
    right_merged: Box<[u8]>,
}

impl Default for MeshScratch {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshScratch {
    /// Allocates scratch for a `PCS³` grid.
    pub fn new() -> Self {
        Self {
            face_masks: vec![0; CS2 * 6].into_boxed_slice(),
            forward_merged: vec![0; CS2].into_boxed_slice(),
            right_merged: vec![0; CS].into_boxed_slice(),
        }
    }
}

/// Mesher output: packed quads grouped by face.
pub struct MeshData {
    /// Packed quad words. Only the first [`MeshData::quad_count`] are valid.
    pub quads: Vec<u64>,
    /// First quad of each face, in mesher face order.
    pub face_begin: [u32; 6],
    /// Quads emitted for each face.
    pub face_count: [u32; 6],
    /// Valid quads in `quads`.
    pub quad_count: usize,
}

impl Default for MeshData {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshData {
    /// Allocates an output buffer with [`INITIAL_QUAD_CAPACITY`] quads.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_QUAD_CAPACITY)
    }

    /// Allocates an output buffer with room for `capacity` quads.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            quads: vec![0; capacity],
            face_begin: [0; 6],
            face_count: [0; 6],
            quad_count: 0,
        }
    }

    /// The valid quads.
    pub fn quads(&self) -> &[u64] {
        &self.quads[..self.quad_count]
    }

    /// The valid quads of one face.
    pub fn face_quads(&self, face: usize) -> &[u64] {
        let begin = self.face_begin[face] as usize;
        &self.quads[begin..begin + self.face_count[face] as usize]
    }

    fn reset(&mut self) {
        self.face_begin = [0; 6];
        self.face_count = [0; 6];
        self.quad_count = 0;
    }

    #[inline]
    fn push(&mut self, word: u64) {
        if self.quad_count >= self.quads.len() {
            let grown = (self.quads.len() * 2).max(INITIAL_QUAD_CAPACITY);
            self.quads.resize(grown, 0);
        }
        self.quads[self.quad_count] = word;
        self.quad_count += 1;
    }
}

/// Meshes a padded voxel grid and returns the number of quads written to `out`.
///
/// # Arguments
/// * `voxels` - `PCS³` voxel types, `0` is empty, indexed by [`voxel_index`]
/// * `opaque_mask` - `PCS²` column masks, indexed by [`column_index`]
/// * `scratch` - reusable scratch
/// * `out` - receives the quads, grown geometrically when full
///
/// # Returns
/// The quad count. Words past it in `out.quads` are leftovers from earlier runs.
pub fn generate_mesh(
    voxels: &[u8],
    opaque_mask: &[u64],
    scratch: &mut MeshScratch,
    out: &mut MeshData,
) -> usize {
    debug_assert_eq!(voxels.len(), PCS3);
    debug_assert_eq!(opaque_mask.len(), PCS2);

    out.reset();
    scratch.forward_merged.fill(0);
    scratch.right_merged.fill(0);
    build_face_masks(opaque_mask, &mut scratch.face_masks);

    for face in 0..4 {
        out.face_begin[face] = out.quad_count as u32;
        mesh_side_face(face, voxels, scratch, out);
        out.face_count[face] = out.quad_count as u32 - out.face_begin[face];
    }
    for face in 4..6 {
        out.face_begin[face] = out.quad_count as u32;
        mesh_vertical_face(face, voxels, scratch, out);
        out.face_count[face] = out.quad_count as u32 - out.face_begin[face];
    }

    out.quad_count
}

/// Fills `face_masks` with one visibility column per face and logical column.
///
/// Faces 0-1 and 4-5 are indexed `(x - 1) + (z - 1) * CS`; faces 2-3 are
/// indexed `(z - 1) + (x - 1) * CS` so that their layer axis is x. Bit `i` of
/// a column is padded `y = i + 1`.
fn build_face_masks(opaque_mask: &[u64], face_masks: &mut [u64]) {
    for z in 1..PCS - 1 {
        for x in 1..PCS - 1 {
            let column = opaque_mask[column_index(x, z)];
            let solid = column & !HALO_BITS;
            let zx = (x - 1) + (z - 1) * CS;
            let xz = (z - 1) + (x - 1) * CS;

            face_masks[zx] = (solid & !opaque_mask[column_index(x, z + 1)]) >> 1;
            face_masks[zx + CS2] = (solid & !opaque_mask[column_index(x, z - 1)]) >> 1;
            face_masks[xz + 2 * CS2] = (solid & !opaque_mask[column_index(x + 1, z)]) >> 1;
            face_masks[xz + 3 * CS2] = (solid & !opaque_mask[column_index(x - 1, z)]) >> 1;
            face_masks[zx + 4 * CS2] = (solid & !(column >> 1)) >> 1;
            face_masks[zx + 5 * CS2] = (solid & !(column << 1)) >> 1;
        }
    }
}

fn mesh_side_face(face: usize, voxels: &[u8], scratch: &mut MeshScratch, out: &mut MeshData) {
    let face_masks = &scratch.face_masks;
    let forward_merged = &mut scratch.forward_merged;
    let base = face * CS2;
    let plane_offset = usize::from(face % 2 == 0);

    // (layer, row, bit) -> voxel type
    let voxel_at = |layer: usize, forward: usize, bit: usize| -> u8 {
        if face < 2 {
            voxels[voxel_index(forward + 1, bit + 1, layer + 1)]
        } else {
            voxels[voxel_index(layer + 1, bit + 1, forward + 1)]
        }
    };

    for layer in 0..CS {
        let layer_base = base + layer * CS;

        for forward in 0..CS {
            let mut bits_here = face_masks[layer_base + forward];
            if bits_here == 0 {
                continue;
            }
            let bits_next = if forward + 1 < CS {
                face_masks[layer_base + forward + 1]
            } else {
                0
            };

            let mut right_merged = 1usize;
            while bits_here != 0 {
                let bit_pos = bits_here.trailing_zeros() as usize;
                let voxel_type = voxel_at(layer, forward, bit_pos);

                if (bits_next >> bit_pos) & 1 != 0
                    && voxel_type == voxel_at(layer, forward + 1, bit_pos)
                {
                    forward_merged[bit_pos] += 1;
                    bits_here &= !(1u64 << bit_pos);
                    continue;
                }

                for right in bit_pos + 1..CS {
                    if (bits_here >> right) & 1 == 0
                        || forward_merged[bit_pos] != forward_merged[right]
                        || voxel_type != voxel_at(layer, forward, right)
                    {
                        break;
                    }
                    forward_merged[right] = 0;
                    right_merged += 1;
                }
                bits_here &= !((1u64 << (bit_pos + right_merged)) - 1);

                let merged_rows = forward_merged[bit_pos] as usize;
                let front = forward - merged_rows;
                let left = bit_pos;
                let up = layer + plane_offset;
                let (x, y, z) = if face < 2 {
                    (front, left, up)
                } else {
                    (up, left, front)
                };

                out.push(pack_quad(
                    x as u32,
                    y as u32,
                    z as u32,
                    right_merged as u32,
                    merged_rows as u32 + 1,
                    voxel_type as u32,
                ));

                forward_merged[bit_pos] = 0;
                right_merged = 1;
            }
        }
    }
}

fn mesh_vertical_face(face: usize, voxels: &[u8], scratch: &mut MeshScratch, out: &mut MeshData) {
    let face_masks = &scratch.face_masks;
    let forward_merged = &mut scratch.forward_merged;
    let right_merged = &mut scratch.right_merged;
    let base = face * CS2;
    let plane_offset = usize::from(face % 2 == 0);

    for forward in 0..CS {
        let forward_base = base + forward * CS;

        for right in 0..CS {
            let mut bits_here = face_masks[forward_base + right];
            if bits_here == 0 {
                continue;
            }
            let bits_forward = if forward + 1 < CS {
                face_masks[forward_base + CS + right]
            } else {
                0
            };
            let bits_right = if right + 1 < CS {
                face_masks[forward_base + right + 1]
            } else {
                0
            };
            let right_cs = right * CS;

            while bits_here != 0 {
                let bit_pos = bits_here.trailing_zeros() as usize;
                bits_here &= !(1u64 << bit_pos);

                let voxel_type = voxels[voxel_index(right + 1, bit_pos + 1, forward + 1)];
                let merged_index = right_cs + bit_pos;

                if right_merged[bit_pos] == 0
                    && (bits_forward >> bit_pos) & 1 != 0
                    && voxel_type == voxels[voxel_index(right + 1, bit_pos + 1, forward + 2)]
                {
                    forward_merged[merged_index] += 1;
                    continue;
                }

                if (bits_right >> bit_pos) & 1 != 0
                    && forward_merged[merged_index] == forward_merged[merged_index + CS]
                    && voxel_type == voxels[voxel_index(right + 2, bit_pos + 1, forward + 1)]
                {
                    forward_merged[merged_index] = 0;
                    right_merged[bit_pos] += 1;
                    continue;
                }

                let merged_columns = right_merged[bit_pos] as usize;
                let merged_rows = forward_merged[merged_index] as usize;

                out.push(pack_quad(
                    (right - merged_columns) as u32,
                    (bit_pos + plane_offset) as u32,
                    (forward - merged_rows) as u32,
                    merged_columns as u32 + 1,
                    merged_rows as u32 + 1,
                    voxel_type as u32,
                ));

                forward_merged[merged_index] = 0;
                right_merged[bit_pos] = 0;
            }
        }
    }
}
