//! # Chunk Module
//!
//! The terrain-generation scratch grid handed from the generator to the mesher.
//!
//! ## Memory Layout
//!
//! A chunk stores a padded cube of `PCS³` voxels: the `CS³` logical voxels
//! plus a one-voxel halo on every side. The halo is filled from the same
//! height field as the interior so the mesher can cull faces on chunk borders
//! without looking at neighbouring chunks.
//!
//! - `voxels`: one byte per voxel, `0` is empty. Indexed `y + x * PCS + z * PCS²`
//!   so a vertical column is contiguous.
//! - `opaque_mask`: one `u64` per `(x, z)` column, bit `y` set when the voxel
//!   is solid. Indexed `x + z * PCS`.
//!
//! Chunks are large (about 288 KiB) and are only ever checked out of an
//! `ObjectPool`, never created per task.

/// Padded chunk size along one axis.
pub const PCS: usize = 64;
/// Logical chunk size along one axis.
pub const CS: usize = PCS - 2;
/// Voxels in one padded `(x, y)` slice.
pub const PCS2: usize = PCS * PCS;
/// Voxels in the padded chunk.
pub const PCS3: usize = PCS2 * PCS;
/// Faces in one logical `CS × CS` slice.
pub const CS2: usize = CS * CS;

/// Index of a padded voxel coordinate in [`Chunk::voxels`].
#[inline]
pub const fn voxel_index(x: usize, y: usize, z: usize) -> usize {
    y + x * PCS + z * PCS2
}

/// Index of a padded column in [`Chunk::opaque_mask`].
#[inline]
pub const fn column_index(x: usize, z: usize) -> usize {
    x + z * PCS
}

/// Padded voxel grid plus its per-column opacity bitmask.
pub struct Chunk {
    /// Voxel types of the padded grid.
    pub voxels: Box<[u8]>,
    /// Per-column solid bits of the padded grid.
    pub opaque_mask: Box<[u64]>,
    /// Solid voxels inside the logical (unpadded) region.
    pub num_solid_voxels: u32,
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunk {
    /// Allocates an empty chunk.
    pub fn new() -> Self {
        Self {
            voxels: vec![0; PCS3].into_boxed_slice(),
            opaque_mask: vec![0; PCS2].into_boxed_slice(),
            num_solid_voxels: 0,
        }
    }

    /// Empties every voxel.
    pub fn clear(&mut self) {
        self.voxels.fill(0);
        self.opaque_mask.fill(0);
        self.num_solid_voxels = 0;
    }

    /// Sets the voxel at a padded coordinate and keeps the mask and solid count in step.
    pub fn set(&mut self, x: usize, y: usize, z: usize, voxel: u8) {
        let index = voxel_index(x, y, z);
        let was_solid = self.voxels[index] != 0;
        let is_solid = voxel != 0;
        self.voxels[index] = voxel;

        let bit = 1u64 << y;
        let column = &mut self.opaque_mask[column_index(x, z)];
        if is_solid {
            *column |= bit;
        } else {
            *column &= !bit;
        }

        if Self::is_interior(x, y, z) && was_solid != is_solid {
            if is_solid {
                self.num_solid_voxels += 1;
            } else {
                self.num_solid_voxels -= 1;
            }
        }
    }

    /// Voxel at a padded coordinate.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> u8 {
        self.voxels[voxel_index(x, y, z)]
    }

    /// Whether a padded coordinate lies inside the logical region.
    #[inline]
    pub fn is_interior(x: usize, y: usize, z: usize) -> bool {
        (1..=CS).contains(&x) && (1..=CS).contains(&y) && (1..=CS).contains(&z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_and_count_follow_voxels() {
        let mut chunk = Chunk::new();
        chunk.set(1, 5, 1, 3);
        chunk.set(0, 5, 0, 3);
        assert_eq!(chunk.opaque_mask[column_index(1, 1)], 1 << 5);
        assert_eq!(chunk.opaque_mask[column_index(0, 0)], 1 << 5);
        assert_eq!(chunk.num_solid_voxels, 1);

        chunk.set(1, 5, 1, 0);
        assert_eq!(chunk.opaque_mask[column_index(1, 1)], 0);
        assert_eq!(chunk.num_solid_voxels, 0);
    }
}
