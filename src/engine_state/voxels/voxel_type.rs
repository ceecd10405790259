//! # Voxel Type Module
//!
//! Materials written by the terrain generator. The discriminant is the byte
//! stored in the chunk grid and the `type` field of a packed quad.

use num_derive::FromPrimitive;

/// Material of a voxel. `Empty` is the only non-solid type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum VoxelType {
    /// Nothing. Never meshed.
    Empty = 0,
    /// Deep fill.
    Stone = 1,
    /// The few layers under the surface.
    Dirt = 2,
    /// The surface layer.
    Grass = 3,
}

/// Layers of dirt (in voxels of the current LOD) under the surface.
pub const DIRT_DEPTH: i32 = 3;

impl VoxelType {
    /// Decodes a stored voxel byte or quad type.
    pub fn from_raw(raw: u32) -> Option<VoxelType> {
        num_traits::FromPrimitive::from_u32(raw)
    }

    /// Material for a voxel `depth` LOD cells below the surface (0 = topmost solid cell).
    pub fn for_depth(depth: i32) -> VoxelType {
        match depth {
            d if d < 0 => VoxelType::Empty,
            0 => VoxelType::Grass,
            d if d <= DIRT_DEPTH => VoxelType::Dirt,
            _ => VoxelType::Stone,
        }
    }

    /// Whether the voxel occludes its neighbours.
    pub fn is_solid(self) -> bool {
        self != VoxelType::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layering_by_depth() {
        assert_eq!(VoxelType::for_depth(-1), VoxelType::Empty);
        assert_eq!(VoxelType::for_depth(0), VoxelType::Grass);
        assert_eq!(VoxelType::for_depth(DIRT_DEPTH), VoxelType::Dirt);
        assert_eq!(VoxelType::for_depth(DIRT_DEPTH + 1), VoxelType::Stone);
        assert_eq!(VoxelType::from_raw(3), Some(VoxelType::Grass));
        assert_eq!(VoxelType::from_raw(9), None);
    }
}
