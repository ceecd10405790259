//! # Terrain Generator
//!
//! Fills a padded chunk grid from a cached height map. A chunk at LOD scale
//! `s` samples one world voxel every `s` voxels, so padded voxel `(x, y, z)`
//! of a chunk with minimum corner `p` maps to world voxel `p + (l - 1) * s`
//! on each axis, `l` being the padded coordinate.
//!
//! Materials depend on depth below the column surface measured in LOD cells,
//! so the grass layer stays one cell thick at every scale.

use std::sync::Arc;

use crate::engine_state::voxels::chunk::{column_index, voxel_index, Chunk, CS, PCS};
use crate::engine_state::voxels::height_map::{HeightKey, HeightMapCache, HeightMapData};
use crate::engine_state::voxels::voxel_type::VoxelType;
use crate::error::PoolError;

/// Summary of one generated chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedTerrain {
    /// Solid voxels in the logical region.
    pub num_solid_voxels: u32,
    /// Every padded column is solid from top to bottom.
    pub fully_solid: bool,
}

/// Produces chunk voxel grids for octree nodes.
pub struct TerrainGenerator {
    height_maps: Arc<HeightMapCache>,
}

impl TerrainGenerator {
    /// Creates a generator sampling through `height_maps`.
    pub fn new(height_maps: Arc<HeightMapCache>) -> Self {
        Self { height_maps }
    }

    /// The shared height-map cache.
    pub fn height_maps(&self) -> &Arc<HeightMapCache> {
        &self.height_maps
    }

    /// Fills `chunk` for the node with minimum corner `origin` at LOD `scale`.
    ///
    /// Every voxel of the padded grid is overwritten, so pooled chunks need no
    /// clearing beforehand.
    pub fn generate(&self, chunk: &mut Chunk, origin: [i32; 3], scale: u32) -> Result<GeneratedTerrain, PoolError> {
        let heights = self.height_maps.get_or_generate(HeightKey {
            x: origin[0],
            z: origin[2],
            scale,
        })?;
        Ok(fill_chunk(chunk, &heights, origin[1], scale))
    }
}

/// Writes the padded grid of one chunk given its footprint's heights.
pub fn fill_chunk(chunk: &mut Chunk, heights: &HeightMapData, origin_y: i32, scale: u32) -> GeneratedTerrain {
    let s = scale as i32;
    let bottom = origin_y - s;
    let mut num_solid = 0u32;
    let mut fully_solid = true;

    for z in 0..PCS {
        for x in 0..PCS {
            let height = heights.get(x, z);
            // Padded cells [0, solid_cells) lie below the surface.
            let solid_cells = if height <= bottom {
                0
            } else {
                (((height - bottom) + s - 1) / s).min(PCS as i32) as usize
            };

            let column = &mut chunk.voxels[voxel_index(x, 0, z)..voxel_index(x, 0, z) + PCS];
            for (y, voxel) in column.iter_mut().enumerate() {
                *voxel = if y < solid_cells {
                    let world_y = bottom + y as i32 * s;
                    VoxelType::for_depth((height - 1 - world_y) / s) as u8
                } else {
                    VoxelType::Empty as u8
                };
            }

            chunk.opaque_mask[column_index(x, z)] = match solid_cells {
                0 => 0,
                PCS => u64::MAX,
                n => (1u64 << n) - 1,
            };
            fully_solid &= solid_cells == PCS;

            if (1..=CS).contains(&x) && (1..=CS).contains(&z) {
                num_solid += solid_cells.saturating_sub(1).min(CS) as u32;
            }
        }
    }

    chunk.num_solid_voxels = num_solid;
    GeneratedTerrain {
        num_solid_voxels: num_solid,
        fully_solid,
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use super::*;
    use crate::engine_state::voxels::height_map::FlatHeightField;

    fn generator(height: i32) -> TerrainGenerator {
        TerrainGenerator::new(Arc::new(HeightMapCache::new(
            Box::new(FlatHeightField { height }),
            Duration::from_secs(1),
            NonZeroUsize::new(8).unwrap(),
        )))
    }

    #[test]
    fn flat_surface_layers() {
        let mut chunk = Chunk::new();
        let terrain = generator(10).generate(&mut chunk, [0, 0, 0], 1).unwrap();

        // World y = l - 1, solid while y < 10.
        assert_eq!(terrain.num_solid_voxels, (CS * CS * 10) as u32);
        assert_eq!(chunk.get(5, 10, 5), VoxelType::Grass as u8);
        assert_eq!(chunk.get(5, 9, 5), VoxelType::Dirt as u8);
        assert_eq!(chunk.get(5, 7, 5), VoxelType::Dirt as u8);
        assert_eq!(chunk.get(5, 6, 5), VoxelType::Stone as u8);
        assert_eq!(chunk.get(5, 11, 5), VoxelType::Empty as u8);
        assert_eq!(chunk.opaque_mask[column_index(5, 5)], (1 << 11) - 1);
        assert!(!terrain.fully_solid);
    }

    #[test]
    fn chunk_above_surface_is_empty() {
        let mut chunk = Chunk::new();
        chunk.set(3, 3, 3, 1);
        let terrain = generator(10).generate(&mut chunk, [0, 62, 0], 1).unwrap();
        assert_eq!(terrain.num_solid_voxels, 0);
        assert!(chunk.opaque_mask.iter().all(|&m| m == 0));
        assert!(chunk.voxels.iter().all(|&v| v == 0));
    }

    #[test]
    fn buried_chunk_is_fully_solid() {
        let mut chunk = Chunk::new();
        let terrain = generator(1000).generate(&mut chunk, [0, 0, 0], 1).unwrap();
        assert!(terrain.fully_solid);
        assert_eq!(terrain.num_solid_voxels, (CS * CS * CS) as u32);
        assert_eq!(chunk.get(1, 1, 1), VoxelType::Stone as u8);
    }

    #[test]
    fn coarse_scale_keeps_counts_consistent() {
        let mut chunk = Chunk::new();
        // Scale 2: padded cell l covers world y = 2 * (l - 1). Cells with
        // world y in {-2, 0, .., 8} are below height 10.
        let terrain = generator(10).generate(&mut chunk, [0, 0, 0], 2).unwrap();
        assert_eq!(chunk.opaque_mask[column_index(1, 1)], (1 << 6) - 1);
        assert_eq!(terrain.num_solid_voxels, (CS * CS * 5) as u32);
        assert_eq!(chunk.get(1, 5, 1), VoxelType::Grass as u8);

        let counted = (1..=CS)
            .flat_map(|z| (1..=CS).flat_map(move |x| (1..=CS).map(move |y| (x, y, z))))
            .filter(|&(x, y, z)| chunk.get(x, y, z) != 0)
            .count();
        assert_eq!(counted as u32, terrain.num_solid_voxels);
    }
}
