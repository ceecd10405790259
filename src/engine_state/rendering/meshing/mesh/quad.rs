//! Packed 64-bit quad encoding.
//!
//! ```text
//!  bits 0..6   x
//!  bits 6..12  y
//!  bits 12..18 z
//!  bits 18..24 width   (along the face's right axis)
//!  bits 24..32 height  (along the face's forward axis)
//!  bits 32..64 voxel type
//! ```
//!
//! Coordinates are logical chunk coordinates in `0..=CS`. For a positive face
//! the coordinate along the normal is already the far plane of the voxel.
//! The right/forward axes per face are:
//!
//! | face        | right | forward |
//! |-------------|-------|---------|
//! | PosZ / NegZ | y     | x       |
//! | PosX / NegX | y     | z       |
//! | PosY / NegY | x     | z       |

const POS_BITS: u32 = 6;
const WIDTH_BITS: u32 = 6;
const HEIGHT_BITS: u32 = 8;

const POS_MASK: u64 = (1 << POS_BITS) - 1;
const WIDTH_MASK: u64 = (1 << WIDTH_BITS) - 1;
const HEIGHT_MASK: u64 = (1 << HEIGHT_BITS) - 1;

const Y_SHIFT: u32 = POS_BITS;
const Z_SHIFT: u32 = POS_BITS * 2;
const WIDTH_SHIFT: u32 = POS_BITS * 3;
const HEIGHT_SHIFT: u32 = WIDTH_SHIFT + WIDTH_BITS;
const TYPE_SHIFT: u32 = HEIGHT_SHIFT + HEIGHT_BITS;

/// Largest encodable coordinate.
pub const MAX_POSITION: u32 = POS_MASK as u32;
/// Largest encodable width.
pub const MAX_WIDTH: u32 = WIDTH_MASK as u32;
/// Largest encodable height.
pub const MAX_HEIGHT: u32 = HEIGHT_MASK as u32;
/// Size of one packed quad in bytes.
pub const QUAD_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Unpacked form of a quad word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quad {
    /// Logical x.
    pub x: u32,
    /// Logical y.
    pub y: u32,
    /// Logical z.
    pub z: u32,
    /// Extent along the right axis.
    pub width: u32,
    /// Extent along the forward axis.
    pub height: u32,
    /// Voxel type.
    pub voxel_type: u32,
}

impl Quad {
    /// Packs into a quad word. Fields are masked to their widths.
    #[inline]
    pub fn pack(&self) -> u64 {
        pack_quad(self.x, self.y, self.z, self.width, self.height, self.voxel_type)
    }

    /// Unpacks a quad word.
    #[inline]
    pub fn unpack(word: u64) -> Quad {
        Quad {
            x: (word & POS_MASK) as u32,
            y: ((word >> Y_SHIFT) & POS_MASK) as u32,
            z: ((word >> Z_SHIFT) & POS_MASK) as u32,
            width: ((word >> WIDTH_SHIFT) & WIDTH_MASK) as u32,
            height: ((word >> HEIGHT_SHIFT) & HEIGHT_MASK) as u32,
            voxel_type: (word >> TYPE_SHIFT) as u32,
        }
    }
}

/// Packs quad fields into one word.
#[inline]
pub fn pack_quad(x: u32, y: u32, z: u32, width: u32, height: u32, voxel_type: u32) -> u64 {
    (x as u64 & POS_MASK)
        | ((y as u64 & POS_MASK) << Y_SHIFT)
        | ((z as u64 & POS_MASK) << Z_SHIFT)
        | ((width as u64 & WIDTH_MASK) << WIDTH_SHIFT)
        | ((height as u64 & HEIGHT_MASK) << HEIGHT_SHIFT)
        | ((voxel_type as u64) << TYPE_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_state::voxels::chunk::CS;

    #[test]
    fn max_fields_round_trip() {
        let quad = Quad {
            x: MAX_POSITION,
            y: MAX_POSITION,
            z: MAX_POSITION,
            width: MAX_WIDTH,
            height: MAX_HEIGHT,
            voxel_type: u32::MAX,
        };
        assert_eq!(quad.pack(), u64::MAX);
        assert_eq!(Quad::unpack(quad.pack()), quad);
    }

    #[test]
    fn fields_do_not_bleed() {
        let quad = Quad {
            x: 1,
            y: 2,
            z: 3,
            width: 4,
            height: 5,
            voxel_type: 6,
        };
        assert_eq!(Quad::unpack(quad.pack()), quad);
    }

    #[test]
    fn chunk_extent_fits() {
        assert!(MAX_POSITION as usize >= CS);
        assert!(MAX_WIDTH as usize >= CS);
        assert!(MAX_HEIGHT as usize >= CS);
    }
}
