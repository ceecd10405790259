//! # Face Module
//!
//! The six axis-aligned face directions the mesher emits quads for.

use cgmath::Vector3;
use num_derive::FromPrimitive;

/// Face direction of a quad.
///
/// The discriminant is the face index used throughout the mesher and in the
/// per-draw face counts. The order is: [PosZ, NegZ, PosX, NegX, PosY, NegY].
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, FromPrimitive)]
pub enum Face {
    /// Facing positive Z
    PosZ = 0,
    /// Facing negative Z
    NegZ = 1,
    /// Facing positive X
    PosX = 2,
    /// Facing negative X
    NegX = 3,
    /// Facing positive Y
    PosY = 4,
    /// Facing negative Y
    NegY = 5,
}

impl Face {
    /// All faces in mesher order.
    pub const ALL: [Face; 6] = [
        Face::PosZ,
        Face::NegZ,
        Face::PosX,
        Face::NegX,
        Face::PosY,
        Face::NegY,
    ];

    /// Face for a mesher index, if in range.
    pub fn from_index(index: usize) -> Option<Face> {
        num_traits::FromPrimitive::from_usize(index)
    }

    /// Outward unit normal.
    pub fn normal(self) -> Vector3<i32> {
        match self {
            Face::PosZ => Vector3::new(0, 0, 1),
            Face::NegZ => Vector3::new(0, 0, -1),
            Face::PosX => Vector3::new(1, 0, 0),
            Face::NegX => Vector3::new(-1, 0, 0),
            Face::PosY => Vector3::new(0, 1, 0),
            Face::NegY => Vector3::new(0, -1, 0),
        }
    }

    /// Whether the normal points along a positive axis.
    pub fn is_positive(self) -> bool {
        (self as usize) % 2 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        for face in Face::ALL {
            assert_eq!(Face::from_index(face as usize), Some(face));
        }
        assert_eq!(Face::from_index(6), None);
    }

    #[test]
    fn positive_faces_have_positive_normals() {
        for face in Face::ALL {
            let n = face.normal();
            assert_eq!(face.is_positive(), n.x + n.y + n.z > 0);
        }
    }
}
