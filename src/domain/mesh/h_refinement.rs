use super::elem::ElemShape;
use super::geometry::{AffineMap, M2D, V2D};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

/// Description of an h-Refinement
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HRef {
    /// isotropic (quads: 4 children; triangles: bisection of the refinement edge into 2 children)
    T,
    /// anisotropic quad split about the u-direction (left and right children)
    U,
    /// anisotropic quad split about the v-direction (bottom and top children)
    V,
}

impl HRef {
    pub fn is_isotropic(&self) -> bool {
        matches!(self, Self::T)
    }

    pub fn num_children(&self, shape: ElemShape) -> usize {
        match (self, shape) {
            (Self::T, ElemShape::Quad) => 4,
            _ => 2,
        }
    }

    /// Maps from each child's reference coordinates into the parent's reference coordinates (in child order)
    pub fn child_maps(&self, shape: ElemShape) -> Result<SmallVec<[AffineMap; 4]>, HRefError> {
        let half = M2D::diag(0.5, 0.5);
        Ok(match (self, shape) {
            (Self::T, ElemShape::Quad) => smallvec![
                AffineMap::new(half, V2D::from([-0.5, -0.5])),
                AffineMap::new(half, V2D::from([0.5, -0.5])),
                AffineMap::new(half, V2D::from([-0.5, 0.5])),
                AffineMap::new(half, V2D::from([0.5, 0.5])),
            ],
            (Self::U, ElemShape::Quad) => smallvec![
                AffineMap::new(M2D::diag(0.5, 1.0), V2D::from([-0.5, 0.0])),
                AffineMap::new(M2D::diag(0.5, 1.0), V2D::from([0.5, 0.0])),
            ],
            (Self::V, ElemShape::Quad) => smallvec![
                AffineMap::new(M2D::diag(1.0, 0.5), V2D::from([0.0, -0.5])),
                AffineMap::new(M2D::diag(1.0, 0.5), V2D::from([0.0, 0.5])),
            ],
            (Self::T, ElemShape::Tri) => {
                let [v0, v1, v2] = ElemShape::TRI_VERTICES;
                let mid = (v0 + v1) / 2.0;
                smallvec![
                    AffineMap::from_triangle_images([v2, v0, mid]),
                    AffineMap::from_triangle_images([v1, v2, mid]),
                ]
            }
            (_, ElemShape::Tri) => return Err(HRefError::AnisoOnTriangle(*self)),
        })
    }
}

/// Quadrant of a child Elem following a T-Type h-Refinement of a quad (from the parent Elem's perspective)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quadrant {
    /// south west
    SW,
    /// south east
    SE,
    /// north west
    NW,
    /// north east
    NE,
}

impl Quadrant {
    pub fn index(&self) -> usize {
        match self {
            Self::SW => 0,
            Self::SE => 1,
            Self::NW => 2,
            Self::NE => 3,
        }
    }
}

/// Location of a child following a bisection (U-Type, V-Type or triangle split).
/// Or the Location of a child Edge following an Edge h-refinement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bisection {
    /// Bottom (V-type) or Left (U-type)
    BL,
    /// Top (V-Type) or Right (U-type)
    TR,
}

impl Bisection {
    pub fn index(&self) -> usize {
        match self {
            Self::BL => 0,
            Self::TR => 1,
        }
    }
}

/// Maximum difference in refinement depth allowed across an Edge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regularity {
    /// any number of hanging levels
    Arbitrary,
    /// edge depth may exceed the depth of its constraining edge by at most this much
    MaxLevel(u8),
}

impl Regularity {
    /// Interpret the conventional integer setting: negative values mean unconstrained
    pub fn from_level(level: i32) -> Self {
        if level < 0 {
            Self::Arbitrary
        } else {
            Self::MaxLevel(level.clamp(1, u8::MAX as i32) as u8)
        }
    }
}

impl Default for Regularity {
    fn default() -> Self {
        Self::Arbitrary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HRefError {
    #[error("Elem {0} does not exist; Cannot apply h-Refinement!")]
    ElemDoesntExist(usize),
    #[error("Elem {0} is not active (it has children or was removed); Cannot apply h-Refinement!")]
    ElemNotActive(usize),
    #[error("Multiple h-refinements were specified for Elem {0}; Cannot apply h-Refinements!")]
    DoubleRefinement(usize),
    #[error("{0:?} refinement is not defined for triangles; Cannot apply h-Refinement!")]
    AnisoOnTriangle(HRef),
    #[error("Edge {0} would become shorter than the minimum edge length; Cannot apply h-Refinement!")]
    MinEdgeLength(usize),
    #[error("Elem {0} was not fully initialized by its h-Refinement!")]
    UninitializedElem(usize),
    #[error("Elem {0} has inactive children; Cannot merge them!")]
    NotMergeable(usize),
    #[error("Regularization did not settle after {0} passes; Cannot enforce mesh regularity!")]
    RegularityCascade(usize),
}
