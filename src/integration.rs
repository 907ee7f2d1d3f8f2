/// Methods to assist in Gauss-Legendre-Quadrature integration
pub mod glq;

use crate::domain::mesh::{elem::ElemShape, geometry::V2D};
use glq::gauss_quadrature_points;

/// Number of Gauss points per direction used to integrate over Elems whose highest order is `max_order`
///
/// Shared by assembly, projections and error estimation.
pub fn num_glq_points(max_order: u8) -> usize {
    max_order as usize + 2
}

/// Quadrature rule over a reference shape
#[derive(Clone, Debug)]
pub struct QuadRule {
    pub points: Vec<V2D>,
    pub weights: Vec<f64>,
}

impl QuadRule {
    /// Tensor-product Gauss rule over `[-1, 1]^2`
    pub fn quad(n: usize) -> Self {
        let (x, w) = gauss_quadrature_points(n);
        let mut points = Vec::with_capacity(n * n);
        let mut weights = Vec::with_capacity(n * n);

        for (m, u_w) in w.iter().enumerate() {
            for (k, v_w) in w.iter().enumerate() {
                points.push(V2D::from([x[m], x[k]]));
                weights.push(u_w * v_w);
            }
        }

        Self { points, weights }
    }

    /// Collapsed (Duffy) Gauss rule over the reference triangle `(-1,-1), (1,-1), (-1,1)`
    pub fn tri(n: usize) -> Self {
        let (x, w) = gauss_quadrature_points(n);
        let mut points = Vec::with_capacity(n * n);
        let mut weights = Vec::with_capacity(n * n);

        for (m, a_w) in w.iter().enumerate() {
            for (k, b_w) in w.iter().enumerate() {
                let (a, b) = (x[m], x[k]);
                points.push(V2D::from([(1.0 + a) * (1.0 - b) / 2.0 - 1.0, b]));
                weights.push(a_w * b_w * (1.0 - b) / 2.0);
            }
        }

        Self { points, weights }
    }

    pub fn for_shape(shape: ElemShape, n: usize) -> Self {
        match shape {
            ElemShape::Quad => Self::quad(n),
            ElemShape::Tri => Self::tri(n),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate over `(point, weight)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (V2D, f64)> + '_ {
        self.points.iter().copied().zip(self.weights.iter().copied())
    }
}

/// Quadrature rules for both reference shapes with the same number of points per direction
#[derive(Clone, Debug)]
pub struct QuadRules {
    quad: QuadRule,
    tri: QuadRule,
}

impl QuadRules {
    pub fn new(max_order: u8) -> Self {
        let n = num_glq_points(max_order);
        Self {
            quad: QuadRule::quad(n),
            tri: QuadRule::tri(n),
        }
    }

    pub fn get(&self, shape: ElemShape) -> &QuadRule {
        match shape {
            ElemShape::Quad => &self.quad,
            ElemShape::Tri => &self.tri,
        }
    }
}
