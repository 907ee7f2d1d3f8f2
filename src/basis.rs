/// Legendre and Lobatto polynomials
pub mod lobatto;

use crate::domain::mesh::{elem::ElemShape, geometry::V2D, p_refinement::PolyOrders};
use lobatto::{kernel, LegendreTable, LobattoTable};
use smallvec::SmallVec;

// (a, b) Lobatto indices of the quad vertex functions l_a(u) * l_b(v)
const QUAD_VERTEX_IDX: [(usize, usize); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];

/// One function of an Elem's local H1 basis.
///
/// Edge functions are oriented along the global orientation of their `Edge`: their trace on the side,
/// parameterized from `nodes[0]` to `nodes[1]` of the Edge, is the Lobatto function `l_k`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocalFn {
    Vertex(usize),
    Edge { side: usize, k: u8 },
    /// Quads: `l_i(u) * l_j(v)`. Triangles: `λ0 λ1 λ2 P_i(λ1 - λ0) P_j(λ2 - λ0)`
    Bubble { i: u8, j: u8 },
}

/// Value and reference-space gradient of a shape function
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ShapeValue {
    pub value: f64,
    pub grad: V2D,
}

/// Hierarchic (Lobatto) H1 shape functions of a single Elem
#[derive(Clone, Debug)]
pub struct LocalShape {
    pub shape: ElemShape,
    pub orders: PolyOrders,
    side_orders: SmallVec<[u8; 4]>,
    flipped: SmallVec<[bool; 4]>,
    fns: Vec<LocalFn>,
}

impl LocalShape {
    /// Local basis with the given interior orders and per-side edge orders
    ///
    /// `flipped[side]` indicates that the Elem traverses that side against its Edge's global orientation.
    pub fn new(
        shape: ElemShape,
        orders: PolyOrders,
        side_orders: SmallVec<[u8; 4]>,
        flipped: SmallVec<[bool; 4]>,
    ) -> Self {
        let mut fns: Vec<LocalFn> = (0..shape.num_vertices()).map(LocalFn::Vertex).collect();

        for (side, side_order) in side_orders.iter().enumerate() {
            fns.extend((2..=*side_order).map(|k| LocalFn::Edge { side, k }));
        }

        match shape {
            ElemShape::Quad => {
                for i in 2..=orders.ni {
                    for j in 2..=orders.nj {
                        fns.push(LocalFn::Bubble { i, j });
                    }
                }
            }
            ElemShape::Tri => {
                if orders.ni >= 3 {
                    for total in 0..=(orders.ni - 3) {
                        for i in 0..=total {
                            fns.push(LocalFn::Bubble { i, j: total - i });
                        }
                    }
                }
            }
        }

        Self {
            shape,
            orders,
            side_orders,
            flipped,
            fns,
        }
    }

    /// The full polynomial space of an Elem with the given orders (no neighbours, no orientation flips)
    pub fn full(shape: ElemShape, orders: PolyOrders) -> Self {
        let side_orders = match shape {
            ElemShape::Quad => SmallVec::from_slice(&[orders.ni, orders.ni, orders.nj, orders.nj]),
            ElemShape::Tri => SmallVec::from_slice(&[orders.ni; 3]),
        };
        let flipped = SmallVec::from_elem(false, shape.num_sides());
        Self::new(shape, orders, side_orders, flipped)
    }

    pub fn fns(&self) -> &[LocalFn] {
        &self.fns
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    pub fn side_order(&self, side: usize) -> u8 {
        self.side_orders[side]
    }

    /// Highest polynomial degree in any direction (drives the quadrature order)
    pub fn max_order(&self) -> u8 {
        self.side_orders
            .iter()
            .copied()
            .fold(self.orders.max(), std::cmp::max)
    }

    /// Evaluate every local function at a reference point
    pub fn eval(&self, xi: V2D) -> Vec<ShapeValue> {
        match self.shape {
            ElemShape::Quad => self.eval_quad(xi),
            ElemShape::Tri => self.eval_tri(xi),
        }
    }

    fn edge_sign(&self, side: usize, k: u8) -> f64 {
        if self.flipped[side] && k % 2 == 1 {
            -1.0
        } else {
            1.0
        }
    }

    fn eval_quad(&self, xi: V2D) -> Vec<ShapeValue> {
        let n = self.max_order() as usize;
        let lu = LobattoTable::new(n, xi[0]);
        let lv = LobattoTable::new(n, xi[1]);

        let tensor = |a: usize, b: usize, sign: f64| ShapeValue {
            value: sign * lu.values[a] * lv.values[b],
            grad: V2D::from([
                sign * lu.derivs[a] * lv.values[b],
                sign * lu.values[a] * lv.derivs[b],
            ]),
        };

        self.fns
            .iter()
            .map(|f| match *f {
                LocalFn::Vertex(v) => {
                    let (a, b) = QUAD_VERTEX_IDX[v];
                    tensor(a, b, 1.0)
                }
                LocalFn::Edge { side, k } => {
                    let k_idx = k as usize;
                    let (a, b) = match side {
                        0 => (k_idx, 0),
                        1 => (k_idx, 1),
                        2 => (0, k_idx),
                        _ => (1, k_idx),
                    };
                    tensor(a, b, self.edge_sign(side, k))
                }
                LocalFn::Bubble { i, j } => tensor(i as usize, j as usize, 1.0),
            })
            .collect()
    }

    fn eval_tri(&self, xi: V2D) -> Vec<ShapeValue> {
        let n = self.max_order() as usize;
        let lambda = [-(xi[0] + xi[1]) / 2.0, (1.0 + xi[0]) / 2.0, (1.0 + xi[1]) / 2.0];
        let d_lambda = [
            V2D::from([-0.5, -0.5]),
            V2D::from([0.5, 0.0]),
            V2D::from([0.0, 0.5]),
        ];

        let side_tables: SmallVec<[LegendreTable; 3]> = (0..3)
            .map(|side| {
                let [a, b] = self.shape.side_vertices(side);
                LegendreTable::new(n, lambda[b] - lambda[a])
            })
            .collect();

        let bubble_tables = if self.orders.ni >= 3 {
            Some((
                LegendreTable::new(n, lambda[1] - lambda[0]),
                LegendreTable::new(n, lambda[2] - lambda[0]),
            ))
        } else {
            None
        };

        self.fns
            .iter()
            .map(|f| match *f {
                LocalFn::Vertex(v) => ShapeValue {
                    value: lambda[v],
                    grad: d_lambda[v],
                },
                LocalFn::Edge { side, k } => {
                    let [a, b] = self.shape.side_vertices(side);
                    let (phi, d_phi) = kernel(k as usize, &side_tables[side]);
                    let sign = self.edge_sign(side, k);
                    let ab = lambda[a] * lambda[b];
                    let d_ab = d_lambda[a] * lambda[b] + d_lambda[b] * lambda[a];

                    ShapeValue {
                        value: sign * ab * phi,
                        grad: (d_ab * phi + (d_lambda[b] - d_lambda[a]) * (ab * d_phi)) * sign,
                    }
                }
                LocalFn::Bubble { i, j } => match &bubble_tables {
                    Some((pu, pv)) => {
                        let (i, j) = (i as usize, j as usize);
                        let cube = lambda[0] * lambda[1] * lambda[2];
                        let d_cube = d_lambda[0] * (lambda[1] * lambda[2])
                            + d_lambda[1] * (lambda[0] * lambda[2])
                            + d_lambda[2] * (lambda[0] * lambda[1]);
                        let d_u = d_lambda[1] - d_lambda[0];
                        let d_v = d_lambda[2] - d_lambda[0];

                        ShapeValue {
                            value: cube * pu.p[i] * pv.p[j],
                            grad: d_cube * (pu.p[i] * pv.p[j])
                                + (d_u * (pu.dp[i] * pv.p[j]) + d_v * (pu.p[i] * pv.dp[j])) * cube,
                        }
                    }
                    None => ShapeValue::default(),
                },
            })
            .collect()
    }
}

/// Number of functions in the full local space of an Elem
pub fn full_space_size(shape: ElemShape, orders: PolyOrders) -> usize {
    let (px, py) = (orders.ni as usize, orders.nj as usize);
    match shape {
        ElemShape::Quad => (px + 1) * (py + 1),
        ElemShape::Tri => (px + 1) * (px + 2) / 2,
    }
}
