use super::{
    config::{AdaptConfig, CandList},
    AdaptError,
};
use crate::basis::{full_space_size, LocalShape};
use crate::domain::{
    fields::{FnValue, Solution},
    mesh::{
        elem::ElemShape,
        geometry::{AffineMap, M2D, V2D},
        h_refinement::HRef,
        p_refinement::PolyOrders,
        Mesh, MAX_POLYNOMIAL_ORDER,
    },
};
use crate::fem_problem::galerkin::physical_values;
use crate::integration::{num_glq_points, QuadRule};

use log::{trace, warn};
use nalgebra::{DMatrix, DVector};
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;

/// Errors are floored here before taking logarithms
const ERROR_FLOOR: f64 = 1e-30;
/// Errors below this fraction of the reference norm are round-off and compare equal
const RELATIVE_ERROR_FLOOR: f64 = 1e-12;
const CONTAINMENT_TOL: f64 = 1e-10;

/// A way to refine one Elem
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    /// keep the geometry, use these orders
    P(PolyOrders),
    /// split the Elem, giving each son (in child order) its own orders
    H {
        refinement: HRef,
        sons: SmallVec<[PolyOrders; 4]>,
    },
}

impl Candidate {
    /// Isotropic split whose sons keep the given orders
    pub fn iso_h(shape: ElemShape, orders: PolyOrders) -> Self {
        Self::H {
            refinement: HRef::T,
            sons: SmallVec::from_elem(orders, HRef::T.num_children(shape)),
        }
    }

    pub fn is_h(&self) -> bool {
        matches!(self, Self::H { .. })
    }

    fn refinement(&self) -> Option<HRef> {
        match self {
            Self::P(_) => None,
            Self::H { refinement, .. } => Some(*refinement),
        }
    }

    fn son_orders(&self) -> SmallVec<[PolyOrders; 4]> {
        match self {
            Self::P(orders) => smallvec![*orders],
            Self::H { sons, .. } => sons.clone(),
        }
    }

    fn max_order(&self) -> u8 {
        self.son_orders().iter().map(|orders| orders.max()).max().unwrap_or(1)
    }

    /// Number of H1 DoFs of the candidate on an isolated Elem (its whole local patch, boundary included)
    pub fn num_dofs(&self, shape: ElemShape) -> usize {
        let e = |q: u8| q.saturating_sub(1) as usize;
        let bubble = |q: PolyOrders| match shape {
            ElemShape::Quad => e(q.ni) * e(q.nj),
            ElemShape::Tri => e(q.ni) * e(q.ni).saturating_sub(1) / 2,
        };

        match self {
            Self::P(orders) => full_space_size(shape, *orders),
            Self::H { refinement, sons } => {
                let bubbles: usize = sons.iter().map(|q| bubble(*q)).sum();
                let edges = match (refinement, shape) {
                    // sons SW, SE, NW, NE
                    (HRef::T, ElemShape::Quad) => {
                        let [sw, se, nw, ne] = [sons[0], sons[1], sons[2], sons[3]];
                        e(sw.ni) + e(se.ni) + e(nw.ni) + e(ne.ni)
                            + e(sw.nj) + e(nw.nj) + e(se.nj) + e(ne.nj)
                            + e(sw.ni.max(nw.ni)) + e(se.ni.max(ne.ni))
                            + e(sw.nj.max(se.nj)) + e(nw.nj.max(ne.nj))
                    }
                    // sons left, right
                    (HRef::U, _) => {
                        let [l, r] = [sons[0], sons[1]];
                        2 * e(l.ni) + 2 * e(r.ni) + e(l.nj) + e(r.nj) + e(l.nj.max(r.nj))
                    }
                    // sons bottom, top
                    (HRef::V, _) => {
                        let [b, t] = [sons[0], sons[1]];
                        2 * e(b.nj) + 2 * e(t.nj) + e(b.ni) + e(t.ni) + e(b.ni.max(t.ni))
                    }
                    // two exterior sides per son plus the bisecting side
                    (HRef::T, ElemShape::Tri) => {
                        let [s0, s1] = [sons[0], sons[1]];
                        2 * e(s0.ni) + 2 * e(s1.ni) + e(s0.ni.max(s1.ni))
                    }
                };
                let vertices = match (refinement, shape) {
                    (HRef::T, ElemShape::Quad) => 9,
                    (HRef::T, ElemShape::Tri) => 4,
                    _ => 6,
                };

                vertices + edges + bubbles
            }
        }
    }
}

/// Result of a candidate search
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    pub candidate: Candidate,
    pub score: f64,
    /// no candidate improved the Elem; isotropic h-refinement was chosen instead
    pub fallback: bool,
}

/// Enumerates and scores refinement candidates for single Elems
#[derive(Clone, Copy, Debug)]
pub struct Selector {
    cand_list: CandList,
    iso_only: bool,
    conv_exp: f64,
}

impl Selector {
    pub fn new(cand_list: CandList, iso_only: bool, conv_exp: f64) -> Self {
        Self {
            cand_list,
            iso_only,
            conv_exp,
        }
    }

    pub fn from_config(config: &AdaptConfig) -> Self {
        Self::new(config.cand_list, config.iso_only, config.conv_exp)
    }

    /// Candidates of an Elem with the given shape and current orders, in the order they are scored
    pub fn candidates(&self, shape: ElemShape, orders: PolyOrders) -> Vec<Candidate> {
        let quad = shape == ElemShape::Quad;
        let aniso_p = quad && !self.iso_only && self.cand_list.has_aniso_p();
        let aniso_h = quad && !self.iso_only && self.cand_list.has_aniso_h();
        let in_range = |o: &PolyOrders| o.ni <= MAX_POLYNOMIAL_ORDER && o.nj <= MAX_POLYNOMIAL_ORDER;

        let mut candidates = Vec::new();
        if self.cand_list.has_p() {
            let mut p_orders: Vec<PolyOrders> = (1..=2)
                .map(|d| PolyOrders::from(orders.ni + d, orders.nj + d))
                .collect();
            if aniso_p {
                for di in 0..=2 {
                    for dj in (0..=2).filter(|dj| *dj != di) {
                        p_orders.push(PolyOrders::from(orders.ni + di, orders.nj + dj));
                    }
                }
            }
            candidates.extend(p_orders.into_iter().filter(in_range).map(Candidate::P));
        }

        if self.cand_list.has_h() {
            let son_orders = if !self.cand_list.has_son_orders() {
                vec![orders]
            } else if aniso_p {
                let mut son_orders = Vec::new();
                for qi in half(orders.ni)..=orders.ni {
                    for qj in half(orders.nj)..=orders.nj {
                        son_orders.push(PolyOrders::from(qi, qj));
                    }
                }
                son_orders
            } else {
                let p = orders.max();
                (half(p)..=p).map(PolyOrders::iso).collect()
            };

            let splits: &[HRef] = if aniso_h { &[HRef::T, HRef::U, HRef::V] } else { &[HRef::T] };
            for refinement in splits {
                let num_sons = refinement.num_children(shape);
                for q in son_orders.iter() {
                    candidates.push(Candidate::H {
                        refinement: *refinement,
                        sons: SmallVec::from_elem(*q, num_sons),
                    });
                }
            }
        }

        candidates
    }

    /// Pick the best candidate for an active Elem of `mesh`, given a reference Solution on a Mesh nested in it
    ///
    /// Each candidate's error is the H1 projection error of the reference Solution onto the full polynomial
    /// spaces of its sons. Its score is `(ln e0 - ln e) / (d - d0)^conv_exp`, where `e0` and `d0` belong to the
    /// Elem's current orders; candidates which do not reduce the error while adding DoFs score 0. The first
    /// candidate with the highest score wins.
    pub fn select(
        &self,
        mesh: &Mesh,
        elem_id: usize,
        orders: PolyOrders,
        reference: &Solution,
    ) -> Result<Selection, AdaptError> {
        let shape = mesh.elems[elem_id].shape;
        let fallback = Selection {
            candidate: Candidate::iso_h(shape, orders),
            score: 0.0,
            fallback: true,
        };

        if self.cand_list == CandList::HIso {
            return Ok(Selection {
                fallback: false,
                ..fallback
            });
        }

        let candidates = self.candidates(shape, orders);
        if candidates.is_empty() {
            warn!("Elem {} has no legal candidates; falling back to isotropic h-refinement", elem_id);
            return Ok(fallback);
        }

        let ref_order = reference
            .mesh()
            .active_descendants(elem_id)?
            .iter()
            .filter_map(|leaf_id| reference.local_shape(*leaf_id))
            .map(|local| local.max_order())
            .max()
            .ok_or(AdaptError::NotNested(elem_id))?;
        let max_order = candidates
            .iter()
            .map(|c| c.max_order())
            .fold(orders.max().max(ref_order), std::cmp::max);
        let num_points = num_glq_points(max_order);

        // samples of the reference Solution over the sons of each split, shared by its candidates
        let mut samples: BTreeMap<Option<HRef>, Vec<SonSamples>> = BTreeMap::new();
        let whole = sample_sons(mesh, elem_id, reference, None, num_points)?;
        let ref_norm = whole
            .iter()
            .flat_map(|son| son.samples.iter())
            .map(|sample| h1_product(&sample.reference, &sample.reference) * sample.dx)
            .sum::<f64>()
            .sqrt();
        let floor = ERROR_FLOOR.max(RELATIVE_ERROR_FLOOR * ref_norm);
        samples.insert(None, whole);

        let mut candidate_error = |candidate: &Candidate| -> Result<f64, AdaptError> {
            let refinement = candidate.refinement();
            if !samples.contains_key(&refinement) {
                let sons = sample_sons(mesh, elem_id, reference, refinement, num_points)?;
                samples.insert(refinement, sons);
            }
            let sons = samples.get(&refinement).ok_or(AdaptError::Projection(elem_id))?;

            let mut err_sq = 0.0;
            for (son, son_orders) in sons.iter().zip(candidate.son_orders()) {
                err_sq += projection_error(son, son_orders).ok_or(AdaptError::Projection(elem_id))?;
            }
            Ok(err_sq.sqrt())
        };

        let e0 = candidate_error(&Candidate::P(orders))?.max(floor);
        let d0 = full_space_size(shape, orders);

        let mut best = fallback;
        for candidate in candidates {
            let error = candidate_error(&candidate)?.max(floor);
            let dofs = candidate.num_dofs(shape);

            let score = if error < e0 && dofs > d0 {
                (e0.ln() - error.ln()) / ((dofs - d0) as f64).powf(self.conv_exp)
            } else {
                0.0
            };
            trace!(
                "Elem {} candidate {:?}: error {:.4e}, {} DoFs, score {:.6}",
                elem_id,
                candidate,
                error,
                dofs,
                score
            );

            if score > best.score {
                best = Selection {
                    candidate,
                    score,
                    fallback: false,
                };
            }
        }

        if best.fallback {
            warn!(
                "no candidate reduces the error of Elem {}; falling back to isotropic h-refinement",
                elem_id
            );
        }
        Ok(best)
    }
}

fn half(p: u8) -> u8 {
    ((p + 1) / 2).max(1)
}

/// The reference Solution sampled at the quadrature points of one son
struct SonSamples {
    shape: ElemShape,
    samples: Vec<Sample>,
}

struct Sample {
    /// son reference coordinates
    xi: V2D,
    /// d(x, y) / d(son coordinates)
    jacobian: M2D,
    dx: f64,
    reference: FnValue,
}

// Quadrature cells are the reference leaves inside each son, or the son itself when it lies inside a leaf. The
// reference Mesh refines each coarse Elem at most once, so every leaf falls into one of these cases.
fn sample_sons(
    mesh: &Mesh,
    elem_id: usize,
    reference: &Solution,
    refinement: Option<HRef>,
    num_points: usize,
) -> Result<Vec<SonSamples>, AdaptError> {
    let elem = &mesh.elems[elem_id];
    let ref_mesh = reference.mesh();
    let son_maps: SmallVec<[AffineMap; 4]> = match refinement {
        Some(refinement) => refinement.child_maps(elem.shape)?,
        None => smallvec![AffineMap::identity()],
    };

    // leaf reference coordinates -> coarse Elem reference coordinates
    let to_elem = elem.map.inverse();
    let leaves: Vec<(usize, AffineMap)> = ref_mesh
        .active_descendants(elem_id)?
        .into_iter()
        .map(|leaf_id| (leaf_id, to_elem.compose(&ref_mesh.elems[leaf_id].map)))
        .collect();

    son_maps
        .iter()
        .map(|son_map| {
            let mut samples = Vec::new();
            for (leaf_id, leaf_map) in leaves.iter() {
                let leaf = &ref_mesh.elems[*leaf_id];
                let leaf_in_son = son_map.inverse().compose(leaf_map);

                // cell reference coordinates -> son reference coordinates
                let leaf_area = leaf_in_son.a.det().abs() * leaf.shape.reference_area();
                let (cell_map, cell_shape) = if leaf_area <= elem.shape.reference_area() + CONTAINMENT_TOL
                    && elem.shape.contains(leaf_in_son.apply(leaf.shape.center()), CONTAINMENT_TOL)
                {
                    (leaf_in_son, leaf.shape)
                } else if leaf.shape.contains(leaf_in_son.inverse_apply(elem.shape.center()), CONTAINMENT_TOL) {
                    (AffineMap::identity(), elem.shape)
                } else {
                    continue;
                };

                for (eta, w) in QuadRule::for_shape(cell_shape, num_points).iter() {
                    let xi = cell_map.apply(eta);
                    let root = elem.map.apply(son_map.apply(xi));
                    let (_, base_jacobian) = mesh.base_geometry(elem.base_id, root);
                    let jacobian = base_jacobian * elem.map.a * son_map.a;

                    let value = reference
                        .eval_local(*leaf_id, leaf.map.inverse_apply(root))
                        .ok_or(AdaptError::NotNested(elem_id))?;

                    samples.push(Sample {
                        xi,
                        jacobian,
                        dx: w * (jacobian * cell_map.a).det().abs(),
                        reference: value,
                    });
                }
            }

            Ok(SonSamples {
                shape: elem.shape,
                samples,
            })
        })
        .collect()
}

fn h1_product(u: &FnValue, v: &FnValue) -> f64 {
    u.grad.dot_with(&v.grad) + u.value * v.value
}

/// Squared H1 error of the H1 projection of the sampled reference Solution onto the full space of a son
fn projection_error(son: &SonSamples, orders: PolyOrders) -> Option<f64> {
    let basis = LocalShape::full(son.shape, orders);
    let n = basis.len();

    let values: Vec<Vec<FnValue>> = son
        .samples
        .iter()
        .map(|sample| physical_values(basis.eval(sample.xi), &sample.jacobian))
        .collect();

    let mut mat = DMatrix::<f64>::zeros(n, n);
    let mut rhs = DVector::<f64>::zeros(n);
    for (sample, phi) in son.samples.iter().zip(values.iter()) {
        for i in 0..n {
            rhs[i] += h1_product(&phi[i], &sample.reference) * sample.dx;
            for j in i..n {
                mat[(i, j)] += h1_product(&phi[i], &phi[j]) * sample.dx;
            }
        }
    }
    for i in 0..n {
        for j in 0..i {
            mat[(i, j)] = mat[(j, i)];
        }
    }

    let coefficients = match mat.clone().cholesky() {
        Some(cholesky_decomp) => cholesky_decomp.solve(&rhs),
        None => mat.lu().solve(&rhs)?,
    };

    let err_sq = son
        .samples
        .iter()
        .zip(values.iter())
        .map(|(sample, phi)| {
            let projected = phi
                .iter()
                .zip(coefficients.iter())
                .fold(FnValue::default(), |acc, (phi_i, c)| FnValue {
                    value: acc.value + phi_i.value * c,
                    grad: acc.grad + phi_i.grad * *c,
                });
            let diff = sample.reference - projected;
            h1_product(&diff, &diff) * sample.dx
        })
        .sum::<f64>();

    if err_sq.is_finite() {
        Some(err_sq)
    } else {
        None
    }
}
