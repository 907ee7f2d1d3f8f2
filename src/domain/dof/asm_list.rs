use super::{DofRef, DofTable};
use crate::basis::{
    lobatto::{lobatto_deriv, LobattoTable},
    LocalFn, LocalShape,
};
use crate::domain::mesh::Mesh;
use crate::domain::space::SpaceError;
use crate::integration::glq::gauss_quadrature_points;

use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;

/// Hanging Nodes and constrained Edges nested deeper than this are rejected
pub const MAX_CONSTRAINT_DEPTH: usize = 64;

const EXPANSION_TOL: f64 = 1e-14;

/// Linear combination of global DoFs
pub type Expansion = SmallVec<[(DofRef, f64); 4]>;

/// Global DoF expansion of each local shape function of an Elem, in [LocalShape::fns] order
#[derive(Clone, Debug)]
pub struct AsmList {
    pub entries: Vec<Expansion>,
}

impl AsmList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(local function, dof, coefficient)` triples
    pub fn iter(&self) -> impl Iterator<Item = (usize, DofRef, f64)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .flat_map(|(local, expansion)| expansion.iter().map(move |(dof, c)| (local, *dof, *c)))
    }
}

/// Everything needed to integrate over one active Elem
#[derive(Clone, Debug)]
pub struct ElemAssembly {
    pub elem_id: usize,
    pub shape: LocalShape,
    pub list: AsmList,
}

/// Resolves hanging Nodes and constrained Edges into combinations of unconstrained DoFs.
///
/// Vertex expansions are cached since many Elems share the same hanging Nodes.
pub(crate) struct ConstraintResolver<'a> {
    mesh: &'a Mesh,
    table: &'a DofTable,
    vertex_cache: BTreeMap<usize, Expansion>,
}

impl<'a> ConstraintResolver<'a> {
    pub fn new(mesh: &'a Mesh, table: &'a DofTable) -> Self {
        Self {
            mesh,
            table,
            vertex_cache: BTreeMap::new(),
        }
    }

    /// Build the local basis and its DoF expansion for an active Elem
    pub fn elem_assembly(&mut self, elem_id: usize) -> Result<ElemAssembly, SpaceError> {
        let (mesh, table) = (self.mesh, self.table);
        let elem = &mesh.elems[elem_id];
        let side_orders = (0..elem.shape.num_sides())
            .map(|side| table.side_order(mesh, elem_id, side))
            .collect();
        let flipped = (0..elem.shape.num_sides())
            .map(|side| mesh.side_is_flipped(elem_id, side))
            .collect();
        let shape = LocalShape::new(elem.shape, table.elem_orders(elem_id), side_orders, flipped);

        let bubbles = table.bubble_dofs(elem_id);
        let mut bubble_idx = 0;
        let mut entries = Vec::with_capacity(shape.len());

        for local_fn in shape.fns() {
            entries.push(match local_fn {
                LocalFn::Vertex(v) => self.vertex(elem.nodes[*v], 0)?,
                LocalFn::Edge { side, k } => self.edge_fn(elem.edges[*side], *k, 0)?,
                LocalFn::Bubble { .. } => {
                    let dof = bubbles
                        .and_then(|range| range.get(bubble_idx))
                        .ok_or(SpaceError::MissingDof(elem_id))?;
                    bubble_idx += 1;
                    smallvec![(dof, 1.0)]
                }
            });
        }

        Ok(ElemAssembly {
            elem_id,
            shape,
            list: AsmList { entries },
        })
    }

    /// Expansion of the vertex function at a Node
    fn vertex(&mut self, node_id: usize, depth: usize) -> Result<Expansion, SpaceError> {
        if let Some(dof) = self.table.vertex_dof(node_id) {
            return Ok(smallvec![(dof, 1.0)]);
        }
        if let Some(cached) = self.vertex_cache.get(&node_id) {
            return Ok(cached.clone());
        }
        if depth > MAX_CONSTRAINT_DEPTH {
            return Err(SpaceError::ConstraintDepth(node_id));
        }

        let (constraining, t) = self
            .mesh
            .hanging_constraint(node_id)
            .ok_or(SpaceError::UnresolvedNode(node_id))?;
        let [n0, n1] = self.mesh.edges[constraining].nodes;
        let order = self.table.edge_order(constraining);
        let lobatto = LobattoTable::new(order.max(1) as usize, t);

        let mut expansion = Expansion::new();
        accumulate(&mut expansion, &self.vertex(n0, depth + 1)?, lobatto.values[0]);
        accumulate(&mut expansion, &self.vertex(n1, depth + 1)?, lobatto.values[1]);
        for k in 2..=order {
            accumulate(
                &mut expansion,
                &self.edge_fn(constraining, k, depth + 1)?,
                lobatto.values[k as usize],
            );
        }
        prune(&mut expansion);

        self.vertex_cache.insert(node_id, expansion.clone());
        Ok(expansion)
    }

    /// Expansion of edge function `k` on an Edge (in the Edge's global orientation)
    fn edge_fn(&mut self, edge_id: usize, k: u8, depth: usize) -> Result<Expansion, SpaceError> {
        if let Some(range) = self.table.edge_dofs(edge_id) {
            let dof = range
                .get(k as usize - 2)
                .ok_or(SpaceError::MissingDof(edge_id))?;
            return Ok(smallvec![(dof, 1.0)]);
        }
        if depth > MAX_CONSTRAINT_DEPTH {
            return Err(SpaceError::ConstraintDepth(edge_id));
        }

        let (constraining, range) = self
            .mesh
            .constraining_edge(edge_id)
            .ok_or(SpaceError::UnresolvedEdge(edge_id))?;
        let order = self.table.edge_order(constraining);

        let mut expansion = Expansion::new();
        for m in k..=order {
            let c = restriction_coefficient(m, k, range);
            accumulate(&mut expansion, &self.edge_fn(constraining, m, depth + 1)?, c);
        }
        prune(&mut expansion);

        Ok(expansion)
    }
}

/// Coefficient of the small-edge function `l_k` in the restriction of the large-edge function `l_m`
/// onto the sub-interval `[a, b]`.
///
/// The derivatives of the Lobatto functions are orthonormal, so the coefficient is
/// `∫ (b - a) / 2 * l_m'(t(s)) l_k'(s) ds` with `t(s) = a + (b - a)(s + 1) / 2`.
pub fn restriction_coefficient(m: u8, k: u8, [a, b]: [f64; 2]) -> f64 {
    let (points, weights) = gauss_quadrature_points(m as usize + 1);
    let half = (b - a) / 2.0;

    points
        .iter()
        .zip(weights.iter())
        .map(|(s, w)| {
            let t = a + half * (s + 1.0);
            w * half * lobatto_deriv(m as usize, t) * lobatto_deriv(k as usize, *s)
        })
        .sum()
}

fn accumulate(target: &mut Expansion, source: &Expansion, scale: f64) {
    if scale.abs() < EXPANSION_TOL {
        return;
    }
    for (dof, c) in source.iter() {
        match target.iter_mut().find(|(existing, _)| existing == dof) {
            Some(entry) => entry.1 += c * scale,
            None => target.push((*dof, c * scale)),
        }
    }
}

fn prune(expansion: &mut Expansion) {
    expansion.retain(|(_, c)| c.abs() >= EXPANSION_TOL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::lobatto::lobatto;
    use crate::domain::dof::DofEnumerator;
    use crate::domain::mesh::{h_refinement::HRef, p_refinement::PolyOrders};
    use crate::domain::space::{BcType, SpaceKind};

    #[test]
    fn restriction_reproduces_lobatto_functions() {
        // l_m(t(s)) - (linear part) = Σ_k c_k l_k(s)
        let range = [0.0, 1.0];
        for m in 2..6_u8 {
            for s in [-0.7, -0.1, 0.4, 0.9] {
                let t: f64 = range[0] + (range[1] - range[0]) * (s + 1.0) / 2.0;
                let ta = lobatto(m as usize, range[0]);
                let tb = lobatto(m as usize, range[1]);
                let linear = ta * (1.0 - s) / 2.0 + tb * (1.0 + s) / 2.0;

                let expanded: f64 = (2..=m)
                    .map(|k| restriction_coefficient(m, k, range) * lobatto(k as usize, s))
                    .sum();
                assert!((lobatto(m as usize, t) - linear - expanded).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn hanging_vertex_expansion() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        let orders = vec![PolyOrders::iso(2); mesh.elems.len()];
        let table = DofEnumerator::new().enumerate(&mesh, &orders, SpaceKind::H1, &|_| BcType::Natural);
        let mut resolver = ConstraintResolver::new(&mesh, &table);

        // the midpoint of the edge shared with elem 1 hangs at t = 0
        let hanging = mesh.edges[mesh.elems[1].edges[2]].child_node_id().unwrap();
        let expansion = resolver.vertex(hanging, 0).unwrap();

        let weights: Vec<f64> = expansion.iter().map(|(_, c)| *c).collect();
        assert_eq!(expansion.len(), 3);
        assert!((weights[0] - 0.5).abs() < 1e-14);
        assert!((weights[1] - 0.5).abs() < 1e-14);
        assert!((weights[2] - lobatto(2, 0.0)).abs() < 1e-14);
    }

    #[test]
    fn multi_level_constraints_resolve() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        mesh.refine_element(5, HRef::T).unwrap();
        mesh.refine_element(9, HRef::T).unwrap();
        let orders = vec![PolyOrders::iso(3); mesh.elems.len()];
        let table = DofEnumerator::new().enumerate(&mesh, &orders, SpaceKind::H1, &|_| BcType::Natural);
        let mut resolver = ConstraintResolver::new(&mesh, &table);

        for elem_id in mesh.active_elem_ids() {
            let assembly = resolver.elem_assembly(elem_id).unwrap();
            assert_eq!(assembly.list.len(), assembly.shape.len());
            assert!(assembly.list.entries.iter().all(|e| !e.is_empty()));
            assert!(assembly.list.iter().all(|(_, dof, _)| match dof {
                DofRef::Free(idx) => idx < table.num_free(),
                DofRef::Essential(_) => false,
            }));
        }
    }
}
