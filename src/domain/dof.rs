/// Expansion of local shape functions into (possibly constrained) global DoFs
pub mod asm_list;

use super::mesh::{elem::ElemShape, p_refinement::PolyOrders, Mesh};
use super::space::{BcType, SpaceKind};
use super::IdTracker;

use log::trace;
use std::collections::BTreeMap;

/// Reference to a global Degree of Freedom
///
/// Free DoFs are unknowns of the linear system. Essential DoFs are fixed by Dirichlet data and live in
/// their own index range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DofRef {
    Free(usize),
    Essential(usize),
}

impl DofRef {
    fn offset(&self, by: usize) -> Self {
        match self {
            Self::Free(idx) => Self::Free(idx + by),
            Self::Essential(idx) => Self::Essential(idx + by),
        }
    }
}

/// A run of consecutive DoFs attached to one Edge or Elem
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DofRange {
    pub first: DofRef,
    pub count: usize,
}

impl DofRange {
    pub fn get(&self, offset: usize) -> Option<DofRef> {
        if offset < self.count {
            Some(self.first.offset(offset))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DofRef> + '_ {
        (0..self.count).map(|offset| self.first.offset(offset))
    }
}

/// Where an essential DoF lives, so that its value can be computed from Dirichlet data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EssentialDof {
    /// Vertex `vertex` of active Elem `elem`
    Vertex {
        node: usize,
        elem: usize,
        vertex: usize,
        marker: u32,
    },
    /// Edge function `offset` of the Edge on side `side` of active Elem `elem`
    Edge {
        edge: usize,
        elem: usize,
        side: usize,
        offset: usize,
        marker: u32,
    },
}

/// The result of a DoF enumeration over a Mesh
#[derive(Clone, Debug)]
pub struct DofTable {
    vertex: Vec<Option<DofRef>>,
    edge: Vec<Option<DofRange>>,
    edge_orders: Vec<u8>,
    bubble: Vec<Option<DofRange>>,
    elem_orders: Vec<PolyOrders>,
    essential: Vec<EssentialDof>,
    num_free: usize,
}

impl DofTable {
    pub fn num_free(&self) -> usize {
        self.num_free
    }

    pub fn num_essential(&self) -> usize {
        self.essential.len()
    }

    pub fn essential_dofs(&self) -> &[EssentialDof] {
        &self.essential
    }

    pub fn vertex_dof(&self, node_id: usize) -> Option<DofRef> {
        self.vertex.get(node_id).copied().flatten()
    }

    pub fn edge_dofs(&self, edge_id: usize) -> Option<DofRange> {
        self.edge.get(edge_id).copied().flatten()
    }

    /// Order of an Edge that carries DoFs (0 for Edges that are not the side of an active Elem)
    pub fn edge_order(&self, edge_id: usize) -> u8 {
        self.edge_orders.get(edge_id).copied().unwrap_or(0)
    }

    pub fn bubble_dofs(&self, elem_id: usize) -> Option<DofRange> {
        self.bubble.get(elem_id).copied().flatten()
    }

    /// Interior orders of an Elem at the time of enumeration
    pub fn elem_orders(&self, elem_id: usize) -> PolyOrders {
        self.elem_orders.get(elem_id).copied().unwrap_or_default()
    }

    /// Order of the functions along a side of an active Elem (the constraining Edge's order on constrained sides)
    pub fn side_order(&self, mesh: &Mesh, elem_id: usize, side: usize) -> u8 {
        let edge_id = mesh.elems[elem_id].edges[side];
        let owner = mesh
            .constraining_edge(edge_id)
            .map_or(edge_id, |(constraining, _)| constraining);
        self.edge_order(owner)
    }

    /// Every assigned DoF (vertex, edge and bubble), in no particular order
    pub fn all_dofs(&self) -> Vec<DofRef> {
        let mut dofs: Vec<DofRef> = self.vertex.iter().flatten().copied().collect();
        for range in self.edge.iter().chain(self.bubble.iter()).flatten() {
            dofs.extend(range.iter());
        }
        dofs
    }
}

/// Order along one side of an Elem: u-directed sides (S, N) of quads use `ni`, v-directed sides (W, E) use `nj`
pub fn directional_order(shape: ElemShape, orders: PolyOrders, side: usize) -> u8 {
    match (shape, side) {
        (ElemShape::Quad, 2 | 3) => orders.nj,
        _ => orders.ni,
    }
}

/// Walks the active Elems of a Mesh and hands out DoF indices
///
/// Vertex DoFs come first, then Edge DoFs, then bubble DoFs. Every call to [DofEnumerator::enumerate] starts
/// from fresh counters.
pub struct DofEnumerator {
    free: IdTracker,
    essential: IdTracker,
    essential_dofs: Vec<EssentialDof>,
}

impl Default for DofEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DofEnumerator {
    pub fn new() -> Self {
        Self {
            free: IdTracker::new(0),
            essential: IdTracker::new(0),
            essential_dofs: Vec::new(),
        }
    }

    fn next_free(&mut self, count: usize) -> DofRef {
        DofRef::Free(self.free.next_ids(count))
    }

    fn next_essential(&mut self, dof: EssentialDof) -> DofRef {
        self.essential_dofs.push(dof);
        DofRef::Essential(self.essential.next_id())
    }

    /// Enumerate the DoFs of a Space with the given per-Elem orders (indexed by Elem id)
    pub fn enumerate(
        mut self,
        mesh: &Mesh,
        orders: &[PolyOrders],
        kind: SpaceKind,
        bc_types: &dyn Fn(u32) -> BcType,
    ) -> DofTable {
        let active = mesh.active_elem_ids();

        // orders of the Edges that carry functions (constrained sides contribute to their constraining Edge)
        let mut edge_orders = vec![0_u8; mesh.edges.len()];
        // essential Edges and the (elem, side) that sees them
        let mut essential_sides: BTreeMap<usize, (usize, usize, u32)> = BTreeMap::new();

        for elem_id in active.iter() {
            let elem = &mesh.elems[*elem_id];
            for (side, edge_id) in elem.edges.iter().enumerate() {
                let owner = mesh
                    .constraining_edge(*edge_id)
                    .map_or(*edge_id, |(constraining, _)| constraining);
                let order = directional_order(elem.shape, orders[*elem_id], side);
                edge_orders[owner] = edge_orders[owner].max(order);

                let edge = &mesh.edges[*edge_id];
                if edge.boundary && bc_types(edge.marker) == BcType::Essential {
                    essential_sides
                        .entry(*edge_id)
                        .or_insert((*elem_id, side, edge.marker));
                }
            }
        }

        let mut essential_nodes: BTreeMap<usize, (usize, usize, u32)> = BTreeMap::new();
        for (elem_id, side, marker) in essential_sides.values() {
            let elem = &mesh.elems[*elem_id];
            for vertex in elem.shape.side_vertices(*side) {
                essential_nodes
                    .entry(elem.nodes[vertex])
                    .or_insert((*elem_id, vertex, *marker));
            }
        }

        // vertex DoFs
        let mut vertex = vec![None; mesh.nodes.len()];
        if kind.has_vertex_dofs() {
            for elem_id in active.iter() {
                for node_id in mesh.elems[*elem_id].nodes.iter() {
                    if vertex[*node_id].is_some() || mesh.hanging_constraint(*node_id).is_some() {
                        continue;
                    }
                    vertex[*node_id] = Some(match essential_nodes.get(node_id) {
                        Some((elem, vertex_idx, marker)) => self.next_essential(EssentialDof::Vertex {
                            node: *node_id,
                            elem: *elem,
                            vertex: *vertex_idx,
                            marker: *marker,
                        }),
                        None => self.next_free(1),
                    });
                }
            }
        }

        // edge DoFs
        let mut edge = vec![None; mesh.edges.len()];
        for elem_id in active.iter() {
            for edge_id in mesh.elems[*elem_id].edges.iter() {
                if edge[*edge_id].is_some() || mesh.constraining_edge(*edge_id).is_some() {
                    continue;
                }
                let count = kind.edge_dof_count(edge_orders[*edge_id]);
                if count == 0 {
                    continue;
                }

                let first = match essential_sides.get(edge_id) {
                    Some((elem, side, marker)) => {
                        let first = self.next_essential(EssentialDof::Edge {
                            edge: *edge_id,
                            elem: *elem,
                            side: *side,
                            offset: 0,
                            marker: *marker,
                        });
                        for offset in 1..count {
                            self.next_essential(EssentialDof::Edge {
                                edge: *edge_id,
                                elem: *elem,
                                side: *side,
                                offset,
                                marker: *marker,
                            });
                        }
                        first
                    }
                    None => self.next_free(count),
                };
                edge[*edge_id] = Some(DofRange { first, count });
            }
        }

        // bubble DoFs
        let mut bubble = vec![None; mesh.elems.len()];
        for elem_id in active.iter() {
            let count = kind.bubble_dof_count(mesh.elems[*elem_id].shape, orders[*elem_id]);
            if count > 0 {
                bubble[*elem_id] = Some(DofRange {
                    first: self.next_free(count),
                    count,
                });
            }
        }

        trace!(
            "enumerated {} free and {} essential DoFs over {} active Elems",
            self.free.count(),
            self.essential.count(),
            active.len()
        );

        DofTable {
            vertex,
            edge,
            edge_orders,
            bubble,
            elem_orders: orders.to_vec(),
            essential: self.essential_dofs,
            num_free: self.free.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::mesh::h_refinement::HRef;
    use proptest::prelude::*;

    fn natural(_: u32) -> BcType {
        BcType::Natural
    }

    fn essential(_: u32) -> BcType {
        BcType::Essential
    }

    fn enumerate(mesh: &Mesh, p: PolyOrders, kind: SpaceKind, bc: &dyn Fn(u32) -> BcType) -> DofTable {
        let orders = vec![p; mesh.elems.len()];
        DofEnumerator::new().enumerate(mesh, &orders, kind, bc)
    }

    fn assert_bijection(table: &DofTable) {
        let mut free: Vec<usize> = table
            .all_dofs()
            .into_iter()
            .filter_map(|dof| match dof {
                DofRef::Free(idx) => Some(idx),
                DofRef::Essential(_) => None,
            })
            .collect();
        free.sort_unstable();
        assert_eq!(free, (0..table.num_free()).collect::<Vec<_>>());
    }

    #[test]
    fn h1_counts_on_quads() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();

        // 9 vertices + 12 edges * (p - 1) + 4 * (p - 1)^2
        for p in 1..5 {
            let table = enumerate(&mesh, PolyOrders::iso(p), SpaceKind::H1, &natural);
            let q = p as usize - 1;
            assert_eq!(table.num_free(), 9 + 12 * q + 4 * q * q);
            assert_bijection(&table);
        }

        let table = enumerate(&mesh, PolyOrders::from(3, 2), SpaceKind::H1, &natural);
        // 6 u-directed edges with 2 functions, 6 v-directed edges with 1, 4 bubbles of (2 * 1)
        assert_eq!(table.num_free(), 9 + 6 * 2 + 6 + 4 * 2);
    }

    #[test]
    fn h1_counts_on_triangles() {
        let mesh = Mesh::from_file("./test_input/square_tri.json").unwrap();
        let table = enumerate(&mesh, PolyOrders::iso(4), SpaceKind::H1, &natural);
        // 4 vertices + 5 edges * 3 + 2 * 3
        assert_eq!(table.num_free(), 4 + 15 + 6);
    }

    #[test]
    fn other_space_kinds() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();

        let hcurl = enumerate(&mesh, PolyOrders::iso(1), SpaceKind::HCurl, &natural);
        // 12 edges * 2 + 4 * (2 * 1 + 1 * 2)
        assert_eq!(hcurl.num_free(), 24 + 16);
        assert_bijection(&hcurl);

        let l2 = enumerate(&mesh, PolyOrders::iso(2), SpaceKind::L2, &natural);
        assert_eq!(l2.num_free(), 4 * 9);

        let tri = Mesh::from_file("./test_input/square_tri.json").unwrap();
        let hcurl_tri = enumerate(&tri, PolyOrders::iso(2), SpaceKind::HCurl, &natural);
        assert_eq!(hcurl_tri.num_free(), 5 * 3 + 2 * 6);
        let l2_tri = enumerate(&tri, PolyOrders::iso(1), SpaceKind::L2, &natural);
        assert_eq!(l2_tri.num_free(), 2 * 3);
    }

    #[test]
    fn essential_dofs_are_excluded() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        let table = enumerate(&mesh, PolyOrders::iso(3), SpaceKind::H1, &essential);

        // only the center vertex, 4 interior edges and the bubbles are free
        assert_eq!(table.num_free(), 1 + 4 * 2 + 4 * 4);
        // 8 boundary vertices + 8 boundary edges * 2
        assert_eq!(table.num_essential(), 8 + 16);
        assert_bijection(&table);
    }

    #[test]
    fn hanging_nodes_get_no_dofs() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        let table = enumerate(&mesh, PolyOrders::iso(2), SpaceKind::H1, &natural);

        // 9 + 3 regular new vertices (center + 2 boundary midpoints); the 2 hanging midpoints carry nothing
        let num_vertices = table.vertex.iter().flatten().count();
        assert_eq!(num_vertices, 12);
        // 8 untouched edges, the 2 split edges still seen by neighbours, 2 boundary halves per split boundary
        // edge and 4 interior edges; the halves on the neighbours' sides are constrained
        let num_edges = table.edge.iter().flatten().count();
        assert_eq!(num_edges, 8 + 2 + 4 + 4);
        assert_eq!(table.num_free(), 12 + 18 + 7);
        assert_bijection(&table);
    }

    #[test]
    fn constrained_sides_raise_owner_order() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        let mut orders = vec![PolyOrders::iso(2); mesh.elems.len()];
        orders[5] = PolyOrders::iso(4);
        let table = DofEnumerator::new().enumerate(&mesh, &orders, SpaceKind::H1, &natural);

        // the SE child sits on the W side of elem 1
        let owner = mesh.elems[1].edges[2];
        assert_eq!(table.edge_order(owner), 4);
        assert_eq!(table.side_order(&mesh, 5, 3), 4);
        assert_eq!(table.side_order(&mesh, 1, 2), 4);
    }

    proptest! {
        #[test]
        fn enumeration_is_a_bijection(
            picks in prop::collection::vec((0usize..64, 0u8..3), 0..8),
            p in 1u8..5,
        ) {
            let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
            for (pick, kind) in picks {
                let active = mesh.active_elem_ids();
                let target = active[pick % active.len()];
                mesh.refine_element(target, [HRef::T, HRef::U, HRef::V][kind as usize]).unwrap();
            }

            let orders: Vec<PolyOrders> = (0..mesh.elems.len())
                .map(|id| PolyOrders::from(p + (id % 2) as u8, p))
                .collect();
            let first = DofEnumerator::new().enumerate(&mesh, &orders, SpaceKind::H1, &natural);
            let second = DofEnumerator::new().enumerate(&mesh, &orders, SpaceKind::H1, &natural);

            assert_bijection(&first);
            prop_assert_eq!(first.num_free(), second.num_free());
        }
    }
}
