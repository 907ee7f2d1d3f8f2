/// A line between two Nodes
pub mod edge;
/// A Finite Element in reference space with its refinement bookkeeping
pub mod elem;
/// Vectors, matrices, points and affine maps
pub mod geometry;
/// Structures and Functions to facilitate (an)isotropic h-refinement
pub mod h_refinement;
/// A Point in Real Space
pub mod node;
/// Structures and Functions to facilitate anisotropic p-refinement
pub mod p_refinement;

use edge::Edge;
use elem::{Elem, ElemShape, ElemUninit};
use geometry::{M2D, Point, V2D};
use h_refinement::{HRef, HRefError, Regularity};
use node::Node;

use super::IdTracker;

use json::{object, JsonValue};
use log::{debug, trace};
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;
use std::fs::{read_to_string, File};
use std::io::BufWriter;
use thiserror::Error;

/// Minimum Edge length relative to its base Edge. h-Refinements will fail after edges are smaller than this value.
pub const MIN_EDGE_LENGTH: f64 = 3.0518e-5; // 15ish refinement layers

/// Maximum Polynomial order. p-Refinements will fail when an Elem's orders exceed this value.
pub const MAX_POLYNOMIAL_ORDER: u8 = 10;

/// Upper bound on the number of refinement passes used to restore mesh regularity
pub const MAX_REGULARIZATION_PASSES: usize = 64;

/// Marker given to boundary Edges that are not listed in a mesh description
pub const DEFAULT_BOUNDARY_MARKER: u32 = 1;

/// Description of one cell when building a Mesh from its parts
#[derive(Clone, Debug, PartialEq)]
pub struct CellSpec {
    /// 3 counter-clockwise vertices (triangle) or 4 vertices in `[SW, SE, NW, NE]` order (quad)
    pub node_ids: SmallVec<[usize; 4]>,
    pub marker: u32,
    pub curved: bool,
}

/// A marked boundary segment between two nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundarySpec {
    pub node_ids: [usize; 2],
    pub marker: u32,
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Unable to read Mesh file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse Mesh description: {0}")]
    Parse(String),
    #[error("Cell {cell} is invalid ({reason}); Cannot construct Mesh!")]
    InvalidCell { cell: usize, reason: String },
    #[error("Edge between Nodes {0:?} is shared by more than two cells; Cannot construct Mesh!")]
    NonManifoldEdge([usize; 2]),
    #[error("Mesh description has no cells; Cannot construct Mesh!")]
    Empty,
    #[error("Node {0} does not exist!")]
    NodeDoesntExist(usize),
    #[error("Elem {0} does not exist!")]
    ElemDoesntExist(usize),
    #[error(transparent)]
    HRef(#[from] HRefError),
}

/// The geometric structure and refinement state of a Domain.
///
/// `Elem`s, `Edge`s and `Node`s live in arenas and refer to each other by id. Refinement only ever
/// appends to these arenas, so ids are stable for the lifetime of the Mesh.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub elems: Vec<Elem>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    num_base_elems: usize,
    num_base_nodes: usize,
    num_base_edges: usize,
}

impl Mesh {
    /// Construct a Mesh from a JSON file with the following format
    ///
    /// ```text
    ///     2               3               4
    /// 1.0 *---------------*---------------*
    ///     |               |             / |
    ///     |       0       |    1      /   |
    ///     |               |         /  2  |
    /// 0.0 *---------------*-------*-------*
    ///  y  0               1               5
    ///  x 0.0             1.0             2.0
    /// ```
    ///
    /// mesh.json
    /// ```JSON
    /// {
    ///     "Nodes": [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [2.0, 1.0], [2.0, 0.0]],
    ///     "Elements": [
    ///         { "node_ids": [0, 1, 2, 3], "marker": 1 },
    ///         { "node_ids": [1, 4, 3], "marker": 2 },
    ///         { "node_ids": [1, 5, 4], "marker": 2, "curved": false }
    ///     ],
    ///     "Boundaries": [
    ///         { "node_ids": [0, 1], "marker": 1 },
    ///         { "node_ids": [5, 4], "marker": 2 }
    ///     ]
    /// }
    /// ```
    ///
    /// Quads list their nodes as `[SW, SE, NW, NE]`; triangles counter-clockwise.
    /// Boundary segments that are not listed get [DEFAULT_BOUNDARY_MARKER].
    pub fn from_file(path: impl AsRef<str>) -> Result<Self, MeshError> {
        let mesh_file_contents = read_to_string(path.as_ref())?;
        Self::from_json_str(&mesh_file_contents)
    }

    /// Construct a Mesh from the contents of a JSON mesh description (see [Mesh::from_file])
    pub fn from_json_str(contents: &str) -> Result<Self, MeshError> {
        let mesh_json = json::parse(contents).map_err(|err| MeshError::Parse(err.to_string()))?;

        let points = parse_node_information(&mesh_json)?;
        let cells = parse_element_information(&mesh_json)?;
        let boundaries = parse_boundary_information(&mesh_json)?;

        Self::from_parts(points, cells, boundaries)
    }

    /// Construct a Mesh from a list of points, cells and marked boundary segments
    pub fn from_parts(
        points: Vec<Point>,
        cells: Vec<CellSpec>,
        boundaries: Vec<BoundarySpec>,
    ) -> Result<Self, MeshError> {
        if cells.is_empty() {
            return Err(MeshError::Empty);
        }

        let mut shapes = Vec::with_capacity(cells.len());
        for (cell_id, cell) in cells.iter().enumerate() {
            shapes.push(validate_cell(cell_id, cell, &points)?);
        }

        // {[lower node, upper node] => edge id}, with edge ids assigned in order of first appearance
        let mut edge_ids_by_nodes: BTreeMap<[usize; 2], usize> = BTreeMap::new();
        let mut edge_nodes: Vec<[usize; 2]> = Vec::new();
        let mut edge_use_counts: Vec<usize> = Vec::new();
        let mut elem_edges: Vec<SmallVec<[usize; 4]>> = Vec::with_capacity(cells.len());

        for (cell, shape) in cells.iter().zip(shapes.iter()) {
            let mut sides = SmallVec::new();
            for side in 0..shape.num_sides() {
                let [a, b] = shape.side_vertices(side).map(|v| cell.node_ids[v]);
                let key = sorted_pair(a, b);
                let edge_id = *edge_ids_by_nodes.entry(key).or_insert_with(|| {
                    edge_nodes.push(key);
                    edge_use_counts.push(0);
                    edge_nodes.len() - 1
                });
                edge_use_counts[edge_id] += 1;
                if edge_use_counts[edge_id] > 2 {
                    return Err(MeshError::NonManifoldEdge(key));
                }
                sides.push(edge_id);
            }
            elem_edges.push(sides);
        }

        let boundary_markers: BTreeMap<[usize; 2], u32> = boundaries
            .iter()
            .map(|bs| (sorted_pair(bs.node_ids[0], bs.node_ids[1]), bs.marker))
            .collect();

        let mut edges: Vec<Edge> = edge_nodes
            .iter()
            .enumerate()
            .map(|(edge_id, node_ids)| {
                Edge::new(
                    edge_id,
                    *node_ids,
                    edge_use_counts[edge_id] == 1,
                    boundary_markers
                        .get(node_ids)
                        .copied()
                        .unwrap_or(DEFAULT_BOUNDARY_MARKER),
                )
            })
            .collect();

        let mut boundary_nodes = vec![false; points.len()];
        for edge in edges.iter().filter(|edge| edge.boundary) {
            boundary_nodes[edge.nodes[0]] = true;
            boundary_nodes[edge.nodes[1]] = true;
        }

        let nodes: Vec<Node> = points
            .iter()
            .enumerate()
            .map(|(node_id, point)| Node::new(node_id, *point, boundary_nodes[node_id]))
            .collect();

        let elems: Vec<Elem> = cells
            .into_iter()
            .zip(shapes)
            .zip(elem_edges)
            .enumerate()
            .map(|(elem_id, ((cell, shape), edge_ids))| {
                for edge_id in edge_ids.iter() {
                    edges[*edge_id].connect_elem(elem_id);
                }
                Elem::new(elem_id, shape, cell.node_ids, edge_ids, cell.marker, cell.curved)
            })
            .collect();

        Ok(Self {
            num_base_elems: elems.len(),
            num_base_nodes: nodes.len(),
            num_base_edges: edges.len(),
            elems,
            nodes,
            edges,
        })
    }

    /// A rectangular grid of `nx` by `ny` quads spanning `[p0, p1]`; every boundary segment gets `boundary_marker`
    pub fn rectangle_grid(
        nx: usize,
        ny: usize,
        p0: Point,
        p1: Point,
        boundary_marker: u32,
    ) -> Result<Self, MeshError> {
        let points = (0..=ny)
            .flat_map(|j| {
                (0..=nx).map(move |i| {
                    Point::new(
                        p0.x + (p1.x - p0.x) * i as f64 / nx as f64,
                        p0.y + (p1.y - p0.y) * j as f64 / ny as f64,
                    )
                })
            })
            .collect();

        let node_id = |i: usize, j: usize| j * (nx + 1) + i;
        let cells = (0..ny)
            .flat_map(|j| {
                (0..nx).map(move |i| CellSpec {
                    node_ids: smallvec![
                        node_id(i, j),
                        node_id(i + 1, j),
                        node_id(i, j + 1),
                        node_id(i + 1, j + 1)
                    ],
                    marker: 0,
                    curved: false,
                })
            })
            .collect();

        let mut boundaries = Vec::new();
        for i in 0..nx {
            boundaries.push([node_id(i, 0), node_id(i + 1, 0)]);
            boundaries.push([node_id(i, ny), node_id(i + 1, ny)]);
        }
        for j in 0..ny {
            boundaries.push([node_id(0, j), node_id(0, j + 1)]);
            boundaries.push([node_id(nx, j), node_id(nx, j + 1)]);
        }

        Self::from_parts(
            points,
            cells,
            boundaries
                .into_iter()
                .map(|node_ids| BoundarySpec {
                    node_ids,
                    marker: boundary_marker,
                })
                .collect(),
        )
    }

    /// A single quad over the unit square
    pub fn unit() -> Self {
        let corner = |x, y| Point::new(x, y);
        let edges = [([0, 1], 0), ([2, 3], 1), ([0, 2], 2), ([1, 3], 3)];

        let mut mesh = Self {
            elems: vec![Elem::new(
                0,
                ElemShape::Quad,
                smallvec![0, 1, 2, 3],
                smallvec![0, 1, 2, 3],
                0,
                false,
            )],
            nodes: [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
                .iter()
                .enumerate()
                .map(|(id, (x, y))| Node::new(id, corner(*x, *y), true))
                .collect(),
            edges: edges
                .iter()
                .map(|(nodes, id)| Edge::new(*id, *nodes, true, DEFAULT_BOUNDARY_MARKER))
                .collect(),
            num_base_elems: 1,
            num_base_nodes: 4,
            num_base_edges: 4,
        };
        for edge in mesh.edges.iter_mut() {
            edge.connect_elem(0);
        }
        mesh
    }

    /// Print the mesh to a JSON file specified by path.
    #[cfg(feature = "json_export")]
    pub fn export_to_json(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        let f = File::create(path.as_ref())?;
        let mut w = BufWriter::new(&f);

        let mesh_object = object! {
            "Elems": JsonValue::from(self.elems.iter().map(|elem| elem.to_json()).collect::<Vec<_>>()),
            "Nodes": JsonValue::from(self.nodes.iter().map(|node| node.to_json()).collect::<Vec<_>>()),
            "Edges": JsonValue::from(self.edges.iter().map(|edge| edge.to_json()).collect::<Vec<_>>()),
        };

        mesh_object.write_pretty(&mut w, 4)?;

        Ok(())
    }

    // ----------------------------------------------------------------------------------------------------
    // General Data Retrieval
    // ----------------------------------------------------------------------------------------------------

    /// One past the largest Elem id (inactive and removed Elems included)
    pub fn max_element_id(&self) -> usize {
        self.elems.len()
    }

    pub fn num_base_elements(&self) -> usize {
        self.num_base_elems
    }

    pub fn num_active_elements(&self) -> usize {
        self.active_elems().count()
    }

    /// Iterate over the leaves of the refinement tree
    pub fn active_elems(&self) -> impl Iterator<Item = &Elem> + '_ {
        self.elems.iter().filter(|elem| elem.is_active())
    }

    pub fn active_elem_ids(&self) -> Vec<usize> {
        self.active_elems().map(|elem| elem.id).collect()
    }

    /// `false` for unknown ids
    pub fn is_active(&self, elem_id: usize) -> bool {
        self.elems.get(elem_id).map_or(false, |elem| elem.is_active())
    }

    /// Get the [Point]s at the vertices of an [`Elem`]
    pub fn elem_points(&self, elem_id: usize) -> SmallVec<[Point; 4]> {
        self.elems[elem_id]
            .nodes
            .iter()
            .map(|node_id| self.nodes[*node_id].coords)
            .collect()
    }

    /// Get the two [Point]s composing an [`Edge`]
    pub fn edge_points(&self, edge_id: usize) -> [Point; 2] {
        self.edges[edge_id].nodes.map(|node_id| self.nodes[node_id].coords)
    }

    /// Get a list of an [`Elem`]s descendant's IDs
    pub fn descendant_elems(
        &self,
        elem_id: usize,
        include_starting_elem: bool,
    ) -> Result<Vec<usize>, MeshError> {
        if elem_id >= self.elems.len() {
            Err(MeshError::ElemDoesntExist(elem_id))
        } else {
            let mut descendants = Vec::new();
            self.rec_descendant_elems(elem_id, include_starting_elem, &mut descendants);
            Ok(descendants)
        }
    }

    fn rec_descendant_elems(&self, elem_id: usize, include: bool, desc: &mut Vec<usize>) {
        if include {
            desc.push(elem_id);
        }
        if let Some(child_elem_ids) = self.elems[elem_id].child_ids() {
            for cei in child_elem_ids {
                self.rec_descendant_elems(cei, true, desc);
            }
        }
    }

    /// The active Elems covering an Elem (the Elem itself if it is active)
    pub fn active_descendants(&self, elem_id: usize) -> Result<Vec<usize>, MeshError> {
        Ok(self
            .descendant_elems(elem_id, true)?
            .into_iter()
            .filter(|id| self.elems[*id].is_active())
            .collect())
    }

    /// Get a list of an [`Elem`]s ancestors's IDs (nearest first)
    pub fn ancestor_elems(
        &self,
        elem_id: usize,
        include_starting_elem: bool,
    ) -> Result<Vec<usize>, MeshError> {
        if elem_id >= self.elems.len() {
            return Err(MeshError::ElemDoesntExist(elem_id));
        }
        let mut ancestors = Vec::new();
        if include_starting_elem {
            ancestors.push(elem_id);
        }
        let mut current = elem_id;
        while let Some(parent_id) = self.elems[current].parent_id() {
            ancestors.push(parent_id);
            current = parent_id;
        }
        Ok(ancestors)
    }

    /// Does any active Elem use this Edge as one of its sides
    pub fn edge_has_active_elem(&self, edge_id: usize) -> bool {
        self.edges[edge_id]
            .elem_ids()
            .iter()
            .any(|elem_id| self.elems[*elem_id].is_active())
    }

    /// Active Elems that use this Edge as one of their sides (at most one per side of the Edge)
    pub fn active_elems_on_edge(&self, edge_id: usize) -> SmallVec<[usize; 2]> {
        self.edges[edge_id]
            .elem_ids()
            .iter()
            .copied()
            .filter(|elem_id| self.elems[*elem_id].is_active())
            .collect()
    }

    /// Find the Edge constraining an active side.
    ///
    /// A side is constrained when nothing on its other side is active at its own level, but an ancestor Edge is still
    /// the side of an active Elem there. Returns that ancestor and the parametric range `[a, b] ⊂ [-1, 1]` which this
    /// Edge covers along it (both in the ancestor's orientation).
    pub fn constraining_edge(&self, edge_id: usize) -> Option<(usize, [f64; 2])> {
        if self.active_elems_on_edge(edge_id).len() >= 2 {
            return None;
        }

        let mut range = [-1.0, 1.0];
        let mut current = edge_id;
        while let Some(parent_id) = self.edges[current].parent_id() {
            let first_child = self.edges[parent_id].child_ids().map(|ids| ids[0]);
            range = if first_child == Some(current) {
                range.map(|t| (t - 1.0) / 2.0)
            } else {
                range.map(|t| (t + 1.0) / 2.0)
            };

            if self.edge_has_active_elem(parent_id) {
                return Some((parent_id, range));
            }
            current = parent_id;
        }

        None
    }

    /// Find the constraint on a hanging Node: the Edge it sits on (as seen by an active Elem) and its
    /// parametric position along that Edge. Returns `None` for regular Nodes.
    pub fn hanging_constraint(&self, node_id: usize) -> Option<(usize, f64)> {
        let mut current = self.nodes[node_id].parent_edge()?;
        let mut t = 0.0;

        loop {
            if self.edge_has_active_elem(current) {
                return Some((current, t));
            }
            let parent_id = self.edges[current].parent_id()?;
            let first_child = self.edges[parent_id].child_ids().map(|ids| ids[0]);
            t = if first_child == Some(current) {
                (t - 1.0) / 2.0
            } else {
                (t + 1.0) / 2.0
            };
            current = parent_id;
        }
    }

    /// Does an Elem traverse one of its sides against the global orientation of the Edge
    pub fn side_is_flipped(&self, elem_id: usize, side: usize) -> bool {
        let elem = &self.elems[elem_id];
        let [a, _] = elem.shape.side_vertices(side);
        self.edges[elem.edges[side]].nodes[0] != elem.nodes[a]
    }

    /// Physical point and Jacobian (d(x, y) / d(ξ, η)) at a point in an Elem's reference coordinates
    pub fn geometry(&self, elem_id: usize, xi: V2D) -> (Point, M2D) {
        let elem = &self.elems[elem_id];
        let (point, base_jacobian) = self.base_geometry(elem.base_id, elem.map.apply(xi));
        (point, base_jacobian * elem.map.a)
    }

    /// Physical point and Jacobian of a base Elem's map (bilinear for quads, affine for triangles)
    pub fn base_geometry(&self, base_id: usize, root: V2D) -> (Point, M2D) {
        let base = &self.elems[base_id];
        let p = |k: usize| self.nodes[base.nodes[k]].coords.as_v2d();
        let (xi, eta) = (root[0], root[1]);

        match base.shape {
            ElemShape::Quad => {
                let n = [
                    (1.0 - xi) * (1.0 - eta) / 4.0,
                    (1.0 + xi) * (1.0 - eta) / 4.0,
                    (1.0 - xi) * (1.0 + eta) / 4.0,
                    (1.0 + xi) * (1.0 + eta) / 4.0,
                ];
                let dn_dxi = [-(1.0 - eta) / 4.0, (1.0 - eta) / 4.0, -(1.0 + eta) / 4.0, (1.0 + eta) / 4.0];
                let dn_deta = [-(1.0 - xi) / 4.0, -(1.0 + xi) / 4.0, (1.0 - xi) / 4.0, (1.0 + xi) / 4.0];

                let (mut x, mut dxi, mut deta) = (V2D::zero(), V2D::zero(), V2D::zero());
                for k in 0..4 {
                    x = x + p(k) * n[k];
                    dxi = dxi + p(k) * dn_dxi[k];
                    deta = deta + p(k) * dn_deta[k];
                }
                (x.into(), M2D::from_cols(dxi, deta))
            }
            ElemShape::Tri => {
                let l = [-(xi + eta) / 2.0, (1.0 + xi) / 2.0, (1.0 + eta) / 2.0];
                let x = p(0) * l[0] + p(1) * l[1] + p(2) * l[2];
                (
                    x.into(),
                    M2D::from_cols((p(1) - p(0)) / 2.0, (p(2) - p(0)) / 2.0),
                )
            }
        }
    }

    /// Find the active Elem containing a point of a base Elem (given in the base Elem's reference coordinates),
    /// along with the point's reference coordinates on that Elem
    pub fn locate(&self, base_id: usize, root: V2D) -> (usize, V2D) {
        let mut current = base_id;
        while let Some(children) = self.elems[current].child_ids() {
            let best = children
                .iter()
                .map(|child_id| {
                    let child = &self.elems[*child_id];
                    let xi = child.map.inverse_apply(root);
                    (*child_id, child.shape.outside_distance(xi))
                })
                .fold((children[0], f64::MAX), |best, candidate| {
                    if candidate.1 < best.1 {
                        candidate
                    } else {
                        best
                    }
                });
            current = best.0;
        }
        (current, self.elems[current].map.inverse_apply(root))
    }

    // ----------------------------------------------------------------------------------------------------
    // h-refinement methods
    // ----------------------------------------------------------------------------------------------------

    /// Apply an [HRef] to one [Elem]
    pub fn refine_element(&mut self, elem_id: usize, refinement: HRef) -> Result<(), HRefError> {
        self.refine_elements(vec![(elem_id, refinement)])
    }

    /// Isotropically refine every active [Elem]
    pub fn refine_all_elements(&mut self) -> Result<(), HRefError> {
        self.refine_elements(
            self.active_elems()
                .map(|elem| (elem.id, HRef::T))
                .collect(),
        )
    }

    /// Refine (isotropically) the active Elems having a side on a boundary with the given marker, `levels` times
    pub fn refine_towards_boundary(&mut self, marker: u32, levels: usize) -> Result<(), HRefError> {
        for _ in 0..levels {
            let targets: Vec<(usize, HRef)> = self
                .active_elems()
                .filter(|elem| {
                    elem.edges.iter().any(|edge_id| {
                        let edge = &self.edges[*edge_id];
                        edge.boundary && edge.marker == marker
                    })
                })
                .map(|elem| (elem.id, HRef::T))
                .collect();

            debug!(
                "refining {} Elems towards boundary marker {}",
                targets.len(),
                marker
            );
            self.refine_elements(targets)?;
        }
        Ok(())
    }

    /// Refine (isotropically) the active Elems having the given Node as a vertex, `levels` times
    pub fn refine_towards_vertex(&mut self, node_id: usize, levels: usize) -> Result<(), MeshError> {
        if node_id >= self.nodes.len() {
            return Err(MeshError::NodeDoesntExist(node_id));
        }
        for _ in 0..levels {
            let targets: Vec<(usize, HRef)> = self
                .active_elems()
                .filter(|elem| elem.nodes.contains(&node_id))
                .map(|elem| (elem.id, HRef::T))
                .collect();
            self.refine_elements(targets)?;
        }
        Ok(())
    }

    /// Execute a series of [HRef]s on [Elem]s specified by their id.
    ///
    /// All refinements are validated before any of them is applied.
    pub fn refine_elements(&mut self, refinements: Vec<(usize, HRef)>) -> Result<(), HRefError> {
        let mut refinements_map: BTreeMap<usize, HRef> = BTreeMap::new();
        for (elem_id, h_ref) in refinements {
            if elem_id >= self.elems.len() {
                return Err(HRefError::ElemDoesntExist(elem_id));
            }
            if !self.elems[elem_id].is_active() {
                return Err(HRefError::ElemNotActive(elem_id));
            }
            if refinements_map.insert(elem_id, h_ref).is_some() {
                return Err(HRefError::DoubleRefinement(elem_id));
            }
            self.check_h_refineable(elem_id, h_ref)?;
        }

        let mut elem_id_tracker = self.elems.len();
        let mut node_id_tracker = IdTracker::new(self.nodes.len());
        let mut edge_id_tracker = IdTracker::new(self.edges.len());

        for (elem_id, refinement) in refinements_map {
            let new_uninitialized_elems =
                self.elems[elem_id].h_refine(refinement, &mut elem_id_tracker)?;

            let new_elems = match (refinement, self.elems[elem_id].shape) {
                (HRef::T, ElemShape::Quad) => self.execute_t_refinement(
                    new_uninitialized_elems,
                    elem_id,
                    &mut node_id_tracker,
                    &mut edge_id_tracker,
                )?,
                (HRef::U, ElemShape::Quad) => self.execute_u_refinement(
                    new_uninitialized_elems,
                    elem_id,
                    &mut node_id_tracker,
                    &mut edge_id_tracker,
                )?,
                (HRef::V, ElemShape::Quad) => self.execute_v_refinement(
                    new_uninitialized_elems,
                    elem_id,
                    &mut node_id_tracker,
                    &mut edge_id_tracker,
                )?,
                (HRef::T, ElemShape::Tri) => self.execute_bisection(
                    new_uninitialized_elems,
                    elem_id,
                    &mut node_id_tracker,
                    &mut edge_id_tracker,
                )?,
                (aniso, ElemShape::Tri) => return Err(HRefError::AnisoOnTriangle(aniso)),
            };

            trace!("Elem {} refined ({:?})", elem_id, refinement);
            self.elems.extend(new_elems);
        }

        Ok(())
    }

    // check the refinement against the Elem's shape and the minimum edge length
    fn check_h_refineable(&self, elem_id: usize, refinement: HRef) -> Result<(), HRefError> {
        let elem = &self.elems[elem_id];
        let split_sides: &[usize] = match (refinement, elem.shape) {
            (HRef::T, ElemShape::Quad) => &[0, 1, 2, 3],
            (HRef::U, ElemShape::Quad) => &[0, 1],
            (HRef::V, ElemShape::Quad) => &[2, 3],
            (HRef::T, ElemShape::Tri) => &[0],
            (aniso, ElemShape::Tri) => return Err(HRefError::AnisoOnTriangle(aniso)),
        };

        for side in split_sides {
            let edge = &self.edges[elem.edges[*side]];
            if !edge.has_children() && edge.length / 2.0 < MIN_EDGE_LENGTH {
                return Err(HRefError::MinEdgeLength(edge.id));
            }
        }
        Ok(())
    }

    fn execute_t_refinement(
        &mut self,
        mut new_elems: Vec<ElemUninit>,
        parent_elem_id: usize,
        node_id_tracker: &mut IdTracker,
        edge_id_tracker: &mut IdTracker,
    ) -> Result<Vec<Elem>, HRefError> {
        assert_eq!(new_elems.len(), 4);
        let parent = &self.elems[parent_elem_id];
        let [n0, n1, n2, n3] = [parent.nodes[0], parent.nodes[1], parent.nodes[2], parent.nodes[3]];
        let [e_s, e_n, e_w, e_e] = [parent.edges[0], parent.edges[1], parent.edges[2], parent.edges[3]];

        // split (or reuse the splits of) the outer edges
        let (m_s, [s0, s1]) = self.h_refine_edge_if_needed(e_s, n0, node_id_tracker, edge_id_tracker)?;
        let (m_n, [n_0, n_1]) = self.h_refine_edge_if_needed(e_n, n2, node_id_tracker, edge_id_tracker)?;
        let (m_w, [w0, w1]) = self.h_refine_edge_if_needed(e_w, n0, node_id_tracker, edge_id_tracker)?;
        let (m_e, [e0, e1]) = self.h_refine_edge_if_needed(e_e, n1, node_id_tracker, edge_id_tracker)?;

        // create a new node in the center of the parent Elem
        let center_node_id = node_id_tracker.next_id();
        assert_eq!(center_node_id, self.nodes.len());
        let (center_point, _) = self.geometry(parent_elem_id, V2D::zero());
        self.nodes.push(Node::new(center_node_id, center_point, false));

        // four interior edges meeting at the center
        let vertical = self.edges[e_w].length.min(self.edges[e_e].length) / 2.0;
        let horizontal = self.edges[e_s].length.min(self.edges[e_n].length) / 2.0;
        let i_s = self.new_edge_between_nodes([m_s, center_node_id], vertical, edge_id_tracker);
        let i_n = self.new_edge_between_nodes([center_node_id, m_n], vertical, edge_id_tracker);
        let i_w = self.new_edge_between_nodes([m_w, center_node_id], horizontal, edge_id_tracker);
        let i_e = self.new_edge_between_nodes([center_node_id, m_e], horizontal, edge_id_tracker);

        let c = center_node_id;
        let layout = [
            ([n0, m_s, m_w, c], [s0, i_w, w0, i_s]),
            ([m_s, n1, c, m_e], [s1, i_e, i_s, e0]),
            ([m_w, c, n2, m_n], [i_w, n_0, w1, i_n]),
            ([c, m_e, m_n, n3], [i_e, n_1, i_n, e1]),
        ];
        for (elem_uninit, (nodes, edges)) in new_elems.iter_mut().zip(layout) {
            connect_uninit(elem_uninit, &nodes, &edges);
        }

        self.upgrade_uninit_elems(new_elems)
    }

    fn execute_u_refinement(
        &mut self,
        mut new_elems: Vec<ElemUninit>,
        parent_elem_id: usize,
        node_id_tracker: &mut IdTracker,
        edge_id_tracker: &mut IdTracker,
    ) -> Result<Vec<Elem>, HRefError> {
        assert_eq!(new_elems.len(), 2);
        let parent = &self.elems[parent_elem_id];
        let [n0, n1, n2, n3] = [parent.nodes[0], parent.nodes[1], parent.nodes[2], parent.nodes[3]];
        let [e_s, e_n, e_w, e_e] = [parent.edges[0], parent.edges[1], parent.edges[2], parent.edges[3]];

        let (m_s, [s0, s1]) = self.h_refine_edge_if_needed(e_s, n0, node_id_tracker, edge_id_tracker)?;
        let (m_n, [n_0, n_1]) = self.h_refine_edge_if_needed(e_n, n2, node_id_tracker, edge_id_tracker)?;

        // create a new Edge between the two new Nodes
        let length = self.edges[e_w].length.min(self.edges[e_e].length);
        let i_m = self.new_edge_between_nodes([m_s, m_n], length, edge_id_tracker);

        let layout = [
            ([n0, m_s, n2, m_n], [s0, n_0, e_w, i_m]),
            ([m_s, n1, m_n, n3], [s1, n_1, i_m, e_e]),
        ];
        for (elem_uninit, (nodes, edges)) in new_elems.iter_mut().zip(layout) {
            connect_uninit(elem_uninit, &nodes, &edges);
        }

        self.upgrade_uninit_elems(new_elems)
    }

    fn execute_v_refinement(
        &mut self,
        mut new_elems: Vec<ElemUninit>,
        parent_elem_id: usize,
        node_id_tracker: &mut IdTracker,
        edge_id_tracker: &mut IdTracker,
    ) -> Result<Vec<Elem>, HRefError> {
        assert_eq!(new_elems.len(), 2);
        let parent = &self.elems[parent_elem_id];
        let [n0, n1, n2, n3] = [parent.nodes[0], parent.nodes[1], parent.nodes[2], parent.nodes[3]];
        let [e_s, e_n, e_w, e_e] = [parent.edges[0], parent.edges[1], parent.edges[2], parent.edges[3]];

        let (m_w, [w0, w1]) = self.h_refine_edge_if_needed(e_w, n0, node_id_tracker, edge_id_tracker)?;
        let (m_e, [e0, e1]) = self.h_refine_edge_if_needed(e_e, n1, node_id_tracker, edge_id_tracker)?;

        let length = self.edges[e_s].length.min(self.edges[e_n].length);
        let i_m = self.new_edge_between_nodes([m_w, m_e], length, edge_id_tracker);

        let layout = [
            ([n0, n1, m_w, m_e], [e_s, i_m, w0, e0]),
            ([m_w, m_e, n2, n3], [i_m, e_n, w1, e1]),
        ];
        for (elem_uninit, (nodes, edges)) in new_elems.iter_mut().zip(layout) {
            connect_uninit(elem_uninit, &nodes, &edges);
        }

        self.upgrade_uninit_elems(new_elems)
    }

    // bisect side 0 of a triangle, connecting its midpoint to the opposite vertex
    fn execute_bisection(
        &mut self,
        mut new_elems: Vec<ElemUninit>,
        parent_elem_id: usize,
        node_id_tracker: &mut IdTracker,
        edge_id_tracker: &mut IdTracker,
    ) -> Result<Vec<Elem>, HRefError> {
        assert_eq!(new_elems.len(), 2);
        let parent = &self.elems[parent_elem_id];
        let [v0, v1, v2] = [parent.nodes[0], parent.nodes[1], parent.nodes[2]];
        let [e0, e1, e2] = [parent.edges[0], parent.edges[1], parent.edges[2]];

        let (mid, [a0, a1]) = self.h_refine_edge_if_needed(e0, v0, node_id_tracker, edge_id_tracker)?;

        let length = self.edges[e1].length.min(self.edges[e2].length) / 2.0;
        let i_m = self.new_edge_between_nodes([v2, mid], length, edge_id_tracker);

        let layout = [([v2, v0, mid], [e2, a0, i_m]), ([v1, v2, mid], [e1, i_m, a1])];
        for (elem_uninit, (nodes, edges)) in new_elems.iter_mut().zip(layout) {
            connect_uninit(elem_uninit, &nodes, &edges);
        }

        self.upgrade_uninit_elems(new_elems)
    }

    // Returns the midpoint Node and the child Edges ordered starting from `from_node`
    fn h_refine_edge_if_needed(
        &mut self,
        parent_edge_id: usize,
        from_node: usize,
        node_id_tracker: &mut IdTracker,
        edge_id_tracker: &mut IdTracker,
    ) -> Result<(usize, [usize; 2]), HRefError> {
        if !self.edges[parent_edge_id].has_children() {
            let new_edge_ids = edge_id_tracker.next_two_ids();
            let new_node_id = node_id_tracker.next_id();

            let new_edges = self.edges[parent_edge_id].h_refine(new_edge_ids, new_node_id)?;
            assert_eq!(new_edge_ids[0], self.edges.len());
            self.edges.extend(new_edges);

            let [p0, p1] = self.edge_points(parent_edge_id);
            assert_eq!(new_node_id, self.nodes.len());
            self.nodes.push(Node::on_edge(
                new_node_id,
                Point::between(&p0, &p1),
                self.edges[parent_edge_id].boundary,
                parent_edge_id,
            ));
        }

        let edge = &self.edges[parent_edge_id];
        match (edge.child_ids(), edge.child_node_id()) {
            (Some([c0, c1]), Some(mid)) => Ok(if edge.nodes[0] == from_node {
                (mid, [c0, c1])
            } else {
                (mid, [c1, c0])
            }),
            _ => Err(HRefError::MinEdgeLength(parent_edge_id)),
        }
    }

    fn new_edge_between_nodes(
        &mut self,
        node_ids: [usize; 2],
        length: f64,
        edge_id_tracker: &mut IdTracker,
    ) -> usize {
        assert_ne!(node_ids[0], node_ids[1]);
        let new_edge_id = edge_id_tracker.next_id();
        assert_eq!(new_edge_id, self.edges.len());

        self.edges
            .push(Edge::interior(new_edge_id, node_ids, length, 0));
        new_edge_id
    }

    fn upgrade_uninit_elems(
        &mut self,
        elems_uninit: Vec<ElemUninit>,
    ) -> Result<Vec<Elem>, HRefError> {
        let mut elems = Vec::with_capacity(elems_uninit.len());
        for elem_uninit in elems_uninit {
            elems.push(elem_uninit.into_elem()?);
        }

        for elem in elems.iter() {
            for edge_id in elem.edges.iter() {
                self.edges[*edge_id].connect_elem(elem.id);
            }
        }

        Ok(elems)
    }

    /// Undo the h-refinement of an [Elem] whose children are all active.
    ///
    /// The children stay in the arena (flagged as removed) so ids remain stable.
    pub fn unrefine_element(&mut self, elem_id: usize) -> Result<(), HRefError> {
        let elem = self
            .elems
            .get(elem_id)
            .ok_or(HRefError::ElemDoesntExist(elem_id))?;
        match elem.child_ids() {
            Some(children) if children.iter().all(|c| self.elems[*c].is_active()) => {
                if let Some(children) = self.elems[elem_id].merge_children() {
                    for child_id in children {
                        self.elems[child_id].mark_removed();
                    }
                }
                Ok(())
            }
            _ => Err(HRefError::NotMergeable(elem_id)),
        }
    }

    /// Refine large Elems until no active side is more than `k` levels below its constraining Edge.
    ///
    /// Returns the ids of the Elems that were refined.
    pub fn regularize(&mut self, regularity: Regularity) -> Result<Vec<usize>, HRefError> {
        let max_level = match regularity {
            Regularity::Arbitrary => return Ok(Vec::new()),
            Regularity::MaxLevel(k) => k,
        };

        let mut refined = Vec::new();
        for pass in 0..MAX_REGULARIZATION_PASSES {
            let mut violations: BTreeMap<usize, HRef> = BTreeMap::new();

            for elem in self.active_elems() {
                for edge_id in elem.edges.iter() {
                    let (constraining_id, _) = match self.constraining_edge(*edge_id) {
                        Some(constraint) => constraint,
                        None => continue,
                    };
                    if self.edges[*edge_id].level - self.edges[constraining_id].level <= max_level {
                        continue;
                    }

                    for big_id in self.active_elems_on_edge(constraining_id) {
                        let big = &self.elems[big_id];
                        let refinement = match (big.shape, big.side_of_edge(constraining_id)) {
                            (ElemShape::Quad, Some(0 | 1)) => HRef::U,
                            (ElemShape::Quad, _) => HRef::V,
                            (ElemShape::Tri, _) => HRef::T,
                        };
                        violations
                            .entry(big_id)
                            .and_modify(|current| {
                                if *current != refinement {
                                    *current = HRef::T
                                }
                            })
                            .or_insert(refinement);
                    }
                }
            }

            if violations.is_empty() {
                return Ok(refined);
            }

            debug!(
                "regularization pass {}: refining {} Elems",
                pass,
                violations.len()
            );
            refined.extend(violations.keys().copied());
            self.refine_elements(violations.into_iter().collect())?;
        }

        Err(HRefError::RegularityCascade(MAX_REGULARIZATION_PASSES))
    }

    // ----------------------------------------------------------------------------------------------------
    // copies
    // ----------------------------------------------------------------------------------------------------

    /// A full duplicate (refinement history included)
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// A duplicate containing only the base Elems
    pub fn copy_base(&self) -> Result<Self, MeshError> {
        let points = self.nodes[..self.num_base_nodes]
            .iter()
            .map(|node| node.coords)
            .collect();
        let cells = self.elems[..self.num_base_elems]
            .iter()
            .map(|elem| CellSpec {
                node_ids: elem.nodes.clone(),
                marker: elem.marker,
                curved: elem.curved,
            })
            .collect();
        let boundaries = self.edges[..self.num_base_edges]
            .iter()
            .filter(|edge| edge.boundary)
            .map(|edge| BoundarySpec {
                node_ids: edge.nodes,
                marker: edge.marker,
            })
            .collect();

        Self::from_parts(points, cells, boundaries)
    }

    /// A duplicate whose base Elems are the children of this Mesh's base Elems.
    /// Base Elems that were never refined stay base Elems.
    ///
    /// Refinements below that first level are replayed in their original order. Interfaces between first-level
    /// Elems that do not match node-for-node become boundary segments of the copy.
    pub fn copy_refine(&self) -> Result<Self, MeshError> {
        // unrefined base Elems carry over as they are
        let roots: Vec<usize> = self
            .elems
            .iter()
            .filter(|elem| {
                !elem.is_removed()
                    && (elem.level == 1 || (elem.level == 0 && elem.is_active()))
            })
            .map(|elem| elem.id)
            .collect();

        let mut node_map: BTreeMap<usize, usize> = BTreeMap::new();
        let mut points = Vec::new();
        let mut cells = Vec::with_capacity(roots.len());
        let mut boundaries = Vec::new();

        for root_id in roots.iter() {
            let root = &self.elems[*root_id];
            let node_ids: SmallVec<[usize; 4]> = root
                .nodes
                .iter()
                .map(|node_id| {
                    *node_map.entry(*node_id).or_insert_with(|| {
                        points.push(self.nodes[*node_id].coords);
                        points.len() - 1
                    })
                })
                .collect();

            for edge_id in root.edges.iter() {
                let edge = &self.edges[*edge_id];
                if edge.boundary {
                    boundaries.push(BoundarySpec {
                        node_ids: [node_map[&edge.nodes[0]], node_map[&edge.nodes[1]]],
                        marker: edge.marker,
                    });
                }
            }

            cells.push(CellSpec {
                node_ids,
                marker: root.marker,
                curved: root.curved,
            });
        }

        let mut mesh = Self::from_parts(points, cells, boundaries)?;

        let mut id_map: Vec<Option<usize>> = vec![None; self.elems.len()];
        for (new_id, old_id) in roots.iter().enumerate() {
            id_map[*old_id] = Some(new_id);
        }

        // replay the deeper refinements in creation order
        let mut replay: Vec<(usize, usize, HRef)> = self
            .elems
            .iter()
            .filter(|elem| elem.level >= 1 && !elem.is_removed())
            .filter_map(|elem| match (elem.child_ids(), elem.refinement()) {
                (Some(children), Some(refinement)) => Some((children[0], elem.id, refinement)),
                _ => None,
            })
            .collect();
        replay.sort_unstable();

        for (_, old_id, refinement) in replay {
            let new_parent = id_map[old_id].ok_or(MeshError::ElemDoesntExist(old_id))?;
            let first_new_id = mesh.elems.len();
            mesh.refine_element(new_parent, refinement)?;

            if let Some(children) = self.elems[old_id].child_ids() {
                for (k, old_child) in children.iter().enumerate() {
                    id_map[*old_child] = Some(first_new_id + k);
                }
            }
        }

        Ok(mesh)
    }
}

fn sorted_pair(a: usize, b: usize) -> [usize; 2] {
    if a <= b {
        [a, b]
    } else {
        [b, a]
    }
}

fn connect_uninit(elem_uninit: &mut ElemUninit, nodes: &[usize], edges: &[usize]) {
    for (idx, node_id) in nodes.iter().enumerate() {
        elem_uninit.set_node(idx, *node_id);
    }
    for (idx, edge_id) in edges.iter().enumerate() {
        elem_uninit.set_edge(idx, *edge_id);
    }
}

fn validate_cell(cell_id: usize, cell: &CellSpec, points: &[Point]) -> Result<ElemShape, MeshError> {
    let invalid = |reason: &str| MeshError::InvalidCell {
        cell: cell_id,
        reason: reason.to_string(),
    };

    let shape = ElemShape::from_num_vertices(cell.node_ids.len())
        .ok_or_else(|| invalid("cells need 3 or 4 node_ids"))?;

    if cell.node_ids.iter().any(|node_id| *node_id >= points.len()) {
        return Err(invalid("node id out of range"));
    }
    for (i, a) in cell.node_ids.iter().enumerate() {
        if cell.node_ids[i + 1..].contains(a) {
            return Err(invalid("repeated node id"));
        }
    }

    let p = |k: usize| points[cell.node_ids[k]].as_v2d();
    let cross = |o: V2D, a: V2D, b: V2D| {
        let (u, v) = (a - o, b - o);
        u[0] * v[1] - u[1] * v[0]
    };
    let positive = match shape {
        ElemShape::Tri => cross(p(0), p(1), p(2)) > 0.0,
        // every corner of [SW, SE, NE, NW] must turn left
        ElemShape::Quad => {
            let ring = [p(0), p(1), p(3), p(2)];
            (0..4).all(|k| cross(ring[k], ring[(k + 1) % 4], ring[(k + 3) % 4]) > 0.0)
        }
    };

    if positive {
        Ok(shape)
    } else {
        Err(invalid("inverted or degenerate geometry"))
    }
}

fn parse_node_information(mesh_json: &JsonValue) -> Result<Vec<Point>, MeshError> {
    if !mesh_json["Nodes"].is_array() {
        return Err(MeshError::Parse("Nodes must be an Array!".to_string()));
    }

    mesh_json["Nodes"]
        .members()
        .map(|json_node_point| {
            match (
                json_node_point.len(),
                json_node_point[0].as_f64(),
                json_node_point[1].as_f64(),
            ) {
                (2, Some(x), Some(y)) => Ok(Point::new(x, y)),
                _ => Err(MeshError::Parse(
                    "Nodes must be arrays of two numerical values!".to_string(),
                )),
            }
        })
        .collect()
}

fn parse_element_information(mesh_json: &JsonValue) -> Result<Vec<CellSpec>, MeshError> {
    if !mesh_json["Elements"].is_array() {
        return Err(MeshError::Parse("Elements must be an Array!".to_string()));
    }

    mesh_json["Elements"]
        .members()
        .map(|json_element| {
            let node_ids = json_element["node_ids"]
                .members()
                .map(|id| {
                    id.as_usize().ok_or_else(|| {
                        MeshError::Parse("Element node_ids must be non-negative integers!".to_string())
                    })
                })
                .collect::<Result<SmallVec<[usize; 4]>, MeshError>>()?;

            Ok(CellSpec {
                node_ids,
                marker: json_element["marker"].as_u32().unwrap_or(0),
                curved: json_element["curved"].as_bool().unwrap_or(false),
            })
        })
        .collect()
}

fn parse_boundary_information(mesh_json: &JsonValue) -> Result<Vec<BoundarySpec>, MeshError> {
    mesh_json["Boundaries"]
        .members()
        .map(|json_boundary| {
            match (
                json_boundary["node_ids"][0].as_usize(),
                json_boundary["node_ids"][1].as_usize(),
                json_boundary["marker"].as_u32(),
            ) {
                (Some(a), Some(b), Some(marker)) => Ok(BoundarySpec {
                    node_ids: [a, b],
                    marker,
                }),
                _ => Err(MeshError::Parse(
                    "Boundaries must have two node_ids and a marker!".to_string(),
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_copy_invariants(mesh: &Mesh) {
        assert_eq!(mesh.copy().max_element_id(), mesh.max_element_id());
        assert_eq!(
            mesh.copy_base().unwrap().max_element_id(),
            mesh.num_base_elements()
        );
        // unrefined base Elems carry over into the copy as base Elems
        let unrefined_base = (0..mesh.num_base_elements())
            .filter(|id| mesh.is_active(*id))
            .count();
        let refined = mesh.copy_refine().unwrap();
        assert_eq!(
            refined.max_element_id() + mesh.num_base_elements(),
            mesh.max_element_id() + unrefined_base
        );
        assert_eq!(refined.num_active_elements(), mesh.num_active_elements());
    }

    #[test]
    fn mesh_from_file() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        assert_eq!(mesh.elems.len(), 4);
        assert_eq!(mesh.nodes.len(), 9);
        assert_eq!(mesh.edges.len(), 12);
        assert_eq!(mesh.edges.iter().filter(|e| e.boundary).count(), 8);
        assert_eq!(mesh.nodes.iter().filter(|n| n.boundary).count(), 8);

        let mixed = Mesh::from_file("./test_input/mixed.json").unwrap();
        assert_eq!(mixed.elems[0].shape, ElemShape::Quad);
        assert_eq!(mixed.elems[1].shape, ElemShape::Tri);
        assert!(mixed.elems[2].curved);
        assert!(mixed
            .edges
            .iter()
            .any(|e| e.boundary && e.marker == 2));
    }

    #[test]
    fn bad_mesh_descriptions() {
        assert!(matches!(
            Mesh::from_json_str(r#"{"Nodes": [[0,0],[1,0],[0,1]], "Elements": [{"node_ids": [0, 2, 1]}]}"#),
            Err(MeshError::InvalidCell { .. })
        ));
        assert!(matches!(
            Mesh::from_json_str(r#"{"Nodes": [[0,0],[1,0]], "Elements": [{"node_ids": [0, 1]}]}"#),
            Err(MeshError::InvalidCell { .. })
        ));
        assert!(matches!(
            Mesh::from_json_str(r#"{"Nodes": [], "Elements": []}"#),
            Err(MeshError::Empty)
        ));
        assert!(matches!(
            Mesh::from_json_str("not json"),
            Err(MeshError::Parse(_))
        ));
    }

    #[test]
    fn geometry_maps() {
        let mesh = Mesh::from_file("./test_input/mixed.json").unwrap();

        let (p, jac) = mesh.geometry(0, V2D::from([0.0, 0.0]));
        assert!(p == Point::new(0.5, 0.5));
        assert!((jac.det() - 0.25).abs() < 1e-14);

        // triangle (1,0), (2,0.5), (1,1)
        let (p, jac) = mesh.geometry(1, V2D::from([-1.0, 1.0]));
        assert!(p == Point::new(1.0, 1.0));
        assert!((jac.det() * 2.0 - 0.5).abs() < 1e-14);
    }

    #[test]
    fn basic_h_refinements() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        mesh.refine_element(1, HRef::U).unwrap();
        mesh.refine_element(2, HRef::V).unwrap();

        assert_eq!(mesh.max_element_id(), 4 + 4 + 2 + 2);
        assert_eq!(mesh.num_active_elements(), 1 + 4 + 2 + 2);
        assert_eq!(mesh.elems[0].child_ids().unwrap().to_vec(), vec![4, 5, 6, 7]);

        // the NE child of elem 0 touches the center of the original mesh
        let ne = &mesh.elems[7];
        assert_eq!(ne.nodes[3], 4);
        assert!(mesh.nodes[ne.nodes[0]].coords == Point::new(0.25, 0.25));

        // every child maps back into its base element
        for elem in mesh.active_elems() {
            let (center, jac) = mesh.geometry(elem.id, V2D::zero());
            assert!(jac.det() > 0.0);
            let (base_point, _) = mesh.base_geometry(elem.base_id, elem.map.apply(V2D::zero()));
            assert!(center == base_point);
        }
    }

    #[test]
    fn shared_edges_are_reused() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_elements(vec![(0, HRef::T), (1, HRef::T)]).unwrap();

        // 9 base nodes + 5 per refinement - 1 shared midpoint
        assert_eq!(mesh.nodes.len(), 9 + 5 + 4);
        for elem in mesh.active_elems() {
            for (side, edge_id) in elem.edges.iter().enumerate() {
                let [a, b] = elem.shape.side_vertices(side);
                let edge_nodes = mesh.edges[*edge_id].nodes;
                assert!(
                    edge_nodes == [elem.nodes[a], elem.nodes[b]]
                        || edge_nodes == [elem.nodes[b], elem.nodes[a]]
                );
            }
        }
    }

    #[test]
    fn triangle_bisection() {
        let mut mesh = Mesh::from_file("./test_input/square_tri.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        assert_eq!(mesh.elems[0].child_ids().unwrap().len(), 2);

        let area: f64 = mesh
            .active_elems()
            .map(|elem| mesh.geometry(elem.id, V2D::zero()).1.det() * 2.0)
            .sum();
        assert!((area - 1.0).abs() < 1e-14);

        assert!(mesh.refine_element(1, HRef::U).is_err());
    }

    #[test]
    fn hanging_nodes_and_constraints() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();

        // midpoints of the interior sides of elem 0 hang; boundary midpoints do not
        let hanging: Vec<usize> = (0..mesh.nodes.len())
            .filter(|n| mesh.hanging_constraint(*n).is_some())
            .collect();
        assert_eq!(hanging.len(), 2);
        for node_id in hanging {
            let (edge_id, t) = mesh.hanging_constraint(node_id).unwrap();
            assert_eq!(t, 0.0);
            assert_eq!(mesh.active_elems_on_edge(edge_id).len(), 1);
        }

        // each child side along elem 1 is constrained by half of elem 1's side
        let se = &mesh.elems[5];
        let (constraining, range) = mesh.constraining_edge(se.edges[3]).unwrap();
        assert_eq!(constraining, mesh.elems[1].edges[2]);
        assert!(range == [-1.0, 0.0] || range == [0.0, 1.0]);
        assert!(mesh.constraining_edge(mesh.elems[1].edges[2]).is_none());
    }

    #[test]
    fn regularity_enforcement() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        // refine the NE child twice more towards the center
        mesh.refine_element(7, HRef::T).unwrap();
        let ne_of_ne = mesh.elems[7].child_ids().unwrap()[3];
        mesh.refine_element(ne_of_ne, HRef::T).unwrap();

        let refined = mesh.regularize(Regularity::MaxLevel(1)).unwrap();
        assert!(!refined.is_empty());

        for elem in mesh.active_elems() {
            for edge_id in elem.edges.iter() {
                if let Some((c, _)) = mesh.constraining_edge(*edge_id) {
                    assert!(mesh.edges[*edge_id].level - mesh.edges[c].level <= 1);
                }
            }
        }

        let before = mesh.max_element_id();
        assert!(mesh.regularize(Regularity::Arbitrary).unwrap().is_empty());
        assert_eq!(mesh.max_element_id(), before);
    }

    #[test]
    fn boundary_and_vertex_refinement() {
        let mut mesh = Mesh::from_file("./test_input/l_shape.json").unwrap();
        mesh.refine_towards_boundary(2, 2).unwrap();
        assert!(mesh.num_active_elements() > 3);
        assert!(mesh
            .active_elems()
            .filter(|elem| elem.edges.iter().any(|e| mesh.edges[*e].marker == 2))
            .all(|elem| elem.level == 2));

        let mut mesh = Mesh::from_file("./test_input/l_shape.json").unwrap();
        mesh.refine_towards_vertex(4, 3).unwrap();
        assert_eq!(mesh.num_active_elements(), 3 + 3 * 3 * 3);
        assert!(mesh.refine_towards_vertex(100, 1).is_err());
    }

    #[test]
    fn unrefinement() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        mesh.refine_element(4, HRef::T).unwrap();

        assert!(mesh.unrefine_element(0).is_err());
        mesh.unrefine_element(4).unwrap();
        mesh.unrefine_element(0).unwrap();

        assert_eq!(mesh.num_active_elements(), 4);
        assert!(mesh.is_active(0));
        assert!(mesh.elems[4].is_removed());
        assert!((0..mesh.nodes.len()).all(|n| mesh.hanging_constraint(n).is_none()
            || mesh.active_elems().all(|e| !e.nodes.contains(&n))));
    }

    #[test]
    fn point_location() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        mesh.refine_element(6, HRef::V).unwrap();

        let (leaf, xi) = mesh.locate(0, V2D::from([-0.5, 0.75]));
        assert!(mesh.is_active(leaf));
        assert!(mesh.elems[leaf].shape.contains(xi, 1e-12));
        assert_eq!(mesh.elems[leaf].parent_id(), Some(6));
    }

    #[test]
    #[should_panic]
    fn h_refine_non_existent() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(4, HRef::T).unwrap();
    }

    #[test]
    #[should_panic]
    fn h_refine_elem_with_children() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
        mesh.refine_element(0, HRef::T).unwrap();
    }

    #[test]
    #[should_panic]
    fn double_h_refinement() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        mesh.refine_elements(vec![(0, HRef::T), (1, HRef::T), (0, HRef::U)])
            .unwrap();
    }

    #[test]
    fn failed_refinement_is_a_no_op() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        let before = (mesh.elems.len(), mesh.edges.len(), mesh.nodes.len());
        assert!(mesh.refine_elements(vec![(0, HRef::T), (9, HRef::T)]).is_err());
        assert_eq!(before, (mesh.elems.len(), mesh.edges.len(), mesh.nodes.len()));
    }

    #[test]
    #[should_panic]
    fn minimum_edge_length_exceeded() {
        let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();

        // repeatedly refine the bottom left cell
        for _ in 0..18 {
            let target = mesh
                .active_elems()
                .find(|elem| elem.nodes[0] == 0)
                .map(|elem| elem.id)
                .unwrap();
            mesh.refine_element(target, HRef::T).unwrap();
        }
    }

    #[test]
    fn copy_invariants() {
        let mut mesh = Mesh::from_file("./test_input/mixed.json").unwrap();
        assert_copy_invariants(&mesh);

        mesh.refine_all_elements().unwrap();
        assert_copy_invariants(&mesh);

        mesh.refine_element(4, HRef::U).unwrap();
        let last = mesh.max_element_id() - 1;
        mesh.refine_element(last, HRef::T).unwrap();
        assert_copy_invariants(&mesh);

        let refined = mesh.copy_refine().unwrap();
        assert_eq!(refined.num_active_elements(), mesh.num_active_elements());
    }

    #[test]
    fn copy_refine_of_refined_meshes() {
        for path in ["./test_input/square_quad.json", "./test_input/mixed.json", "./test_input/l_shape.json"] {
            let mut mesh = Mesh::from_file(path).unwrap();
            mesh.refine_all_elements().unwrap();
            let refined = mesh.copy_refine().unwrap();
            assert_eq!(
                refined.max_element_id() + mesh.num_base_elements(),
                mesh.max_element_id()
            );

            mesh.refine_element(mesh.num_base_elements(), HRef::T).unwrap();
            let last = mesh.max_element_id() - 1;
            mesh.refine_element(last, HRef::T).unwrap();
            let refined = mesh.copy_refine().unwrap();
            assert_eq!(
                refined.max_element_id() + mesh.num_base_elements(),
                mesh.max_element_id()
            );
            assert_eq!(refined.num_active_elements(), mesh.num_active_elements());
        }
    }

    #[cfg(feature = "json_export")]
    #[test]
    fn refined_mesh_to_file() {
        std::fs::create_dir_all("./test_output").unwrap();
        let mut mesh = Mesh::from_file("./test_input/mixed.json").unwrap();
        mesh.refine_all_elements().unwrap();
        mesh.export_to_json("./test_output/mixed_refined.json").unwrap();

        let written = read_to_string("./test_output/mixed_refined.json").unwrap();
        let parsed = json::parse(&written).unwrap();
        assert_eq!(parsed["Elems"].len(), mesh.elems.len());
    }

    proptest! {
        #[test]
        fn copy_invariants_hold_for_random_refinements(
            picks in prop::collection::vec((0usize..64, 0u8..3), 0..12)
        ) {
            let mut mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
            for (pick, kind) in picks {
                let active = mesh.active_elem_ids();
                let target = active[pick % active.len()];
                let refinement = [HRef::T, HRef::U, HRef::V][kind as usize];
                mesh.refine_element(target, refinement).unwrap();
            }
            assert_copy_invariants(&mesh);

            let area: f64 = mesh
                .active_elems()
                .map(|elem| mesh.geometry(elem.id, V2D::zero()).1.det() * 4.0)
                .sum();
            prop_assert!((area - 1.0).abs() < 1e-12);
        }
    }
}
