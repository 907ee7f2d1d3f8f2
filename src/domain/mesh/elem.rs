use super::{
    geometry::{AffineMap, V2D},
    h_refinement::{HRef, HRefError},
};
use json::{object, JsonValue};
use smallvec::SmallVec;

/// Reference shape of an [Elem]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElemShape {
    /// reference square `[-1, 1]^2`
    Quad,
    /// reference triangle with vertices `(-1,-1), (1,-1), (-1,1)`
    Tri,
}

impl ElemShape {
    pub const QUAD_VERTICES: [V2D; 4] = [
        V2D::from([-1.0, -1.0]),
        V2D::from([1.0, -1.0]),
        V2D::from([-1.0, 1.0]),
        V2D::from([1.0, 1.0]),
    ];

    pub const TRI_VERTICES: [V2D; 3] = [
        V2D::from([-1.0, -1.0]),
        V2D::from([1.0, -1.0]),
        V2D::from([-1.0, 1.0]),
    ];

    pub fn from_num_vertices(n: usize) -> Option<Self> {
        match n {
            3 => Some(Self::Tri),
            4 => Some(Self::Quad),
            _ => None,
        }
    }

    pub fn num_vertices(&self) -> usize {
        match self {
            Self::Quad => 4,
            Self::Tri => 3,
        }
    }

    pub fn num_sides(&self) -> usize {
        self.num_vertices()
    }

    /// Local vertex indices at the start and end of a side (defining its local orientation)
    pub fn side_vertices(&self, side: usize) -> [usize; 2] {
        match self {
            Self::Quad => [[0, 1], [2, 3], [0, 2], [1, 3]][side],
            Self::Tri => [[0, 1], [1, 2], [2, 0]][side],
        }
    }

    pub fn vertices(&self) -> &'static [V2D] {
        match self {
            Self::Quad => &Self::QUAD_VERTICES,
            Self::Tri => &Self::TRI_VERTICES,
        }
    }

    pub fn reference_area(&self) -> f64 {
        match self {
            Self::Quad => 4.0,
            Self::Tri => 2.0,
        }
    }

    /// How far a reference point lies outside the reference shape (0 inside)
    pub fn outside_distance(&self, xi: V2D) -> f64 {
        let excess = match self {
            Self::Quad => (xi[0].abs() - 1.0).max(xi[1].abs() - 1.0),
            Self::Tri => (-1.0 - xi[0]).max(-1.0 - xi[1]).max(xi[0] + xi[1]),
        };
        excess.max(0.0)
    }

    /// Is a reference point inside (or on the boundary of) the reference shape
    pub fn contains(&self, xi: V2D, tol: f64) -> bool {
        self.outside_distance(xi) <= tol
    }

    /// Centroid of the reference shape
    pub fn center(&self) -> V2D {
        match self {
            Self::Quad => V2D::zero(),
            Self::Tri => V2D::from([-1.0 / 3.0, -1.0 / 3.0]),
        }
    }

    /// Reference point parameterized by `s ∈ [-1, 1]` along a side (in local orientation)
    pub fn side_point(&self, side: usize, s: f64) -> V2D {
        let [a, b] = self.side_vertices(side);
        let verts = self.vertices();
        verts[a] * ((1.0 - s) / 2.0) + verts[b] * ((1.0 + s) / 2.0)
    }
}

/// `Elem`s are the basic geometric unit of the `Mesh`
///
/// `Elem`s are responsible for keeping track of:
/// * Connections to their `Node`s and `Edge`s
/// * Connections to their parent `Elem` and the h-refinement that was applied to them
/// * Connections to their child `Elem`s (if h-refined)
/// * The affine map from their reference coordinates into the reference coordinates of their base `Elem`
///
/// ## Layout
/// Quads:
/// ```text
///               N
///         2 --------- 3
///         |     1     |
///         |           |
///      W  |2         3|  E
///         |           |
///         |     0     |
///         0 --------- 1
///               S
/// ```
///
/// Triangles (counter-clockwise, side `i` starts at vertex `i`):
/// ```text
///         2
///         | \
///       2 |   \ 1
///         |     \
///         0 ----- 1
///             0
/// ```
///
/// ## h-Refinement
/// * `T` on quads: children SW, SE, NW, NE
/// * `U` on quads: children left, right
/// * `V` on quads: children bottom, top
/// * `T` on triangles: bisection of side 0; children `(v2, v0, m)` and `(v1, v2, m)`
#[derive(Debug, Clone)]
pub struct Elem {
    pub id: usize,
    pub shape: ElemShape,
    pub nodes: SmallVec<[usize; 4]>,
    pub edges: SmallVec<[usize; 4]>,
    /// material marker
    pub marker: u32,
    pub curved: bool,
    /// the base (level 0) Elem this Elem descends from
    pub base_id: usize,
    pub level: u8,
    /// reference coordinates of this Elem -> reference coordinates of its base Elem
    pub map: AffineMap,
    parent: Option<usize>,
    children: Option<SmallVec<[usize; 4]>>,
    refinement: Option<HRef>,
    removed: bool,
}

impl Elem {
    /// Construct a new base Elem
    pub fn new(
        id: usize,
        shape: ElemShape,
        nodes: SmallVec<[usize; 4]>,
        edges: SmallVec<[usize; 4]>,
        marker: u32,
        curved: bool,
    ) -> Self {
        Self {
            id,
            shape,
            nodes,
            edges,
            marker,
            curved,
            base_id: id,
            level: 0,
            map: AffineMap::identity(),
            parent: None,
            children: None,
            refinement: None,
            removed: false,
        }
    }

    /// Construct the [ElemUninit]s resulting from an [HRef] of this Elem
    pub(crate) fn h_refine(
        &mut self,
        refinement: HRef,
        id_counter: &mut usize,
    ) -> Result<Vec<ElemUninit>, HRefError> {
        if !self.is_active() {
            return Err(HRefError::ElemNotActive(self.id));
        }

        let children: Vec<ElemUninit> = refinement
            .child_maps(self.shape)?
            .iter()
            .map(|child_map| {
                let id = *id_counter;
                *id_counter += 1;
                ElemUninit::new(id, self, self.map.compose(child_map))
            })
            .collect();

        self.children = Some(children.iter().map(|ce| ce.id).collect());
        self.refinement = Some(refinement);
        Ok(children)
    }

    /// Undo the h-refinement of this Elem. The caller is responsible for flagging the children as removed
    pub(crate) fn merge_children(&mut self) -> Option<SmallVec<[usize; 4]>> {
        self.refinement = None;
        self.children.take()
    }

    pub(crate) fn mark_removed(&mut self) {
        self.removed = true;
    }

    /// Id of the Parent Elem if this Elem has a parent
    pub fn parent_id(&self) -> Option<usize> {
        self.parent
    }

    /// Returns a vector of ids for this Elem's children. Returns `None` if this Elem has no children.
    pub fn child_ids(&self) -> Option<SmallVec<[usize; 4]>> {
        self.children.clone()
    }

    /// Has this `Elem` been h-Refined
    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    /// The h-refinement that produced this Elem's children
    pub fn refinement(&self) -> Option<HRef> {
        self.refinement
    }

    /// Was this Elem discarded by an un-refinement of its parent
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Leaf of the refinement tree (carries degrees of freedom)
    pub fn is_active(&self) -> bool {
        !self.removed && self.children.is_none()
    }

    /// Local side index of an Edge on this Elem
    pub fn side_of_edge(&self, edge_id: usize) -> Option<usize> {
        self.edges.iter().position(|e| *e == edge_id)
    }

    /// Produce a Json Object that describes this Elem
    #[cfg(feature = "json_export")]
    pub fn to_json(&self) -> JsonValue {
        object! {
            "id": self.id,
            "base": self.base_id,
            "marker": self.marker,
            "curved": self.curved,
            "parent": self.parent_id(),
            "active": self.is_active(),
            "nodes": JsonValue::from(self.nodes.to_vec()),
            "edges": JsonValue::from(self.edges.to_vec()),
            "map": self.map,
            "children": JsonValue::from(
                match &self.children {
                    Some(ids) => ids.to_vec(),
                    None => Vec::new(),
                }
            )
        }
    }
}

// Intermediate data structure used to represent a child [Elem] during the execution of an [HRef]
#[derive(Debug, Clone)]
pub(crate) struct ElemUninit {
    pub id: usize,
    nodes: [Option<usize>; 4],
    edges: [Option<usize>; 4],
    shape: ElemShape,
    marker: u32,
    curved: bool,
    base_id: usize,
    level: u8,
    map: AffineMap,
    parent: usize,
}

impl ElemUninit {
    fn new(id: usize, parent: &Elem, map: AffineMap) -> Self {
        Self {
            id,
            nodes: [None; 4],
            edges: [None; 4],
            shape: parent.shape,
            marker: parent.marker,
            curved: parent.curved,
            base_id: parent.base_id,
            level: parent.level + 1,
            map,
            parent: parent.id,
        }
    }

    pub fn set_node(&mut self, node_idx: usize, node_id: usize) {
        assert!(
            node_idx < self.shape.num_vertices(),
            "Node index {} is out of range; cannot set it to {} on ElemUninit {}!",
            node_idx,
            node_id,
            self.id
        );

        if let Some(current_id) = self.nodes[node_idx] {
            assert_eq!(
                current_id, node_id,
                "Node ({}) has already been set to {} on ElemUninit {}; Cannot set to {}",
                node_idx, current_id, self.id, node_id
            );
        } else {
            self.nodes[node_idx] = Some(node_id);
        }
    }

    pub fn set_edge(&mut self, edge_idx: usize, edge_id: usize) {
        assert!(
            edge_idx < self.shape.num_sides(),
            "Edge index {} is out of range; cannot set it to {} on ElemUninit {}!",
            edge_idx,
            edge_id,
            self.id
        );

        assert!(
            self.edges[edge_idx].is_none(),
            "Edge ({}) has already been set on ElemUninit {}; Cannot set to {}",
            edge_idx,
            self.id,
            edge_id
        );

        self.edges[edge_idx] = Some(edge_id);
    }

    pub fn into_elem(self) -> Result<Elem, HRefError> {
        let n = self.shape.num_vertices();
        let nodes: SmallVec<[usize; 4]> = self.nodes[..n].iter().flatten().copied().collect();
        let edges: SmallVec<[usize; 4]> = self.edges[..n].iter().flatten().copied().collect();

        if nodes.len() == n && edges.len() == n {
            Ok(Elem {
                id: self.id,
                shape: self.shape,
                nodes,
                edges,
                marker: self.marker,
                curved: self.curved,
                base_id: self.base_id,
                level: self.level,
                map: self.map,
                parent: Some(self.parent),
                children: None,
                refinement: None,
                removed: false,
            })
        } else {
            Err(HRefError::UninitializedElem(self.id))
        }
    }
}
