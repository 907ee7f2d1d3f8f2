use super::h_refinement::{Bisection, HRefError};
use super::MIN_EDGE_LENGTH;
use json::{array, object, JsonValue};
use smallvec::{smallvec, SmallVec};

/// Edges describe a straight line between two `Node`s.
///
/// The global orientation of an Edge runs from `nodes[0]` to `nodes[1]`; edge-type shape functions are
/// defined along that direction. Edges form a binary tree under h-refinement:
///
/// ```text
///    0 *-----------------------* 1
///
///         0     child_node     1
///      *-----------*-----------*
/// ```
///
/// Every `Elem` that uses an Edge as one of its sides is recorded (active or not). Together with the
/// tree this is enough to find constrained sides and hanging `Node`s.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: usize,
    pub nodes: [usize; 2],
    pub boundary: bool,
    /// boundary marker (0 for interior Edges)
    pub marker: u32,
    /// length relative to the base Edge it descends from
    pub length: f64,
    /// depth in the Edge tree
    pub level: u8,
    children: Option<[usize; 2]>,
    parent: Option<usize>,
    child_node: Option<usize>,
    elems: SmallVec<[usize; 4]>,
}

impl Edge {
    pub fn new(id: usize, nodes: [usize; 2], boundary: bool, marker: u32) -> Self {
        Self {
            id,
            nodes,
            boundary,
            marker: if boundary { marker } else { 0 },
            length: 1.0,
            level: 0,
            children: None,
            parent: None,
            child_node: None,
            elems: SmallVec::new(),
        }
    }

    /// An interior Edge created inside an `Elem` during h-refinement
    pub(crate) fn interior(id: usize, nodes: [usize; 2], length: f64, level: u8) -> Self {
        Self {
            length,
            level,
            ..Self::new(id, nodes, false, 0)
        }
    }

    pub(crate) fn connect_elem(&mut self, elem_id: usize) {
        if !self.elems.contains(&elem_id) {
            self.elems.push(elem_id);
        }
    }

    /// Produce two child Edges from this edge and connect them to a new Node along its center
    pub(crate) fn h_refine(
        &mut self,
        new_ids: [usize; 2],
        new_node_id: usize,
    ) -> Result<SmallVec<[Self; 2]>, HRefError> {
        let child_edge_length = self.length / 2.0;

        if child_edge_length < MIN_EDGE_LENGTH {
            return Err(HRefError::MinEdgeLength(self.id));
        }

        self.children = Some(new_ids);
        self.child_node = Some(new_node_id);

        let child = |id: usize, nodes: [usize; 2]| Self {
            id,
            nodes,
            boundary: self.boundary,
            marker: self.marker,
            length: child_edge_length,
            level: self.level + 1,
            children: None,
            parent: Some(self.id),
            child_node: None,
            elems: SmallVec::new(),
        };

        Ok(smallvec![
            child(new_ids[Bisection::BL.index()], [self.nodes[0], new_node_id]),
            child(new_ids[Bisection::TR.index()], [new_node_id, self.nodes[1]]),
        ])
    }

    /// Id of the Parent Edge if this Edge has a parent
    pub fn parent_id(&self) -> Option<usize> {
        self.parent
    }

    /// Child Edge ids (ordered from `nodes[0]` to `nodes[1]`)
    pub fn child_ids(&self) -> Option<[usize; 2]> {
        self.children
    }

    /// Has been h-Refined?
    pub fn has_children(&self) -> bool {
        self.children.is_some()
    }

    /// Returns the Node sitting on the center of this Edge if it has been h-Refined; otherwise, `None` is returned.
    pub fn child_node_id(&self) -> Option<usize> {
        self.child_node
    }

    /// Every `Elem` (active or not) that has this Edge as a side
    pub fn elem_ids(&self) -> &[usize] {
        &self.elems
    }

    /// Produce a Json Object that describes this Edge
    #[cfg(feature = "json_export")]
    pub fn to_json(&self) -> JsonValue {
        object! {
            "id": self.id,
            "boundary": self.boundary,
            "marker": self.marker,
            "level": self.level,
            "nodes": array![self.nodes[0], self.nodes[1]],
            "parent": self.parent_id(),
            "children": match self.children {
                Some(child_ids) => array![child_ids[0], child_ids[1]],
                None => array![],
            },
            "elems": JsonValue::from(self.elems.to_vec()),
        }
    }
}
