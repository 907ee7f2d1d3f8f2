use super::geometry::Point;
use json::{object, JsonValue};

/// A point in Real space shared by the `Elem`s and `Edge`s that meet there.
///
/// Nodes created at the midpoint of an `Edge` remember that `Edge`; this is how hanging Nodes are found.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: usize,
    pub coords: Point,
    pub boundary: bool,
    parent_edge: Option<usize>,
}

impl Node {
    pub fn new(id: usize, coords: Point, boundary: bool) -> Self {
        Self {
            id,
            coords,
            boundary,
            parent_edge: None,
        }
    }

    pub fn on_edge(id: usize, coords: Point, boundary: bool, edge_id: usize) -> Self {
        Self {
            id,
            coords,
            boundary,
            parent_edge: Some(edge_id),
        }
    }

    /// The Edge this Node splits (None for base Nodes and Elem centers)
    pub fn parent_edge(&self) -> Option<usize> {
        self.parent_edge
    }

    pub fn to_json(&self) -> JsonValue {
        object! {
            "id": self.id,
            "coords": self.coords,
            "boundary": self.boundary,
            "parent_edge": self.parent_edge,
        }
    }
}
