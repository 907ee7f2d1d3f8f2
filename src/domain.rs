/// Degrees of Freedom: enumeration tables and constrained assembly lists
pub mod dof;
/// Solutions and other functions that can be evaluated over a Mesh
pub mod fields;
/// The internal geometric structure of a Domain
pub mod mesh;
/// Function Spaces: polynomial orders over a Mesh and their Degrees of Freedom
pub mod space;

pub use fields::{ExactSolution, FnValue, MeshFunction, Solution};
pub use mesh::{Mesh, MeshError};
pub use space::{BcType, Space, SpaceError, SpaceKind};

/// Hands out consecutive ids starting from some initial value
#[derive(Debug, Clone)]
pub(crate) struct IdTracker {
    next_id: usize,
}

impl IdTracker {
    pub fn new(start: usize) -> Self {
        Self { next_id: start }
    }

    pub fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id - 1
    }

    pub fn next_two_ids(&mut self) -> [usize; 2] {
        let ids = [self.next_id, self.next_id + 1];
        self.next_id += 2;
        ids
    }

    /// Reserve `n` consecutive ids, returning the first
    pub fn next_ids(&mut self, n: usize) -> usize {
        self.next_id += n;
        self.next_id - n
    }

    /// Number of ids handed out so far (when started from 0)
    pub fn count(&self) -> usize {
        self.next_id
    }
}
