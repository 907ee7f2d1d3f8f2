/// Use Nalgebra's dense decompositions to solve a linear system
pub mod nalgebra_solve;
/// Sparsely Packed Matrix
pub mod sparse_matrix;

use crate::domain::SpaceError;
use rayon::prelude::*;
use sparse_matrix::SparseMatrix;
use std::sync::mpsc::channel;
use thiserror::Error;

/// Symmetric Linear System
///
/// Au = b
#[derive(Clone, Debug)]
pub struct LinearSystem {
    /// A Matrix
    pub matrix: SparseMatrix,
    /// b Vector
    pub rhs: Vec<f64>,
}

impl LinearSystem {
    pub fn new(num_dofs: usize) -> Self {
        Self {
            matrix: SparseMatrix::new(num_dofs),
            rhs: vec![0.0; num_dofs],
        }
    }

    pub fn dimension(&self) -> usize {
        self.matrix.dimension
    }

    /// Add one Elem's contributions
    pub fn consume(&mut self, contribution: ElemContribution) {
        self.matrix.insert_group(contribution.entries);
        for (row, value) in contribution.rhs {
            self.rhs[row] += value;
        }
    }
}

/// Matrix entries (upper triangle, global indices) and right-hand-side entries produced by one Elem
#[derive(Clone, Debug, Default)]
pub struct ElemContribution {
    pub entries: Vec<([usize; 2], f64)>,
    pub rhs: Vec<(usize, f64)>,
}

impl ParallelExtend<ElemContribution> for LinearSystem {
    fn par_extend<I>(&mut self, elem_contributions_iter: I)
    where
        I: IntoParallelIterator<Item = ElemContribution>,
    {
        let (sender, receiver) = channel();

        elem_contributions_iter
            .into_par_iter()
            .for_each_with(sender, |s, contribution| {
                s.send(contribution).expect(
                    "Failed to send sub-matrices over MSPC channel; cannot construct Matrices!",
                )
            });

        receiver
            .iter()
            .for_each(|contribution| self.consume(contribution));
    }
}

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("Linear system is singular; Cannot Solve!")]
    SingularSystem,
    #[error("Solver failed to converge: {0}")]
    ConvergenceFailure(String),
    #[error("Matrices Exceeded Maximum Size ({0} unknowns); Cannot Solve!")]
    ProblemTooLarge(usize),
    #[error(transparent)]
    Space(#[from] SpaceError),
}
