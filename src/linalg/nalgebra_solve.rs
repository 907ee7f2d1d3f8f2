use super::{LinearSystem, SolveError};
use nalgebra::{DMatrix, DVector};

// TODO: use Nalgebra's Sparse crate
/// Largest system handed to the dense solver
pub const MAX_DENSE_SIZE: usize = 5000;

/// Solve a symmetric linear system by converting it to a dense matrix.
///
/// Cholesky decomposition is tried first; systems that are not positive definite fall back to an LU decomposition.
/// Casting the sparse matrix as a dense object uses a large amount of memory, so systems are limited to
/// [MAX_DENSE_SIZE] unknowns.
pub fn nalgebra_solve_dense(system: LinearSystem) -> Result<Vec<f64>, SolveError> {
    let dimension = system.matrix.dimension;
    if dimension > MAX_DENSE_SIZE {
        return Err(SolveError::ProblemTooLarge(dimension));
    }
    if dimension == 0 {
        return Ok(Vec::new());
    }

    let rhs = DVector::from_vec(system.rhs);
    let mat: DMatrix<f64> = system.matrix.into();

    let solution = match mat.clone().cholesky() {
        Some(cholesky_decomp) => cholesky_decomp.solve(&rhs),
        None => mat.lu().solve(&rhs).ok_or(SolveError::SingularSystem)?,
    };

    if solution.iter().all(|x| x.is_finite()) {
        Ok(solution.iter().copied().collect())
    } else {
        Err(SolveError::SingularSystem)
    }
}
