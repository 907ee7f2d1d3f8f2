//! hp-Adaptive Finite Elements in 2D
//!
//! A [Mesh](domain::Mesh) of quads and triangles is refined through a hierarchy of h-refinements (with hanging
//! nodes of arbitrary level) while a [Space](domain::Space) carries a polynomial order per Elem and enumerates the
//! Degrees of Freedom. The [AdaptivityLoop](adapt::AdaptivityLoop) drives the usual cycle:
//!
//! ```text
//! reference Space -> solve coarse and reference -> estimate -> mark -> select candidates -> refine
//! ```
//!
//! ```no_run
//! use hp_fem_2d::prelude::*;
//!
//! let mesh = Mesh::from_file("./test_input/l_shape.json").unwrap();
//! let mut space = Space::new(mesh, SpaceKind::H1, 2, |_| BcType::Essential).unwrap();
//! let problem = LinearProblem::poisson(|_| 1.0);
//!
//! let mut graph = ConvergenceGraph::new();
//! let summary = AdaptivityLoop::new(AdaptConfig::default())
//!     .unwrap()
//!     .with_observer(&mut graph)
//!     .run(&mut space, &problem, &problem.energy_norm())
//!     .unwrap();
//!
//! println!("{:?} after {} steps", summary.reason, summary.steps);
//! graph.save("conv_dof.dat").unwrap();
//! ```

/// hp-Adaptivity: reference Spaces, error estimation, candidate selection and the adaptivity loop
pub mod adapt;
/// Hierarchic shape functions
pub mod basis;
/// Meshes, Spaces and the fields defined over them
pub mod domain;
/// Weak forms, assembly and the model problem
pub mod fem_problem;
/// Gauss-Legendre quadrature
pub mod integration;
/// Sparse linear systems and their solution
pub mod linalg;

pub mod prelude {
    pub use crate::adapt::{
        AdaptConfig, AdaptError, AdaptivityLoop, CandList, ConvergenceGraph, ErrorForm, H1SemiNorm, Strategy,
    };
    pub use crate::domain::{
        mesh::{geometry::Point, h_refinement::HRef, p_refinement::PolyOrders},
        BcType, ExactSolution, FnValue, Mesh, Solution, Space, SpaceKind,
    };
    pub use crate::fem_problem::{LinearProblem, Solver, SystemSolver};
}
