/// Parameters of the adaptivity loop
pub mod config;
/// The adaptivity loop: solve, estimate, mark, select, refine
pub mod driver;
/// Element-wise error estimation from a coarse and a reference solution
pub mod estimator;
/// Selection of the Elems to refine from their error indicators
pub mod marking;
/// Construction of the reference Space
pub mod reference;
/// hp-Candidate enumeration and scoring
pub mod selector;

pub use config::{AdaptConfig, CandList, CoarseSolution, ConfigError, Strategy};
pub use driver::{
    Adapt, AdaptObserver, AdaptOutcome, AdaptState, AdaptSummary, AdaptivityLoop, ConvergenceGraph, StepReport,
    StopReason,
};
pub use estimator::{calc_exact_error, ElemKey, EnergyNorm, ErrorForm, ErrorReport, Estimator, H1Norm, H1SemiNorm, L2Norm};
pub use reference::ReferenceBuilder;
pub use selector::{Candidate, Selection, Selector};

use crate::domain::{
    mesh::{h_refinement::HRefError, MeshError},
    space::SpaceError,
};
use crate::linalg::SolveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdaptError {
    #[error("Elem {0} of the coarse Mesh has no counterpart in the reference Mesh; Cannot estimate errors!")]
    NotNested(usize),
    #[error("Solutions were not set; Cannot estimate errors!")]
    SolutionsNotSet,
    #[error("Projection onto a candidate of Elem {0} failed; Cannot score candidates!")]
    Projection(usize),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    HRef(#[from] HRefError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Unable to write adaptivity output: {0}")]
    Io(#[from] std::io::Error),
}
