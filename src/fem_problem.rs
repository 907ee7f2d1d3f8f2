/// Structures to execute Galerkin sampling over a [Space] using a [WeakForm](galerkin::WeakForm)
pub mod galerkin;

use crate::adapt::estimator::EnergyNorm;
use crate::domain::{
    fields::{FnValue, MeshFunction, Solution},
    mesh::geometry::Point,
    space::Space,
};
use crate::linalg::SolveError;
use galerkin::{solve_form, QuadPoint, WeakForm};

use log::info;
use std::sync::Arc;

/// Something that can compute discrete Solutions on a [Space]
pub trait Solver: Sync {
    /// Solve the problem on a Space (whose DoFs must be assigned)
    fn solve(&self, space: &Space) -> Result<Solution, SolveError>;

    /// H1-project a function onto a Space
    fn project(&self, space: &Space, source: &dyn MeshFunction) -> Result<Solution, SolveError>;
}

/// Something that can compute the discrete Solutions of a system, one component per [Space]
///
/// Implemented by any list of [Solver]s, each solving its own component. Coupled systems implement it directly.
pub trait SystemSolver: Sync {
    fn num_components(&self) -> usize;

    fn solve_system(&self, spaces: &[Space]) -> Result<Vec<Solution>, SolveError>;

    /// H1-project each source onto the Space of its component
    fn project_system(&self, spaces: &[Space], sources: &[Solution]) -> Result<Vec<Solution>, SolveError>;
}

impl<S: Solver> SystemSolver for [S] {
    fn num_components(&self) -> usize {
        self.len()
    }

    fn solve_system(&self, spaces: &[Space]) -> Result<Vec<Solution>, SolveError> {
        self.iter().zip(spaces.iter()).map(|(solver, space)| solver.solve(space)).collect()
    }

    fn project_system(&self, spaces: &[Space], sources: &[Solution]) -> Result<Vec<Solution>, SolveError> {
        self.iter()
            .zip(spaces.iter().zip(sources.iter()))
            .map(|(solver, (space, source))| solver.project(space, source))
            .collect()
    }
}

impl<S: Solver> SystemSolver for Vec<S> {
    fn num_components(&self) -> usize {
        self.len()
    }

    fn solve_system(&self, spaces: &[Space]) -> Result<Vec<Solution>, SolveError> {
        self.as_slice().solve_system(spaces)
    }

    fn project_system(&self, spaces: &[Space], sources: &[Solution]) -> Result<Vec<Solution>, SolveError> {
        self.as_slice().project_system(spaces, sources)
    }
}

impl<'s> SystemSolver for &'s dyn Solver {
    fn num_components(&self) -> usize {
        1
    }

    fn solve_system(&self, spaces: &[Space]) -> Result<Vec<Solution>, SolveError> {
        spaces.iter().map(|space| self.solve(space)).collect()
    }

    fn project_system(&self, spaces: &[Space], sources: &[Solution]) -> Result<Vec<Solution>, SolveError> {
        spaces
            .iter()
            .zip(sources.iter())
            .map(|(space, source)| self.project(space, source))
            .collect()
    }
}

/// A coefficient which depends on the material marker and the physical location
pub type Coefficient = Arc<dyn Fn(u32, Point) -> f64 + Send + Sync>;

/// The model problem
///
/// ```text
/// -div(a grad u) + c u = f    in the domain
///                    u = g    on essential boundaries
/// ```
///
/// Natural boundaries get homogeneous Neumann conditions.
#[derive(Clone)]
pub struct LinearProblem {
    diffusion: Coefficient,
    reaction: Coefficient,
    source: Coefficient,
    dirichlet: Coefficient,
}

impl Default for LinearProblem {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearProblem {
    /// `-Δu = 0` with `u = 0` on essential boundaries
    pub fn new() -> Self {
        Self {
            diffusion: Arc::new(|_, _| 1.0),
            reaction: Arc::new(|_, _| 0.0),
            source: Arc::new(|_, _| 0.0),
            dirichlet: Arc::new(|_, _| 0.0),
        }
    }

    /// `-Δu = f` with `u = 0` on essential boundaries
    pub fn poisson(source: impl Fn(Point) -> f64 + Send + Sync + 'static) -> Self {
        Self::new().with_source(move |_, x| source(x))
    }

    pub fn with_diffusion(mut self, a: impl Fn(u32, Point) -> f64 + Send + Sync + 'static) -> Self {
        self.diffusion = Arc::new(a);
        self
    }

    pub fn with_reaction(mut self, c: impl Fn(u32, Point) -> f64 + Send + Sync + 'static) -> Self {
        self.reaction = Arc::new(c);
        self
    }

    pub fn with_source(mut self, f: impl Fn(u32, Point) -> f64 + Send + Sync + 'static) -> Self {
        self.source = Arc::new(f);
        self
    }

    pub fn with_dirichlet(mut self, g: impl Fn(u32, Point) -> f64 + Send + Sync + 'static) -> Self {
        self.dirichlet = Arc::new(g);
        self
    }

    /// The energy norm `(a grad u, grad u) + (c u, u)` induced by this problem's coefficients
    pub fn energy_norm(&self) -> EnergyNorm {
        EnergyNorm::new(self.diffusion.clone(), self.reaction.clone())
    }
}

impl WeakForm for LinearProblem {
    fn bilinear(&self, qp: &QuadPoint, u: &FnValue, v: &FnValue) -> f64 {
        (self.diffusion)(qp.marker, qp.x) * u.grad.dot_with(&v.grad)
            + (self.reaction)(qp.marker, qp.x) * u.value * v.value
    }

    fn linear(&self, qp: &QuadPoint, v: &FnValue) -> f64 {
        (self.source)(qp.marker, qp.x) * v.value
    }
}

impl Solver for LinearProblem {
    fn solve(&self, space: &Space) -> Result<Solution, SolveError> {
        let solution = solve_form(space, self, &|qp: &QuadPoint| (self.dirichlet)(qp.marker, qp.x))?;
        info!("solved problem with {} DoFs", solution.num_dofs());
        Ok(solution)
    }

    fn project(&self, space: &Space, source: &dyn MeshFunction) -> Result<Solution, SolveError> {
        let projection = H1Projection { source };
        solve_form(space, &projection, &|qp: &QuadPoint| {
            source.eval(qp.base_id, qp.root, qp.x).value
        })
    }
}

/// `(u, v)_H1 = (source, v)_H1`
struct H1Projection<'s> {
    source: &'s dyn MeshFunction,
}

impl<'s> WeakForm for H1Projection<'s> {
    fn bilinear(&self, _: &QuadPoint, u: &FnValue, v: &FnValue) -> f64 {
        u.grad.dot_with(&v.grad) + u.value * v.value
    }

    fn linear(&self, qp: &QuadPoint, v: &FnValue) -> f64 {
        let s = self.source.eval(qp.base_id, qp.root, qp.x);
        s.grad.dot_with(&v.grad) + s.value * v.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        fields::ExactSolution,
        mesh::{geometry::V2D, h_refinement::HRef, Mesh},
        space::{BcType, SpaceKind},
    };
    use crate::integration::QuadRule;

    fn bubble(x: Point) -> f64 {
        x.x * (1.0 - x.x) * x.y * (1.0 - x.y)
    }

    fn bubble_source(x: Point) -> f64 {
        2.0 * (x.y * (1.0 - x.y) + x.x * (1.0 - x.x))
    }

    // compare against `exact` at the quadrature points of every active Elem
    fn assert_matches(solution: &Solution, exact: impl Fn(Point) -> f64, tol: f64) {
        let mesh = solution.mesh();
        for elem in mesh.active_elems() {
            for (xi, _) in QuadRule::for_shape(elem.shape, 3).iter() {
                let (x, _) = mesh.geometry(elem.id, xi);
                let value = solution.eval_local(elem.id, xi).unwrap().value;
                assert!((value - exact(x)).abs() < tol, "{} != {} at {}", value, exact(x), x);
            }
        }
    }

    fn dirichlet_space(path: &str, p: u8) -> Space {
        let mesh = Mesh::from_file(path).unwrap();
        Space::new(mesh, SpaceKind::H1, p, |_| BcType::Essential).unwrap()
    }

    #[test]
    fn quadratic_bubble_on_quads() {
        let mut space = dirichlet_space("./test_input/square_quad.json", 2);
        space.assign_dofs().unwrap();

        let solution = LinearProblem::poisson(bubble_source).solve(&space).unwrap();
        assert_matches(&solution, bubble, 1e-11);
    }

    #[test]
    fn quadratic_bubble_with_hanging_nodes() {
        let mut space = dirichlet_space("./test_input/square_quad.json", 2);
        space.refine_element(0, HRef::T).unwrap();
        space.refine_element(7, HRef::V).unwrap();
        space.assign_dofs().unwrap();

        let solution = LinearProblem::poisson(bubble_source).solve(&space).unwrap();
        assert_matches(&solution, bubble, 1e-11);
    }

    #[test]
    fn quartic_on_triangles() {
        let mut space = dirichlet_space("./test_input/square_tri.json", 4);
        space.refine_element(0, HRef::T).unwrap();
        space.assign_dofs().unwrap();

        let solution = LinearProblem::poisson(bubble_source).solve(&space).unwrap();
        assert_matches(&solution, bubble, 1e-10);
    }

    #[test]
    fn linear_dirichlet_data() {
        let exact = |x: Point| 1.0 + x.x + 2.0 * x.y;
        let mut space = dirichlet_space("./test_input/mixed.json", 1);
        space.assign_dofs().unwrap();

        let problem = LinearProblem::new().with_dirichlet(move |_, x| exact(x));
        let solution = problem.solve(&space).unwrap();
        assert_matches(&solution, exact, 1e-12);
    }

    #[test]
    fn reaction_diffusion_with_natural_boundaries() {
        // u = cos(πx) has zero normal derivative on the sides of the unit square
        // -u'' + u = (π^2 + 1) cos(πx)
        let pi = std::f64::consts::PI;
        let exact = move |x: Point| (pi * x.x).cos();
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        let mut space = Space::new(mesh, SpaceKind::H1, 6, |_| BcType::Natural).unwrap();
        space.assign_dofs().unwrap();

        let problem = LinearProblem::new()
            .with_reaction(|_, _| 1.0)
            .with_source(move |_, x| (pi * pi + 1.0) * (pi * x.x).cos());
        let solution = problem.solve(&space).unwrap();
        assert_matches(&solution, exact, 1e-3);
    }

    #[test]
    fn projection_of_polynomial_is_exact() {
        let mut space = dirichlet_space("./test_input/l_shape.json", 3);
        space.refine_element(1, HRef::U).unwrap();
        space.assign_dofs().unwrap();

        let f = |x: Point| x.x * x.x * x.y - 2.0 * x.y * x.y + 0.5;
        let source = ExactSolution::new(move |x: Point| {
            FnValue::new(f(x), [2.0 * x.x * x.y, x.x * x.x - 4.0 * x.y])
        });
        let projection = LinearProblem::new().project(&space, &source).unwrap();
        assert_matches(&projection, f, 1e-10);

        // projecting a discrete Solution onto a finer copy of its Space reproduces it
        let mut fine = space.dup(space.mesh().clone());
        fine.refine_element(0, HRef::T).unwrap();
        fine.assign_dofs().unwrap();
        let reprojected = LinearProblem::new().project(&fine, &projection).unwrap();
        assert_matches(&reprojected, f, 1e-9);
        assert!(reprojected.eval_root(0, V2D::from([0.3, -0.4])).is_some());
    }
}
