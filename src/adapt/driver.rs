use super::{
    config::{AdaptConfig, CoarseSolution, ConfigError},
    estimator::{exact_error_parts, relative, ElemKey, ErrorForm, ErrorReport, Estimator},
    marking::mark_elements,
    reference::ReferenceBuilder,
    selector::{Candidate, Selection, Selector},
    AdaptError,
};
use crate::domain::{
    fields::{MeshFunction, Solution},
    mesh::h_refinement::HRefError,
    space::{Space, SpaceError},
};
use crate::fem_problem::{Solver, SystemSolver};

use log::{debug, info, warn};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};

/// Phases of one adaptivity step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdaptState {
    Idle,
    Marking,
    Scoring,
    Committing,
    Renumbering,
    Done,
}

/// Why the adaptivity loop ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// the estimated error fell below `ERR_STOP`
    ErrorTolerance,
    /// the coarse Spaces reached `NDOF_STOP` DoFs
    DofLimit,
    /// no Elem was marked (or none could be refined)
    NothingToRefine,
}

/// Record of one step of the adaptivity loop
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub step: usize,
    /// DoFs of the coarse Spaces (summed over components)
    pub ndof_coarse: usize,
    pub ndof_fine: usize,
    /// estimated relative error in percent
    pub err_est: f64,
    /// relative error against the exact solutions in percent, when they are known
    pub err_exact: Option<f64>,
    /// number of Elems marked for refinement (0 on the final step)
    pub num_marked: usize,
}

/// Receives read-only access to the results of every adaptivity step (one Solution per component)
pub trait AdaptObserver {
    fn on_step(&mut self, report: &StepReport, coarse: &[Solution], reference: &[Solution]);
}

/// `(ndof, error)` pairs of an adaptive computation, for the estimated and (optionally) the exact error
#[derive(Clone, Debug, Default)]
pub struct ConvergenceGraph {
    values: Vec<(usize, f64)>,
    exact_values: Vec<(usize, f64)>,
}

impl ConvergenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_values(&mut self, ndof: usize, error: f64) {
        self.values.push((ndof, error));
    }

    pub fn add_exact_values(&mut self, ndof: usize, error: f64) {
        self.exact_values.push((ndof, error));
    }

    pub fn values(&self) -> &[(usize, f64)] {
        &self.values
    }

    pub fn exact_values(&self) -> &[(usize, f64)] {
        &self.exact_values
    }

    /// Write the estimated error pairs as a two-column text file
    pub fn save(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        write_pairs(path, &self.values)
    }

    /// Write the exact error pairs as a two-column text file
    pub fn save_exact(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        write_pairs(path, &self.exact_values)
    }
}

fn write_pairs(path: impl AsRef<str>, values: &[(usize, f64)]) -> std::io::Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(&file);
    for (ndof, error) in values.iter() {
        writeln!(writer, "{} {:.15e}", ndof, error)?;
    }
    writer.flush()
}

impl AdaptObserver for ConvergenceGraph {
    fn on_step(&mut self, report: &StepReport, _: &[Solution], _: &[Solution]) {
        self.add_values(report.ndof_coarse, report.err_est);
        if let Some(err_exact) = report.err_exact {
            self.add_exact_values(report.ndof_coarse, err_exact);
        }
    }
}

/// Result of a complete adaptive computation
#[derive(Clone, Debug)]
pub struct AdaptSummary {
    pub reason: StopReason,
    pub steps: usize,
    pub history: Vec<StepReport>,
    /// DoFs of the final coarse Spaces
    pub ndof: usize,
}

/// Result of a single [Adapt::adapt] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdaptOutcome {
    Refined { num_marked: usize, ndof: usize },
    NothingToRefine,
}

/// Refines Spaces from the errors of their Elems: marking, candidate scoring, committing and renumbering
pub struct Adapt {
    config: AdaptConfig,
    selector: Selector,
    state: AdaptState,
}

impl Adapt {
    pub fn new(config: &AdaptConfig) -> Self {
        Self {
            config: config.clone(),
            selector: Selector::from_config(config),
            state: AdaptState::Idle,
        }
    }

    pub fn state(&self) -> AdaptState {
        self.state
    }

    fn transition(&mut self, next: AdaptState) {
        debug!("adapt: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run one round of refinement on `space` and re-assign its DoFs
    ///
    /// `report` must come from a coarse Solution on `space` and `reference`.
    pub fn adapt(
        &mut self,
        space: &mut Space,
        report: &ErrorReport,
        reference: &Solution,
    ) -> Result<AdaptOutcome, AdaptError> {
        self.adapt_system(std::slice::from_mut(space), report, std::slice::from_ref(reference))
    }

    /// Run one round of refinement on the Spaces of a system and re-assign their DoFs
    ///
    /// Elems of all components compete in one marking pass. Marked Elems are scored in parallel over the Rayon
    /// Global Threadpool and committed in increasing (component, id) order.
    pub fn adapt_system(
        &mut self,
        spaces: &mut [Space],
        report: &ErrorReport,
        references: &[Solution],
    ) -> Result<AdaptOutcome, AdaptError> {
        ConfigError::check_components("reference Solutions", spaces.len(), references.len())?;
        if report.num_components() > spaces.len() {
            return Err(ConfigError::ComponentMismatch {
                what: "estimated components",
                expected: spaces.len(),
                found: report.num_components(),
            }
            .into());
        }

        self.transition(AdaptState::Marking);
        let marked = mark_elements(report, self.config.strategy, self.config.threshold);
        debug!("marked {} of {} Elems: {:?}", marked.len(), report.elem_errors.len(), marked);
        if marked.is_empty() {
            self.transition(AdaptState::Done);
            return Ok(AdaptOutcome::NothingToRefine);
        }

        self.transition(AdaptState::Scoring);
        let selector = self.selector;
        let coarse: &[Space] = &*spaces;
        let mut selections = marked
            .par_iter()
            .map(|key| {
                let space = &coarse[key.component];
                selector
                    .select(
                        space.mesh(),
                        key.elem_id,
                        space.element_order(key.elem_id),
                        &references[key.component],
                    )
                    .map(|selection| (*key, selection))
            })
            .collect::<Result<Vec<(ElemKey, Selection)>, AdaptError>>()?;
        selections.sort_by_key(|(key, _)| *key);

        self.transition(AdaptState::Committing);
        let mut committed = vec![0; spaces.len()];
        for (key, selection) in selections {
            let ElemKey { component, elem_id } = key;
            let space = &mut spaces[component];
            if !space.mesh().is_active(elem_id) {
                warn!("Elem {} of Space {} is no longer active; skipping its refinement", elem_id, component);
                continue;
            }
            match commit(space, elem_id, &selection.candidate) {
                Ok(()) => {
                    debug!(
                        "Space {} Elem {}: {:?} (score {:.4})",
                        component, elem_id, selection.candidate, selection.score
                    );
                    committed[component] += 1;
                }
                Err(SpaceError::HRef(HRefError::MinEdgeLength(edge_id))) => {
                    warn!(
                        "refining Elem {} of Space {} would shorten Edge {} below the minimum length; skipping it",
                        elem_id, component, edge_id
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        if committed.iter().all(|count| *count == 0) {
            self.transition(AdaptState::Done);
            return Ok(AdaptOutcome::NothingToRefine);
        }

        for (component, space) in spaces.iter_mut().enumerate() {
            if committed[component] == 0 {
                continue;
            }
            let regularized = space.regularize(self.config.regularity)?;
            if !regularized.is_empty() {
                debug!(
                    "regularization split {} additional Elems of Space {}",
                    regularized.len(),
                    component
                );
            }
        }

        self.transition(AdaptState::Renumbering);
        let mut ndof = 0;
        for space in spaces.iter_mut() {
            ndof += space.assign_dofs()?;
        }
        self.transition(AdaptState::Idle);

        Ok(AdaptOutcome::Refined {
            num_marked: marked.len(),
            ndof,
        })
    }
}

fn commit(space: &mut Space, elem_id: usize, candidate: &Candidate) -> Result<(), SpaceError> {
    match candidate {
        Candidate::P(orders) => space.set_element_order(elem_id, *orders),
        Candidate::H { refinement, sons } => {
            space.refine_element(elem_id, *refinement)?;
            let children = space.mesh().elems[elem_id].child_ids().unwrap_or_default();
            for (child_id, orders) in children.iter().zip(sons.iter()) {
                space.set_element_order(*child_id, *orders)?;
            }
            Ok(())
        }
    }
}

/// The hp-adaptivity loop
///
/// Each step builds reference Spaces, solves on the coarse and reference Spaces, estimates the error of the coarse
/// Solutions and refines the coarse Spaces, until the error or DoF targets of the [AdaptConfig] are met.
pub struct AdaptivityLoop<'o> {
    config: AdaptConfig,
    reference_builder: ReferenceBuilder,
    observers: Vec<&'o mut dyn AdaptObserver>,
    exact: Vec<&'o dyn MeshFunction>,
}

impl<'o> AdaptivityLoop<'o> {
    pub fn new(config: AdaptConfig) -> Result<Self, AdaptError> {
        config.validate()?;
        Ok(Self {
            reference_builder: ReferenceBuilder::new(config.order_increase),
            config,
            observers: Vec::new(),
            exact: Vec::new(),
        })
    }

    pub fn with_reference_builder(mut self, reference_builder: ReferenceBuilder) -> Self {
        self.reference_builder = reference_builder;
        self
    }

    pub fn with_observer(mut self, observer: &'o mut dyn AdaptObserver) -> Self {
        self.observers.push(observer);
        self
    }

    /// Track the error against a known solution (one call per component, in order)
    pub fn with_exact_solution(mut self, exact: &'o dyn MeshFunction) -> Self {
        self.exact.push(exact);
        self
    }

    pub fn config(&self) -> &AdaptConfig {
        &self.config
    }

    /// Adapt `space` until a stopping criterion is met
    ///
    /// Solver failures abort the loop; `space` keeps the refinements of the completed steps.
    pub fn run(
        &mut self,
        space: &mut Space,
        solver: &dyn Solver,
        form: &dyn ErrorForm,
    ) -> Result<AdaptSummary, AdaptError> {
        self.run_system(std::slice::from_mut(space), &solver, &[form])
    }

    /// Adapt the Spaces of a system (one Space and one error form per component) until a stopping criterion is met
    ///
    /// Errors and DoF counts are taken over all components together.
    pub fn run_system(
        &mut self,
        spaces: &mut [Space],
        solver: &dyn SystemSolver,
        forms: &[&dyn ErrorForm],
    ) -> Result<AdaptSummary, AdaptError> {
        let num_components = spaces.len();
        ConfigError::check_components("Solver components", num_components, solver.num_components())?;
        ConfigError::check_components("error forms", num_components, forms.len())?;
        if !self.exact.is_empty() {
            ConfigError::check_components("exact solutions", num_components, self.exact.len())?;
        }

        for space in spaces.iter_mut() {
            if space.dof_table().is_err() {
                space.assign_dofs()?;
            }
        }

        let mut adapt = Adapt::new(&self.config);
        let mut history = Vec::new();
        let mut step = 0;

        loop {
            step += 1;
            info!("---- adaptivity step {}", step);

            let ref_spaces = spaces
                .iter()
                .map(|space| self.reference_builder.build(space))
                .collect::<Result<Vec<Space>, AdaptError>>()?;
            let ref_solutions = solver.solve_system(&ref_spaces)?;
            ConfigError::check_components("reference Solutions", num_components, ref_solutions.len())?;
            let coarse_solutions = match self.config.coarse_solution {
                CoarseSolution::Solve => solver.solve_system(spaces)?,
                CoarseSolution::Project => solver.project_system(spaces, &ref_solutions)?,
            };
            ConfigError::check_components("coarse Solutions", num_components, coarse_solutions.len())?;

            let mut estimator = Estimator::for_system(forms.to_vec());
            estimator.set_system_solutions(&coarse_solutions, &ref_solutions)?;
            let report = estimator.calc_error()?;
            let err_est = report.percent();

            let ndof_coarse: usize = coarse_solutions.iter().map(|s| s.num_dofs()).sum();
            let ndof_fine: usize = ref_solutions.iter().map(|s| s.num_dofs()).sum();
            let err_exact = self.exact_error(&coarse_solutions, forms);

            match err_exact {
                Some(err_exact) => info!(
                    "ndof_coarse: {}, ndof_fine: {}, err_est: {:.6}%, err_exact: {:.6}%",
                    ndof_coarse, ndof_fine, err_est, err_exact
                ),
                None => info!(
                    "ndof_coarse: {}, ndof_fine: {}, err_est: {:.6}%",
                    ndof_coarse, ndof_fine, err_est
                ),
            }

            let mut step_report = StepReport {
                step,
                ndof_coarse,
                ndof_fine,
                err_est,
                err_exact,
                num_marked: 0,
            };

            let reason = if err_est < self.config.err_stop {
                Some(StopReason::ErrorTolerance)
            } else {
                match adapt.adapt_system(spaces, &report, &ref_solutions)? {
                    AdaptOutcome::NothingToRefine => Some(StopReason::NothingToRefine),
                    AdaptOutcome::Refined { num_marked, ndof } => {
                        step_report.num_marked = num_marked;
                        if ndof >= self.config.ndof_stop {
                            Some(StopReason::DofLimit)
                        } else {
                            None
                        }
                    }
                }
            };

            for observer in self.observers.iter_mut() {
                observer.on_step(&step_report, &coarse_solutions, &ref_solutions);
            }
            history.push(step_report);

            if let Some(reason) = reason {
                info!("adaptivity finished after {} steps: {:?}", step, reason);
                let mut ndof = 0;
                for space in spaces.iter() {
                    ndof += space.num_dofs()?;
                }
                return Ok(AdaptSummary {
                    reason,
                    steps: step,
                    history,
                    ndof,
                });
            }
        }
    }

    // relative error of all components against the exact solutions, in percent
    fn exact_error(&self, solutions: &[Solution], forms: &[&dyn ErrorForm]) -> Option<f64> {
        if self.exact.is_empty() {
            return None;
        }
        let (err_sq, norm_sq) = solutions
            .iter()
            .zip(self.exact.iter())
            .zip(forms.iter())
            .map(|((solution, exact), form)| exact_error_parts(solution, *exact, *form))
            .fold((0.0, 0.0), |(e, n), (err_sq, norm_sq)| (e + err_sq, n + norm_sq));

        Some(relative(err_sq, norm_sq) * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::{
        config::{CandList, Strategy},
        estimator::H1SemiNorm,
    };
    use crate::domain::{
        fields::{ExactSolution, FnValue, MeshFunction},
        mesh::{geometry::Point, p_refinement::PolyOrders, Mesh},
        space::{BcType, SpaceKind},
    };
    use crate::fem_problem::LinearProblem;
    use crate::linalg::SolveError;

    fn peak_problem() -> LinearProblem {
        // u = sin(πx) sin(πy)
        let pi = std::f64::consts::PI;
        LinearProblem::poisson(move |x: Point| 2.0 * pi * pi * (pi * x.x).sin() * (pi * x.y).sin())
    }

    fn dirichlet_space(mesh: Mesh, p: u8) -> Space {
        let mut space = Space::new(mesh, SpaceKind::H1, p, |_| BcType::Essential).unwrap();
        space.assign_dofs().unwrap();
        space
    }

    fn estimate(space: &Space, problem: &LinearProblem) -> (ErrorReport, Solution) {
        let reference = ReferenceBuilder::default().build(space).unwrap();
        let ref_solution = problem.solve(&reference).unwrap();
        let coarse_solution = problem.solve(space).unwrap();

        let form = H1SemiNorm;
        let mut estimator = Estimator::new(&form);
        estimator.set_solutions(&coarse_solution, &ref_solution);
        (estimator.calc_error().unwrap(), ref_solution)
    }

    fn single_elem_space(p: u8) -> (Space, LinearProblem) {
        let problem = LinearProblem::new()
            .with_reaction(|_, _| 1.0)
            .with_source(|_, x| (3.0 * x.x).exp() * x.y);
        let space = Space::new(Mesh::unit(), SpaceKind::H1, p, |_| BcType::Natural).unwrap();
        (space, problem)
    }

    #[test]
    fn single_elem_h_adapt_step_splits_into_four() {
        let (mut space, problem) = single_elem_space(1);
        let ndof_before = space.assign_dofs().unwrap();
        let (report, reference) = estimate(&space, &problem);

        // h-adaptivity (ADAPT_TYPE 1, ISO_ONLY) with STRATEGY 0 and THRESHOLD 0.3
        let config = AdaptConfig::from_json_str(
            r#"{ "ADAPT_TYPE": 1, "ISO_ONLY": true, "STRATEGY": 0, "THRESHOLD": 0.3 }"#,
        )
        .unwrap();
        assert_eq!(config.cand_list, CandList::HIso);
        let mut adapt = Adapt::new(&config);
        let outcome = adapt.adapt(&mut space, &report, &reference).unwrap();

        assert_eq!(space.mesh().elems[0].child_ids().map(|children| children.len()), Some(4));
        assert_eq!(space.mesh().num_active_elements(), 4);
        match outcome {
            AdaptOutcome::Refined { num_marked, ndof } => {
                assert_eq!(num_marked, 1);
                assert!(ndof > ndof_before);
            }
            AdaptOutcome::NothingToRefine => panic!("the only Elem should have been refined"),
        }
        assert_eq!(adapt.state(), AdaptState::Idle);
    }

    #[test]
    fn single_elem_hp_adapt_step_adds_dofs() {
        let (mut space, problem) = single_elem_space(1);
        let ndof_before = space.assign_dofs().unwrap();
        let (report, reference) = estimate(&space, &problem);

        // with p-candidates available the winner may keep the geometry
        let outcome = Adapt::new(&AdaptConfig::default())
            .adapt(&mut space, &report, &reference)
            .unwrap();
        assert!(matches!(outcome, AdaptOutcome::Refined { num_marked: 1, ndof } if ndof > ndof_before));
        assert!(space.mesh().elems[0].has_children() || space.element_order(0) != PolyOrders::iso(1));
    }

    #[test]
    fn absolute_strategy_respects_threshold() {
        let problem = peak_problem();
        let mesh = Mesh::rectangle_grid(3, 3, Point::new(0.0, 0.0), Point::new(1.0, 1.0), 1).unwrap();
        let mut space = dirichlet_space(mesh, 1);
        let (report, reference) = estimate(&space, &problem);

        let indicators = report.relative_indicators();
        let threshold = indicators[indicators.len() / 2].1;
        let config = AdaptConfig {
            strategy: Strategy::Absolute,
            threshold,
            cand_list: CandList::HIso,
            ..Default::default()
        };
        Adapt::new(&config).adapt(&mut space, &report, &reference).unwrap();

        for (key, indicator) in indicators {
            assert_eq!(space.mesh().is_active(key.elem_id), indicator < threshold);
        }
    }

    #[test]
    fn stops_at_dof_limit() {
        let problem = peak_problem();
        let mut space = dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 1);
        let config = AdaptConfig {
            err_stop: 0.0,
            ndof_stop: 40,
            cand_list: CandList::HpIso,
            ..Default::default()
        };

        let summary = AdaptivityLoop::new(config)
            .unwrap()
            .run(&mut space, &problem, &H1SemiNorm)
            .unwrap();

        assert_eq!(summary.reason, StopReason::DofLimit);
        assert!(summary.ndof >= 40);
        assert_eq!(summary.ndof, space.num_dofs().unwrap());
        assert_eq!(summary.history.len(), summary.steps);
        for report in summary.history.iter() {
            assert!(report.ndof_coarse < 40);
            assert!(report.ndof_fine > report.ndof_coarse);
            assert!(report.num_marked > 0);
        }
    }

    #[test]
    fn error_decreases_and_is_recorded() {
        let problem = peak_problem();
        let mut space = dirichlet_space(Mesh::from_file("./test_input/square_tri.json").unwrap(), 2);
        let config = AdaptConfig {
            err_stop: 1.0,
            ndof_stop: 2000,
            ..Default::default()
        };

        let mut graph = ConvergenceGraph::new();
        let summary = AdaptivityLoop::new(config)
            .unwrap()
            .with_observer(&mut graph)
            .run(&mut space, &problem, &problem.energy_norm())
            .unwrap();

        assert_eq!(summary.reason, StopReason::ErrorTolerance);
        assert_eq!(graph.values().len(), summary.steps);
        let (_, first_err) = graph.values()[0];
        let (_, last_err) = graph.values()[summary.steps - 1];
        assert!(last_err < 1.0 && last_err < first_err);

        std::fs::create_dir_all("./test_output").unwrap();
        graph.save("./test_output/conv_dof.dat").unwrap();
        let contents = std::fs::read_to_string("./test_output/conv_dof.dat").unwrap();
        assert_eq!(contents.lines().count(), summary.steps);
    }

    #[test]
    fn projected_coarse_solution() {
        let problem = peak_problem();
        let mut space = dirichlet_space(Mesh::from_file("./test_input/l_shape.json").unwrap(), 2);
        let config = AdaptConfig {
            err_stop: 100.0,
            coarse_solution: CoarseSolution::Project,
            ..Default::default()
        };

        let summary = AdaptivityLoop::new(config)
            .unwrap()
            .run(&mut space, &problem, &H1SemiNorm)
            .unwrap();
        assert_eq!(summary.reason, StopReason::ErrorTolerance);
        assert_eq!(summary.steps, 1);
        assert_eq!(space.mesh().num_active_elements(), 3);
    }

    #[test]
    fn exact_solutions_stop_immediately() {
        // u = x (1 - x) y (1 - y) is in the p = 2 Space
        let problem = LinearProblem::poisson(|x: Point| 2.0 * (x.y * (1.0 - x.y) + x.x * (1.0 - x.x)));
        let mut space = dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 2);

        let summary = AdaptivityLoop::new(AdaptConfig::default())
            .unwrap()
            .run(&mut space, &problem, &H1SemiNorm)
            .unwrap();
        assert_eq!(summary.reason, StopReason::ErrorTolerance);
        assert!(summary.history[0].err_est < 1e-6);
    }

    struct FailingSolver;

    impl Solver for FailingSolver {
        fn solve(&self, _: &Space) -> Result<Solution, SolveError> {
            Err(SolveError::SingularSystem)
        }

        fn project(&self, _: &Space, _: &dyn MeshFunction) -> Result<Solution, SolveError> {
            Err(SolveError::SingularSystem)
        }
    }

    #[test]
    fn solver_failures_abort() {
        let mut space = dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 1);
        let result = AdaptivityLoop::new(AdaptConfig::default())
            .unwrap()
            .run(&mut space, &FailingSolver, &H1SemiNorm);

        assert!(matches!(result, Err(AdaptError::Solve(SolveError::SingularSystem))));
        assert_eq!(space.mesh().num_active_elements(), 4);
    }

    fn peak_exact() -> ExactSolution<impl Fn(Point) -> FnValue + Sync> {
        let pi = std::f64::consts::PI;
        ExactSolution::new(move |x: Point| {
            FnValue::new(
                (pi * x.x).sin() * (pi * x.y).sin(),
                [
                    pi * (pi * x.x).cos() * (pi * x.y).sin(),
                    pi * (pi * x.x).sin() * (pi * x.y).cos(),
                ],
            )
        })
    }

    fn bubble_problem() -> LinearProblem {
        // u = x (1 - x) y (1 - y) is in the p = 2 Space
        LinearProblem::poisson(|x: Point| 2.0 * (x.y * (1.0 - x.y) + x.x * (1.0 - x.x)))
    }

    #[test]
    fn exact_error_is_recorded() {
        let problem = peak_problem();
        let exact = peak_exact();
        let mut space = dirichlet_space(Mesh::from_file("./test_input/square_tri.json").unwrap(), 2);
        let config = AdaptConfig {
            err_stop: 1.0,
            ndof_stop: 2000,
            ..Default::default()
        };

        let mut graph = ConvergenceGraph::new();
        let summary = AdaptivityLoop::new(config)
            .unwrap()
            .with_observer(&mut graph)
            .with_exact_solution(&exact)
            .run(&mut space, &problem, &H1SemiNorm)
            .unwrap();

        assert!(summary.history.iter().all(|report| report.err_exact.is_some()));
        assert_eq!(graph.exact_values().len(), summary.steps);
        assert_eq!(graph.values().len(), summary.steps);
        let (_, first_err) = graph.exact_values()[0];
        let (_, last_err) = graph.exact_values()[summary.steps - 1];
        assert!(last_err < first_err);

        std::fs::create_dir_all("./test_output").unwrap();
        graph.save_exact("./test_output/conv_dof_exact.dat").unwrap();
        let contents = std::fs::read_to_string("./test_output/conv_dof_exact.dat").unwrap();
        assert_eq!(contents.lines().count(), summary.steps);
    }

    #[test]
    fn exact_error_is_omitted_without_exact_solution() {
        let problem = bubble_problem();
        let mut space = dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 2);

        let mut graph = ConvergenceGraph::new();
        let summary = AdaptivityLoop::new(AdaptConfig::default())
            .unwrap()
            .with_observer(&mut graph)
            .run(&mut space, &problem, &H1SemiNorm)
            .unwrap();
        assert_eq!(summary.history[0].err_exact, None);
        assert!(graph.exact_values().is_empty());
    }

    #[test]
    fn system_stops_at_summed_dof_limit() {
        let problems = vec![peak_problem(), peak_problem()];
        let mut spaces = vec![
            dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 1),
            dirichlet_space(Mesh::from_file("./test_input/square_tri.json").unwrap(), 1),
        ];
        let config = AdaptConfig {
            err_stop: 0.0,
            ndof_stop: 60,
            cand_list: CandList::HpIso,
            ..Default::default()
        };

        let summary = AdaptivityLoop::new(config)
            .unwrap()
            .run_system(&mut spaces, &problems, &[&H1SemiNorm, &H1SemiNorm])
            .unwrap();

        assert_eq!(summary.reason, StopReason::DofLimit);
        let total: usize = spaces.iter().map(|space| space.num_dofs().unwrap()).sum();
        assert_eq!(summary.ndof, total);
        assert!(total >= 60);
        for report in summary.history.iter() {
            assert!(report.ndof_coarse < 60);
            assert!(report.ndof_fine > report.ndof_coarse);
        }
    }

    #[test]
    fn system_refines_only_inexact_components() {
        let problems = [peak_problem(), bubble_problem()];
        let mut spaces = vec![
            dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 1),
            dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 2),
        ];

        let builder = ReferenceBuilder::default();
        let references: Vec<Solution> = spaces
            .iter()
            .zip(problems.iter())
            .map(|(space, problem)| problem.solve(&builder.build(space).unwrap()).unwrap())
            .collect();
        let coarse: Vec<Solution> = spaces
            .iter()
            .zip(problems.iter())
            .map(|(space, problem)| problem.solve(space).unwrap())
            .collect();

        let mut estimator = Estimator::for_system(vec![&H1SemiNorm as &dyn ErrorForm, &H1SemiNorm]);
        estimator.set_system_solutions(&coarse, &references).unwrap();
        let report = estimator.calc_error().unwrap();
        assert!(report.component_rel_error(1) < 1e-6);

        let config = AdaptConfig {
            strategy: Strategy::RelativeToMax,
            threshold: 0.3,
            cand_list: CandList::HIso,
            ..Default::default()
        };
        let outcome = Adapt::new(&config).adapt_system(&mut spaces, &report, &references).unwrap();

        assert!(spaces[0].mesh().num_active_elements() > 4);
        assert_eq!(spaces[1].mesh().num_active_elements(), 4);
        match outcome {
            AdaptOutcome::Refined { ndof, .. } => {
                let total: usize = spaces.iter().map(|space| space.num_dofs().unwrap()).sum();
                assert_eq!(ndof, total);
            }
            AdaptOutcome::NothingToRefine => panic!("the peak component should have been refined"),
        }
    }

    #[test]
    fn system_component_counts_must_match() {
        let problem = peak_problem();
        let mut spaces = vec![
            dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 1),
            dirichlet_space(Mesh::from_file("./test_input/square_quad.json").unwrap(), 1),
        ];
        let (report, reference) = estimate(&spaces[0], &problem);

        let result = Adapt::new(&AdaptConfig::default()).adapt_system(&mut spaces, &report, &[reference]);
        assert!(matches!(
            result,
            Err(AdaptError::Config(ConfigError::ComponentMismatch { expected: 2, found: 1, .. }))
        ));

        let problems = vec![peak_problem(), peak_problem()];
        let result = AdaptivityLoop::new(AdaptConfig::default())
            .unwrap()
            .run_system(&mut spaces, &problems, &[&H1SemiNorm]);
        assert!(matches!(
            result,
            Err(AdaptError::Config(ConfigError::ComponentMismatch { expected: 2, found: 1, .. }))
        ));

        let result = AdaptivityLoop::new(AdaptConfig::default())
            .unwrap()
            .run_system(&mut [], &problems, &[]);
        assert!(matches!(result, Err(AdaptError::Config(ConfigError::NoComponents))));
        assert_eq!(spaces[0].mesh().num_active_elements(), 4);
    }

    #[test]
    #[should_panic]
    fn invalid_config() {
        let config = AdaptConfig {
            threshold: 0.0,
            ..Default::default()
        };
        AdaptivityLoop::new(config).unwrap();
    }
}
