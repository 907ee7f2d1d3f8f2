use super::{config::ConfigError, AdaptError};
use crate::domain::{
    fields::{FnValue, MeshFunction, Solution},
    mesh::Mesh,
};
use crate::fem_problem::{galerkin::QuadPoint, Coefficient};
use crate::integration::{num_glq_points, QuadRule};

use log::debug;
use rayon::prelude::*;
use std::cmp::Ordering;

/// A squared norm, given pointwise by its integrand
pub trait ErrorForm: Sync {
    fn integrand(&self, qp: &QuadPoint, u: &FnValue) -> f64;
}

/// `|grad u|^2`
#[derive(Clone, Copy, Debug, Default)]
pub struct H1SemiNorm;

impl ErrorForm for H1SemiNorm {
    fn integrand(&self, _: &QuadPoint, u: &FnValue) -> f64 {
        u.grad.dot_with(&u.grad)
    }
}

/// `|grad u|^2 + u^2`
#[derive(Clone, Copy, Debug, Default)]
pub struct H1Norm;

impl ErrorForm for H1Norm {
    fn integrand(&self, _: &QuadPoint, u: &FnValue) -> f64 {
        u.grad.dot_with(&u.grad) + u.value * u.value
    }
}

/// `u^2`
#[derive(Clone, Copy, Debug, Default)]
pub struct L2Norm;

impl ErrorForm for L2Norm {
    fn integrand(&self, _: &QuadPoint, u: &FnValue) -> f64 {
        u.value * u.value
    }
}

/// `a |grad u|^2 + c u^2` for a diffusion coefficient `a` and a reaction coefficient `c`
#[derive(Clone)]
pub struct EnergyNorm {
    diffusion: Coefficient,
    reaction: Coefficient,
}

impl EnergyNorm {
    pub fn new(diffusion: Coefficient, reaction: Coefficient) -> Self {
        Self { diffusion, reaction }
    }
}

impl ErrorForm for EnergyNorm {
    fn integrand(&self, qp: &QuadPoint, u: &FnValue) -> f64 {
        (self.diffusion)(qp.marker, qp.x) * u.grad.dot_with(&u.grad)
            + (self.reaction)(qp.marker, qp.x) * u.value * u.value
    }
}

/// An active Elem of one component Space
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElemKey {
    pub component: usize,
    pub elem_id: usize,
}

impl ElemKey {
    pub const fn new(component: usize, elem_id: usize) -> Self {
        Self { component, elem_id }
    }
}

/// Error contribution of one coarse Elem
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ElemError {
    /// index of the Space (0 for single Space problems)
    pub component: usize,
    pub elem_id: usize,
    /// squared norm of `reference - coarse` over the Elem
    pub err_sq: f64,
    /// squared norm of `reference` over the Elem
    pub norm_sq: f64,
}

impl ElemError {
    pub fn key(&self) -> ElemKey {
        ElemKey::new(self.component, self.elem_id)
    }
}

/// Result of an error estimation
#[derive(Clone, Debug, Default)]
pub struct ErrorReport {
    /// per-Elem errors of every component in decreasing order of `err_sq` (ties broken by increasing key)
    pub elem_errors: Vec<ElemError>,
    pub total_err_sq: f64,
    pub total_norm_sq: f64,
}

impl ErrorReport {
    fn from_elem_errors(mut elem_errors: Vec<ElemError>) -> Self {
        elem_errors.sort_by(|a, b| match b.err_sq.partial_cmp(&a.err_sq) {
            Some(Ordering::Equal) | None => a.key().cmp(&b.key()),
            Some(ordering) => ordering,
        });

        Self {
            total_err_sq: elem_errors.iter().map(|e| e.err_sq).sum(),
            total_norm_sq: elem_errors.iter().map(|e| e.norm_sq).sum(),
            elem_errors,
        }
    }

    /// `sqrt(sum err^2) / sqrt(sum norm^2)`; the absolute error if the reference norm vanishes
    pub fn rel_error(&self) -> f64 {
        relative(self.total_err_sq, self.total_norm_sq)
    }

    /// [ErrorReport::rel_error] in percent
    pub fn percent(&self) -> f64 {
        self.rel_error() * 100.0
    }

    /// Relative error of a single component
    pub fn component_rel_error(&self, component: usize) -> f64 {
        let (err_sq, norm_sq) = self
            .elem_errors
            .iter()
            .filter(|e| e.component == component)
            .fold((0.0, 0.0), |(err_sq, norm_sq), e| (err_sq + e.err_sq, norm_sq + e.norm_sq));
        relative(err_sq, norm_sq)
    }

    /// One more than the largest component index
    pub fn num_components(&self) -> usize {
        self.elem_errors.iter().map(|e| e.component + 1).max().unwrap_or(0)
    }

    /// Squared error of each Elem relative to the total reference norm (same order as `elem_errors`)
    pub fn relative_indicators(&self) -> Vec<(ElemKey, f64)> {
        let scale = if self.total_norm_sq > 0.0 { self.total_norm_sq } else { 1.0 };
        self.elem_errors
            .iter()
            .map(|e| (e.key(), e.err_sq / scale))
            .collect()
    }
}

pub(crate) fn relative(err_sq: f64, norm_sq: f64) -> f64 {
    if norm_sq > 0.0 {
        (err_sq / norm_sq).sqrt()
    } else {
        err_sq.sqrt()
    }
}

/// Estimates the error of coarse Solutions by comparing them with reference Solutions on nested Meshes
///
/// Systems are estimated component by component, each with its own [ErrorForm]; the global error is taken over
/// all components together.
pub struct Estimator<'a> {
    forms: Vec<&'a dyn ErrorForm>,
    solutions: Vec<(&'a Solution, &'a Solution)>,
}

impl<'a> Estimator<'a> {
    pub fn new(form: &'a dyn ErrorForm) -> Self {
        Self::for_system(vec![form])
    }

    /// Estimator of a system with one form per component
    pub fn for_system(forms: Vec<&'a dyn ErrorForm>) -> Self {
        Self {
            forms,
            solutions: Vec::new(),
        }
    }

    pub fn set_solutions(&mut self, coarse: &'a Solution, reference: &'a Solution) {
        self.solutions = vec![(coarse, reference)];
    }

    /// Set the coarse and reference Solutions of every component
    pub fn set_system_solutions(&mut self, coarse: &'a [Solution], reference: &'a [Solution]) -> Result<(), AdaptError> {
        ConfigError::check_components("reference Solutions", coarse.len(), reference.len())?;
        ConfigError::check_components("error forms", coarse.len(), self.forms.len())?;
        self.solutions = coarse.iter().zip(reference.iter()).collect();
        Ok(())
    }

    /// Integrate the error form of `reference - coarse` over every active coarse Elem
    ///
    /// Each coarse Elem must exist in the reference Mesh with the same geometry; the integrals are taken over its
    /// active descendants there. Computations are parallelized over the Rayon Global Threadpool.
    pub fn calc_error(&self) -> Result<ErrorReport, AdaptError> {
        if self.solutions.is_empty() {
            return Err(AdaptError::SolutionsNotSet);
        }
        ConfigError::check_components("error forms", self.solutions.len(), self.forms.len())?;

        let keys: Vec<ElemKey> = self
            .solutions
            .iter()
            .enumerate()
            .flat_map(|(component, (coarse, _))| {
                coarse
                    .mesh()
                    .active_elem_ids()
                    .into_iter()
                    .map(move |elem_id| ElemKey::new(component, elem_id))
            })
            .collect();

        let elem_errors = keys
            .into_par_iter()
            .map(|key| self.elem_error(key))
            .collect::<Result<Vec<_>, AdaptError>>()?;

        let report = ErrorReport::from_elem_errors(elem_errors);
        debug!(
            "estimated error over {} Elems of {} components: {:.6e} (relative {:.6e})",
            report.elem_errors.len(),
            self.solutions.len(),
            report.total_err_sq.sqrt(),
            report.rel_error()
        );
        Ok(report)
    }

    fn elem_error(&self, key: ElemKey) -> Result<ElemError, AdaptError> {
        let ElemKey { component, elem_id } = key;
        let (coarse, reference) = self.solutions[component];
        let form = self.forms[component];
        let coarse_mesh = coarse.mesh();
        let ref_mesh = reference.mesh();
        check_nesting(coarse_mesh, ref_mesh, elem_id)?;

        let coarse_elem = &coarse_mesh.elems[elem_id];
        let coarse_order = coarse
            .local_shape(elem_id)
            .map(|shape| shape.max_order())
            .ok_or(AdaptError::NotNested(elem_id))?;

        let mut err_sq = 0.0;
        let mut norm_sq = 0.0;
        for leaf_id in ref_mesh.active_descendants(elem_id)? {
            let leaf_order = reference
                .local_shape(leaf_id)
                .map(|shape| shape.max_order())
                .ok_or(AdaptError::NotNested(elem_id))?;
            let rule = QuadRule::for_shape(
                ref_mesh.elems[leaf_id].shape,
                num_glq_points(leaf_order.max(coarse_order)),
            );

            for (xi, w) in rule.iter() {
                let (qp, jacobian) = QuadPoint::new(ref_mesh, leaf_id, xi);
                let dx = w * jacobian.det().abs();

                let ref_value = reference.eval_local(leaf_id, xi).ok_or(AdaptError::NotNested(elem_id))?;
                let coarse_value = coarse
                    .eval_local(elem_id, coarse_elem.map.inverse_apply(qp.root))
                    .ok_or(AdaptError::NotNested(elem_id))?;

                err_sq += form.integrand(&qp, &(ref_value - coarse_value)) * dx;
                norm_sq += form.integrand(&qp, &ref_value) * dx;
            }
        }

        Ok(ElemError {
            component,
            elem_id,
            err_sq,
            norm_sq,
        })
    }
}

fn check_nesting(coarse_mesh: &Mesh, ref_mesh: &Mesh, elem_id: usize) -> Result<(), AdaptError> {
    let coarse_elem = &coarse_mesh.elems[elem_id];
    match ref_mesh.elems.get(elem_id) {
        Some(ref_elem)
            if ref_elem.base_id == coarse_elem.base_id
                && ref_elem.shape == coarse_elem.shape
                && ref_elem.map.approx_eq(&coarse_elem.map) =>
        {
            Ok(())
        }
        _ => Err(AdaptError::NotNested(elem_id)),
    }
}

/// Error of a Solution against a known exact solution, relative to the norm of the exact solution
pub fn calc_exact_error(solution: &Solution, exact: &dyn MeshFunction, form: &dyn ErrorForm) -> f64 {
    let (err_sq, norm_sq) = exact_error_parts(solution, exact, form);
    relative(err_sq, norm_sq)
}

/// Squared error against an exact solution and the squared norm of the exact solution
pub(crate) fn exact_error_parts(solution: &Solution, exact: &dyn MeshFunction, form: &dyn ErrorForm) -> (f64, f64) {
    let mesh = solution.mesh();
    mesh.active_elem_ids()
        .into_par_iter()
        .map(|elem_id| {
            let order = solution.local_shape(elem_id).map_or(1, |shape| shape.max_order());
            // exact solutions are rarely polynomials; integrate a few orders higher
            let rule = QuadRule::for_shape(mesh.elems[elem_id].shape, num_glq_points(order + 2));

            rule.iter().fold((0.0, 0.0), |(err_sq, norm_sq), (xi, w)| {
                let (qp, jacobian) = QuadPoint::new(mesh, elem_id, xi);
                let dx = w * jacobian.det().abs();
                let exact_value = exact.eval(qp.base_id, qp.root, qp.x);
                let value = solution.eval_local(elem_id, xi).unwrap_or_default();

                (
                    err_sq + form.integrand(&qp, &(exact_value - value)) * dx,
                    norm_sq + form.integrand(&qp, &exact_value) * dx,
                )
            })
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1))
}
