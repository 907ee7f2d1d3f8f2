use super::mesh::{
    elem::ElemShape,
    geometry::{Point, V2D},
    Mesh,
};
use crate::basis::LocalShape;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Sub;

/// Value and physical gradient of a scalar field at a point
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FnValue {
    pub value: f64,
    pub grad: V2D,
}

impl FnValue {
    pub fn new(value: f64, grad: [f64; 2]) -> Self {
        Self {
            value,
            grad: V2D::from(grad),
        }
    }
}

impl Sub for FnValue {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            value: self.value - rhs.value,
            grad: self.grad - rhs.grad,
        }
    }
}

/// Anything that can be evaluated at a point of a base Elem
///
/// Points are given three ways at once: the base Elem, the reference coordinates on that base Elem (`root`) and
/// the physical location. Discrete solutions use the first two, closed form functions use the last.
pub trait MeshFunction: Sync {
    fn eval(&self, base_id: usize, root: V2D, x: Point) -> FnValue;
}

/// A field known in closed form
pub struct ExactSolution<F>
where
    F: Fn(Point) -> FnValue + Sync,
{
    f: F,
}

impl<F> ExactSolution<F>
where
    F: Fn(Point) -> FnValue + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> MeshFunction for ExactSolution<F>
where
    F: Fn(Point) -> FnValue + Sync,
{
    fn eval(&self, _base_id: usize, _root: V2D, x: Point) -> FnValue {
        (self.f)(x)
    }
}

#[derive(Clone, Debug)]
struct ElemCoefficients {
    shape: LocalShape,
    coefficients: Vec<f64>,
}

/// A discrete solution: global coefficients bound to a snapshot of the Mesh they were computed on
///
/// The local coefficients of each active Elem (constraints already applied) are stored alongside, so
/// the Solution stays valid after the Space it came from is refined.
#[derive(Clone, Debug)]
pub struct Solution {
    mesh: Mesh,
    elems: BTreeMap<usize, ElemCoefficients>,
    coefficients: Vec<f64>,
    essential_values: Vec<f64>,
}

impl Solution {
    /// Build from the local bases of every active Elem and the expansion of their functions
    pub(crate) fn new(
        mesh: Mesh,
        local: Vec<(usize, LocalShape, Vec<f64>)>,
        coefficients: Vec<f64>,
        essential_values: Vec<f64>,
    ) -> Self {
        Self {
            mesh,
            elems: local
                .into_iter()
                .map(|(elem_id, shape, coefficients)| (elem_id, ElemCoefficients { shape, coefficients }))
                .collect(),
            coefficients,
            essential_values,
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Number of free DoFs the Solution was computed with
    pub fn num_dofs(&self) -> usize {
        self.coefficients.len()
    }

    /// Coefficients of the free DoFs
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Values assigned to the essential DoFs
    pub fn essential_values(&self) -> &[f64] {
        &self.essential_values
    }

    /// Local basis of an active Elem
    pub fn local_shape(&self, elem_id: usize) -> Option<&LocalShape> {
        self.elems.get(&elem_id).map(|elem| &elem.shape)
    }

    /// Highest order of any local basis (drives quadrature over this Solution)
    pub fn max_order(&self) -> u8 {
        self.elems
            .values()
            .map(|elem| elem.shape.max_order())
            .max()
            .unwrap_or(1)
    }

    /// Evaluate on an active Elem at reference coordinates `xi`. `None` if the Elem is not active.
    pub fn eval_local(&self, elem_id: usize, xi: V2D) -> Option<FnValue> {
        let elem = self.elems.get(&elem_id)?;
        let (_, jacobian) = self.mesh.geometry(elem_id, xi);

        let (value, ref_grad) = elem
            .shape
            .eval(xi)
            .iter()
            .zip(elem.coefficients.iter())
            .fold((0.0, V2D::zero()), |(value, grad), (shape_value, c)| {
                (value + shape_value.value * c, grad + shape_value.grad * *c)
            });

        Some(FnValue {
            value,
            grad: jacobian.inverse().transpose() * ref_grad,
        })
    }

    /// Evaluate at a point of a base Elem, descending the refinement tree to the active Elem containing it
    pub fn eval_root(&self, base_id: usize, root: V2D) -> Option<FnValue> {
        if base_id >= self.mesh.num_base_elements() {
            return None;
        }
        let (leaf_id, xi) = self.mesh.locate(base_id, root);
        self.eval_local(leaf_id, xi)
    }

    /// Create a VTK file at `path` with the Solution sampled on a `density` x `density` grid over each active Elem
    ///
    /// Triangles are sampled on a collapsed grid. These files can be plotted using
    /// [Visit](https://wci.llnl.gov/simulation/computer-codes/visit)
    pub fn export_to_vtk(&self, path: impl AsRef<str>, density: usize) -> std::io::Result<()> {
        let output_file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(&output_file);
        let n = density.max(2);
        let parametric = uniform_range(-1.0, 1.0, n);

        // header
        writeln!(writer, "# vtk DataFile Version 3.0")?;
        writeln!(writer, "# File generated by hp_fem_2d\n")?;
        writeln!(writer, "ASCII")?;
        writeln!(writer, "DATASET UNSTRUCTURED_GRID")?;

        let mut points = Vec::with_capacity(self.elems.len() * n * n);
        let mut values = Vec::with_capacity(self.elems.len() * n * n);
        for (elem_id, elem) in self.elems.iter() {
            for u in parametric.iter() {
                for v in parametric.iter() {
                    let xi = match elem.shape.shape {
                        ElemShape::Quad => V2D::from([*u, *v]),
                        ElemShape::Tri => V2D::from([(1.0 + u) * (1.0 - v) / 2.0 - 1.0, *v]),
                    };
                    let (x, _) = self.mesh.geometry(*elem_id, xi);
                    points.push(x);
                    values.push(self.eval_local(*elem_id, xi).unwrap_or_default().value);
                }
            }
        }

        // points
        writeln!(writer, "\nPOINTS {} double", points.len())?;
        for point in points.iter() {
            writeln!(writer, "{:.10} {:.10} 0.0", point.x, point.y)?;
        }

        // cells
        let num_cells = (n - 1) * (n - 1) * self.elems.len();
        writeln!(writer, "\nCELLS {} {}", num_cells, 5 * num_cells)?;
        for k in 0..self.elems.len() {
            for i in 0..(n - 1) {
                for j in 0..(n - 1) {
                    let initial_pt = n * i + j + (n * n) * k;
                    writeln!(
                        writer,
                        "4\t{}\t{}\t{}\t{}",
                        initial_pt,
                        initial_pt + 1,
                        initial_pt + n + 1,
                        initial_pt + n,
                    )?;
                }
            }
        }

        // cell types
        writeln!(writer, "\nCELL_TYPES {}", num_cells)?;
        for _ in 0..num_cells {
            write!(writer, " 9")?;
        }
        writeln!(writer)?;

        // field values
        writeln!(writer, "POINT_DATA {}", values.len())?;
        writeln!(writer, "SCALARS u double 1 \nLOOKUP_TABLE default")?;
        for value in values {
            write!(writer, "{:.15} ", value)?;
        }
        writeln!(writer)?;

        Ok(())
    }
}

impl MeshFunction for Solution {
    fn eval(&self, base_id: usize, root: V2D, _x: Point) -> FnValue {
        self.eval_root(base_id, root).unwrap_or_default()
    }
}

fn uniform_range(min: f64, max: f64, n: usize) -> Vec<f64> {
    let step = (max - min) / ((n - 1) as f64);
    (0..n).map(|i| (i as f64) * step + min).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::mesh::{h_refinement::HRef, p_refinement::PolyOrders};

    // u = x + 2y on a single Elem, expressed through its vertex functions
    fn linear_solution(mesh: Mesh, elem_id: usize) -> Solution {
        let shape = LocalShape::full(mesh.elems[elem_id].shape, PolyOrders::iso(1));
        let coefficients = mesh.elems[elem_id]
            .nodes
            .iter()
            .map(|node_id| {
                let p = mesh.nodes[*node_id].coords;
                p.x + 2.0 * p.y
            })
            .collect();
        Solution::new(mesh, vec![(elem_id, shape, coefficients)], Vec::new(), Vec::new())
    }

    #[test]
    fn local_evaluation() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        let solution = linear_solution(mesh, 3);

        // elem 3 covers [0.5, 1]^2
        let value = solution.eval_local(3, V2D::from([0.0, 0.0])).unwrap();
        assert!((value.value - 0.75 * 3.0).abs() < 1e-14);
        assert!((value.grad[0] - 1.0).abs() < 1e-13);
        assert!((value.grad[1] - 2.0).abs() < 1e-13);

        assert!(solution.eval_local(0, V2D::zero()).is_none());
    }

    #[test]
    fn root_evaluation_descends_tree() {
        let mut mesh = Mesh::from_file("./test_input/square_tri.json").unwrap();
        mesh.refine_element(1, HRef::T).unwrap();
        let root = V2D::from([-0.6, -0.2]);
        let (leaf, xi_leaf) = mesh.locate(1, root);
        assert_eq!(mesh.elems[leaf].parent_id(), Some(1));

        let solution = linear_solution(mesh, leaf);
        let (x, _) = solution.mesh().geometry(leaf, xi_leaf);
        let value = solution.eval_root(1, root).unwrap();
        assert!((value.value - (x.x + 2.0 * x.y)).abs() < 1e-12);
        assert!(solution.eval_root(7, V2D::zero()).is_none());
    }

    #[test]
    fn exact_solution_difference() {
        let exact = ExactSolution::new(|p: Point| FnValue::new(p.x * p.y, [p.y, p.x]));
        let a = exact.eval(0, V2D::zero(), Point::new(2.0, 3.0));
        let b = FnValue::new(1.0, [1.0, 1.0]);
        let diff = a - b;
        assert_eq!(diff.value, 5.0);
        assert_eq!(diff.grad, V2D::from([2.0, 1.0]));
    }

    #[test]
    fn solution_to_vtk() {
        let mesh = Mesh::from_file("./test_input/mixed.json").unwrap();
        let solution = linear_solution(mesh, 1);
        std::fs::create_dir_all("./test_output").unwrap();
        solution.export_to_vtk("./test_output/linear_solution.vtk", 5).unwrap();
    }
}
