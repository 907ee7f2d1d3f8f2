use crate::basis::{lobatto::LobattoTable, ShapeValue};
use crate::domain::{
    dof::{asm_list::ElemAssembly, DofRef, EssentialDof},
    fields::{FnValue, Solution},
    mesh::{
        geometry::{M2D, Point, V2D},
        Mesh,
    },
    space::Space,
};
use crate::integration::{glq::gauss_quadrature_points, num_glq_points, QuadRule};
use crate::linalg::{nalgebra_solve::nalgebra_solve_dense, ElemContribution, LinearSystem, SolveError};

use log::debug;
use rayon::prelude::*;

/// Everything a weak form may depend on at a quadrature point
#[derive(Clone, Copy, Debug)]
pub struct QuadPoint {
    /// material marker of the Elem
    pub marker: u32,
    pub base_id: usize,
    /// reference coordinates on the base Elem
    pub root: V2D,
    /// physical location
    pub x: Point,
}

impl QuadPoint {
    pub fn new(mesh: &Mesh, elem_id: usize, xi: V2D) -> (Self, M2D) {
        let elem = &mesh.elems[elem_id];
        let (x, jacobian) = mesh.geometry(elem_id, xi);
        (
            Self {
                marker: elem.marker,
                base_id: elem.base_id,
                root: elem.map.apply(xi),
                x,
            },
            jacobian,
        )
    }
}

/// A symmetric bilinear form and a linear form, evaluated pointwise
pub trait WeakForm: Sync {
    fn bilinear(&self, qp: &QuadPoint, u: &FnValue, v: &FnValue) -> f64;
    fn linear(&self, qp: &QuadPoint, v: &FnValue) -> f64;
}

/// Shape function values with physical gradients
pub(crate) fn physical_values(values: Vec<ShapeValue>, jacobian: &M2D) -> Vec<FnValue> {
    let inv_t = jacobian.inverse().transpose();
    values
        .into_iter()
        .map(|sv| FnValue {
            value: sv.value,
            grad: inv_t * sv.grad,
        })
        .collect()
}

/// Integrate a [WeakForm] over every active Elem of a [Space] and assemble the free-DoF system
///
/// Essential DoFs take the values in `essential_values` and are moved to the right-hand side.
///
/// Computations are parallelized over the Rayon Global Threadpool
pub fn assemble(
    space: &Space,
    form: &dyn WeakForm,
    essential_values: &[f64],
) -> Result<(LinearSystem, Vec<ElemAssembly>), SolveError> {
    let assemblies = space.assembly_lists()?;
    let mesh = space.mesh();
    let mut system = LinearSystem::new(space.num_dofs()?);

    system.par_extend(assemblies.par_iter().map(|assembly| {
        let num_local = assembly.shape.len();
        let rule = QuadRule::for_shape(assembly.shape.shape, num_glq_points(assembly.shape.max_order()));

        let mut local_matrix = vec![vec![0.0; num_local]; num_local];
        let mut local_rhs = vec![0.0; num_local];

        for (xi, w) in rule.iter() {
            let (qp, jacobian) = QuadPoint::new(mesh, assembly.elem_id, xi);
            let dx = w * jacobian.det().abs();
            let values = physical_values(assembly.shape.eval(xi), &jacobian);

            for (i, v) in values.iter().enumerate() {
                local_rhs[i] += form.linear(&qp, v) * dx;
                for (j, u) in values.iter().enumerate().skip(i) {
                    local_matrix[i][j] += form.bilinear(&qp, u, v) * dx;
                }
            }
        }
        for i in 0..num_local {
            for j in 0..i {
                local_matrix[i][j] = local_matrix[j][i];
            }
        }

        scatter(assembly, &local_matrix, &local_rhs, essential_values)
    }));

    debug!(
        "assembled {} x {} system with {} non-zeros",
        system.dimension(),
        system.dimension(),
        system.matrix.num_entries()
    );

    Ok((system, assemblies))
}

// map local contributions onto the global DoFs
fn scatter(
    assembly: &ElemAssembly,
    local_matrix: &[Vec<f64>],
    local_rhs: &[f64],
    essential_values: &[f64],
) -> ElemContribution {
    let mut contribution = ElemContribution::default();

    for (i, dof_i, c_i) in assembly.list.iter() {
        let row = match dof_i {
            DofRef::Free(row) => row,
            DofRef::Essential(_) => continue,
        };
        contribution.rhs.push((row, c_i * local_rhs[i]));

        for (j, dof_j, c_j) in assembly.list.iter() {
            let value = c_i * c_j * local_matrix[i][j];
            match dof_j {
                DofRef::Free(col) if row <= col => contribution.entries.push(([row, col], value)),
                DofRef::Free(_) => (),
                DofRef::Essential(e) => contribution.rhs.push((row, -value * essential_values[e])),
            }
        }
    }

    contribution
}

/// Compute the values of the essential DoFs of a Space from Dirichlet data `g`
///
/// Vertex DoFs interpolate `g`. Edge DoFs come from the projection of `g` minus its linear interpolant onto the
/// Edge's Lobatto functions.
pub fn essential_values(space: &Space, g: &dyn Fn(&QuadPoint) -> f64) -> Result<Vec<f64>, SolveError> {
    let table = space.dof_table()?;
    let mesh = space.mesh();

    let mut values = vec![0.0; table.num_essential()];
    let mut vertex_values = vec![None; mesh.nodes.len()];
    for (idx, dof) in table.essential_dofs().iter().enumerate() {
        if let EssentialDof::Vertex { node, elem, vertex, .. } = dof {
            let xi = mesh.elems[*elem].shape.vertices()[*vertex];
            let (qp, _) = QuadPoint::new(mesh, *elem, xi);
            let value = g(&qp);
            values[idx] = value;
            vertex_values[*node] = Some(value);
        }
    }

    for (idx, dof) in table.essential_dofs().iter().enumerate() {
        if let EssentialDof::Edge {
            edge,
            elem,
            side,
            offset,
            ..
        } = dof
        {
            let k = offset + 2;
            let order = table.edge_order(*edge) as usize;
            let flipped = mesh.side_is_flipped(*elem, *side);
            let [n0, n1] = mesh.edges[*edge].nodes;
            let (g0, g1) = (
                vertex_values[n0].unwrap_or_default(),
                vertex_values[n1].unwrap_or_default(),
            );

            let (points, weights) = gauss_quadrature_points(num_glq_points(order as u8) + 1);
            values[idx] = points
                .iter()
                .zip(weights.iter())
                .map(|(s, w)| {
                    let local_s = if flipped { -s } else { *s };
                    let xi = mesh.elems[*elem].shape.side_point(*side, local_s);
                    let (qp, _) = QuadPoint::new(mesh, *elem, xi);
                    let lobatto = LobattoTable::new(order.max(k), *s);
                    let linear = g0 * lobatto.values[0] + g1 * lobatto.values[1];
                    -w * (g(&qp) - linear) * lobatto.second_derivs[k]
                })
                .sum();
        }
    }

    Ok(values)
}

/// Assemble and solve a [WeakForm] over a [Space] with dense direct solvers
pub fn solve_form(
    space: &Space,
    form: &dyn WeakForm,
    dirichlet: &dyn Fn(&QuadPoint) -> f64,
) -> Result<Solution, SolveError> {
    let essential = essential_values(space, dirichlet)?;
    let (system, assemblies) = assemble(space, form, &essential)?;
    let coefficients = nalgebra_solve_dense(system)?;

    let local = assemblies
        .into_iter()
        .map(|assembly| {
            let mut local_coefficients = vec![0.0; assembly.shape.len()];
            for (i, dof, c) in assembly.list.iter() {
                local_coefficients[i] += c * match dof {
                    DofRef::Free(idx) => coefficients[idx],
                    DofRef::Essential(idx) => essential[idx],
                };
            }
            (assembly.elem_id, assembly.shape, local_coefficients)
        })
        .collect();

    Ok(Solution::new(space.mesh().clone(), local, coefficients, essential))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{mesh::h_refinement::HRef, space::{BcType, SpaceKind}};

    struct Mass;

    impl WeakForm for Mass {
        fn bilinear(&self, _: &QuadPoint, u: &FnValue, v: &FnValue) -> f64 {
            u.value * v.value
        }

        fn linear(&self, _: &QuadPoint, v: &FnValue) -> f64 {
            v.value
        }
    }

    #[test]
    fn mass_matrix_sums_to_area() {
        let mesh = Mesh::from_file("./test_input/l_shape.json").unwrap();
        let mut space = Space::new(mesh, SpaceKind::H1, 1, |_| BcType::Natural).unwrap();
        let n = space.assign_dofs().unwrap();

        let (system, _) = assemble(&space, &Mass, &[]).unwrap();
        let total: f64 = (0..n)
            .flat_map(|i| (0..n).map(move |j| [i, j]))
            .map(|rc| system.matrix.get(rc))
            .sum();
        let rhs_total: f64 = system.rhs.iter().sum();

        // the p = 1 vertex functions form a partition of unity
        assert!((total - 3.0).abs() < 1e-12);
        assert!((rhs_total - 3.0).abs() < 1e-12);
    }

    #[test]
    fn constrained_mass_matrix_sums_to_area() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        let mut space = Space::new(mesh, SpaceKind::H1, 2, |_| BcType::Natural).unwrap();
        space.refine_element(0, HRef::T).unwrap();
        space.refine_element(4, HRef::U).unwrap();
        space.assign_dofs().unwrap();

        // the constant 1 is the sum of the regular vertex functions once hanging vertices are expanded
        let table = space.dof_table().unwrap();
        let vertex_dofs: Vec<usize> = (0..space.mesh().nodes.len())
            .filter_map(|node_id| match table.vertex_dof(node_id) {
                Some(DofRef::Free(idx)) => Some(idx),
                _ => None,
            })
            .collect();

        let (system, _) = assemble(&space, &Mass, &[]).unwrap();
        let total: f64 = vertex_dofs
            .iter()
            .flat_map(|i| vertex_dofs.iter().map(move |j| [*i, *j]))
            .map(|rc| system.matrix.get(rc))
            .sum();
        let rhs_total: f64 = vertex_dofs.iter().map(|i| system.rhs[*i]).sum();

        assert!((total - 1.0).abs() < 1e-12);
        assert!((rhs_total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn essential_edge_values_reproduce_quadratics() {
        let mesh = Mesh::from_file("./test_input/square_quad.json").unwrap();
        let mut space = Space::new(mesh, SpaceKind::H1, 2, |_| BcType::Essential).unwrap();
        space.assign_dofs().unwrap();

        // g = x^2 along every boundary edge: the p = 2 edge functions capture it exactly
        let values = essential_values(&space, &|qp: &QuadPoint| qp.x.x * qp.x.x).unwrap();
        let table = space.dof_table().unwrap();
        for (dof, value) in table.essential_dofs().iter().zip(values.iter()) {
            if let EssentialDof::Edge { edge, .. } = dof {
                let [p0, p1] = space.mesh().edge_points(*edge);
                let dx = p1.x - p0.x;
                // x(s) = mid + s dx / 2; x^2 - linear = (dx^2 / 4)(s^2 - 1) = c l_2(s), l_2 = sqrt(3/8)(s^2 - 1)
                let expected = (dx * dx / 4.0) / (3.0_f64 / 8.0).sqrt();
                assert!((value - expected).abs() < 1e-12);
            }
        }
    }
}
