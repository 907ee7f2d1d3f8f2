use super::dof::{
    asm_list::{ConstraintResolver, ElemAssembly},
    DofEnumerator, DofTable,
};
use super::mesh::{
    elem::ElemShape,
    h_refinement::{HRef, HRefError, Regularity},
    p_refinement::{PRefError, PolyOrders},
    Mesh, MAX_POLYNOMIAL_ORDER,
};

use log::debug;
use std::sync::Arc;
use thiserror::Error;

/// Function space family, which decides how many functions live on vertices, edges and interiors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    H1,
    HCurl,
    L2,
}

impl SpaceKind {
    pub fn min_order(&self) -> u8 {
        match self {
            Self::H1 => 1,
            Self::HCurl | Self::L2 => 0,
        }
    }

    pub fn has_vertex_dofs(&self) -> bool {
        matches!(self, Self::H1)
    }

    /// Number of DoFs on an unconstrained Edge of order `q`
    pub fn edge_dof_count(&self, q: u8) -> usize {
        match self {
            Self::H1 => q.saturating_sub(1) as usize,
            Self::HCurl => q as usize + 1,
            Self::L2 => 0,
        }
    }

    /// Number of interior DoFs of an Elem
    pub fn bubble_dof_count(&self, shape: ElemShape, orders: PolyOrders) -> usize {
        let (px, py) = (orders.ni as usize, orders.nj as usize);
        match (self, shape) {
            (Self::H1, ElemShape::Quad) => px.saturating_sub(1) * py.saturating_sub(1),
            (Self::H1, ElemShape::Tri) => px.saturating_sub(1) * px.saturating_sub(2) / 2,
            (Self::HCurl, ElemShape::Quad) => (px + 1) * py + px * (py + 1),
            (Self::HCurl, ElemShape::Tri) => px * (px + 1),
            (Self::L2, ElemShape::Quad) => (px + 1) * (py + 1),
            (Self::L2, ElemShape::Tri) => (px + 1) * (px + 2) / 2,
        }
    }
}

/// Boundary condition type attached to a boundary marker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BcType {
    /// Dirichlet: DoFs on the boundary are fixed
    Essential,
    /// Neumann / natural
    Natural,
    None,
}

/// Map from boundary markers to their [BcType]
pub type BcTypes = Arc<dyn Fn(u32) -> BcType + Send + Sync>;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("DoFs have not been assigned since the last Mesh or order change; Cannot use the Space!")]
    DofsNotAssigned,
    #[error("Elem {0} does not exist!")]
    ElemDoesntExist(usize),
    #[error("Elem {0} is not active; Cannot build its assembly list!")]
    ElemNotActive(usize),
    #[error("Shape functions are only provided for H1 spaces ({0:?} given); Cannot build assembly lists!")]
    UnsupportedKind(SpaceKind),
    #[error("Constraints on Node/Edge {0} are nested too deeply; Cannot build assembly list!")]
    ConstraintDepth(usize),
    #[error("Node {0} has no DoF and no constraint; Cannot build assembly list!")]
    UnresolvedNode(usize),
    #[error("Edge {0} has no DoFs and no constraining Edge; Cannot build assembly list!")]
    UnresolvedEdge(usize),
    #[error("Missing DoF on Edge/Elem {0}; Cannot build assembly list!")]
    MissingDof(usize),
    #[error(transparent)]
    PRef(#[from] PRefError),
    #[error(transparent)]
    HRef(#[from] HRefError),
}

/// A discrete function space: a Mesh, a polynomial order per Elem and a DoF table
///
/// Any change to the Mesh or to the orders drops the DoF table; [Space::assign_dofs] must be called again
/// before the Space can be used for assembly.
#[derive(Clone)]
pub struct Space {
    mesh: Mesh,
    kind: SpaceKind,
    orders: Vec<PolyOrders>,
    bc_types: BcTypes,
    dofs: Option<DofTable>,
}

impl Space {
    /// Build a Space with a uniform order `p` over every Elem (DoFs are not assigned yet)
    pub fn new(
        mesh: Mesh,
        kind: SpaceKind,
        p: u8,
        bc_types: impl Fn(u32) -> BcType + Send + Sync + 'static,
    ) -> Result<Self, SpaceError> {
        Self::with_bc_types(mesh, kind, p, Arc::new(bc_types))
    }

    /// Build a Space using an existing boundary condition map
    pub fn with_bc_types(mesh: Mesh, kind: SpaceKind, p: u8, bc_types: BcTypes) -> Result<Self, SpaceError> {
        check_order(kind, p)?;
        let orders = vec![PolyOrders::iso(p); mesh.elems.len()];
        Ok(Self {
            mesh,
            kind,
            orders,
            bc_types,
            dofs: None,
        })
    }

    /// A Space of the same kind and boundary conditions over another Mesh.
    ///
    /// Elem orders are carried over by id; Elems unknown to this Space inherit from their parent.
    pub fn dup(&self, mesh: Mesh) -> Self {
        let orders = self.orders.iter().copied().take(mesh.elems.len()).collect();
        let mut dup = Self {
            mesh,
            kind: self.kind,
            orders,
            bc_types: self.bc_types.clone(),
            dofs: None,
        };
        dup.sync_orders();
        dup
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Mutable access to the Mesh. Drops the DoF table.
    pub fn mesh_mut(&mut self) -> &mut Mesh {
        self.dofs = None;
        &mut self.mesh
    }

    pub fn bc_type(&self, marker: u32) -> BcType {
        (self.bc_types)(marker)
    }

    pub fn bc_types(&self) -> BcTypes {
        self.bc_types.clone()
    }

    /// Orders of an Elem (Elems created after the last order change inherit their parent's orders)
    pub fn element_order(&self, elem_id: usize) -> PolyOrders {
        match self.orders.get(elem_id) {
            Some(orders) => *orders,
            None => match self.mesh.elems[elem_id].parent_id() {
                Some(parent_id) => self.element_order(parent_id),
                None => PolyOrders::iso(self.kind.min_order()),
            },
        }
    }

    // extend the order table over Elems created since the last update
    fn sync_orders(&mut self) {
        for elem_id in self.orders.len()..self.mesh.elems.len() {
            let inherited = self.element_order(elem_id);
            self.orders.push(inherited);
        }
    }

    /// Set the order of every Elem to `p`
    pub fn set_uniform_order(&mut self, p: u8) -> Result<(), SpaceError> {
        check_order(self.kind, p)?;
        self.orders = vec![PolyOrders::iso(p); self.mesh.elems.len()];
        self.dofs = None;
        Ok(())
    }

    /// Set the orders of one active Elem
    pub fn set_element_order(&mut self, elem_id: usize, orders: PolyOrders) -> Result<(), SpaceError> {
        if elem_id >= self.mesh.elems.len() {
            return Err(PRefError::ElemDoesntExist(elem_id).into());
        }
        if !self.mesh.is_active(elem_id) {
            return Err(PRefError::ElemNotActive(elem_id).into());
        }
        if self.mesh.elems[elem_id].shape == ElemShape::Tri && !orders.is_isotropic() {
            return Err(PRefError::AnisoOnTriangle(elem_id).into());
        }
        check_order(self.kind, orders.ni)?;
        check_order(self.kind, orders.nj)?;

        self.sync_orders();
        self.orders[elem_id] = orders;
        self.dofs = None;
        Ok(())
    }

    /// h-Refine an Elem of the Space's Mesh; its children inherit its orders
    pub fn refine_element(&mut self, elem_id: usize, refinement: HRef) -> Result<(), SpaceError> {
        self.refine_elements(vec![(elem_id, refinement)])
    }

    /// Apply a group of h-refinements at once
    pub fn refine_elements(&mut self, refinements: Vec<(usize, HRef)>) -> Result<(), SpaceError> {
        self.sync_orders();
        self.mesh.refine_elements(refinements)?;
        self.sync_orders();
        self.dofs = None;
        Ok(())
    }

    /// Enforce a Mesh regularity, returning the ids of the Elems which had to be split
    pub fn regularize(&mut self, regularity: Regularity) -> Result<Vec<usize>, SpaceError> {
        self.sync_orders();
        let refined = self.mesh.regularize(regularity)?;
        self.sync_orders();
        if !refined.is_empty() {
            self.dofs = None;
        }
        Ok(refined)
    }

    /// Enumerate the DoFs from scratch, returning the number of free DoFs
    pub fn assign_dofs(&mut self) -> Result<usize, SpaceError> {
        self.sync_orders();
        let table = DofEnumerator::new().enumerate(&self.mesh, &self.orders, self.kind, &*self.bc_types);
        let num_free = table.num_free();

        debug!(
            "assigned {} free and {} essential DoFs over {} active Elems",
            num_free,
            table.num_essential(),
            self.mesh.num_active_elements()
        );

        self.dofs = Some(table);
        Ok(num_free)
    }

    /// Number of free DoFs
    pub fn num_dofs(&self) -> Result<usize, SpaceError> {
        Ok(self.dof_table()?.num_free())
    }

    pub fn dof_table(&self) -> Result<&DofTable, SpaceError> {
        self.dofs.as_ref().ok_or(SpaceError::DofsNotAssigned)
    }

    /// Local basis and global DoF expansion of one active Elem
    pub fn assembly_list(&self, elem_id: usize) -> Result<ElemAssembly, SpaceError> {
        let table = self.check_assembly()?;
        if elem_id >= self.mesh.elems.len() {
            return Err(SpaceError::ElemDoesntExist(elem_id));
        }
        if !self.mesh.is_active(elem_id) {
            return Err(SpaceError::ElemNotActive(elem_id));
        }

        ConstraintResolver::new(&self.mesh, table).elem_assembly(elem_id)
    }

    /// Assembly lists of every active Elem, in increasing id order
    pub fn assembly_lists(&self) -> Result<Vec<ElemAssembly>, SpaceError> {
        let table = self.check_assembly()?;
        let mut resolver = ConstraintResolver::new(&self.mesh, table);

        self.mesh
            .active_elem_ids()
            .into_iter()
            .map(|elem_id| resolver.elem_assembly(elem_id))
            .collect()
    }

    fn check_assembly(&self) -> Result<&DofTable, SpaceError> {
        if self.kind != SpaceKind::H1 {
            return Err(SpaceError::UnsupportedKind(self.kind));
        }
        self.dof_table()
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("kind", &self.kind)
            .field("num_elems", &self.mesh.elems.len())
            .field("num_dofs", &self.dofs.as_ref().map(|table| table.num_free()))
            .finish()
    }
}

fn check_order(kind: SpaceKind, p: u8) -> Result<(), PRefError> {
    if p < kind.min_order() {
        Err(PRefError::BelowMinimum(p))
    } else if p > MAX_POLYNOMIAL_ORDER {
        Err(PRefError::ExceededMaxExpansion)
    } else {
        Ok(())
    }
}
