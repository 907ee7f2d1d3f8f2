use super::AdaptError;
use crate::domain::space::Space;

use log::debug;

/// Builds the reference Space of an adaptivity step from the coarse Space
#[derive(Clone, Copy, Debug)]
pub struct ReferenceBuilder {
    /// order increase over the coarse ancestor (capped at the maximum order)
    pub order_increase: u8,
    /// apply one level of isotropic h-refinement to every active Elem
    pub h_refine: bool,
}

impl Default for ReferenceBuilder {
    fn default() -> Self {
        Self {
            order_increase: 1,
            h_refine: true,
        }
    }
}

impl ReferenceBuilder {
    pub fn new(order_increase: u8) -> Self {
        Self {
            order_increase,
            ..Default::default()
        }
    }

    /// Deep-copy the coarse Mesh, refine it and assign DoFs to the resulting Space
    ///
    /// Elems keep their ids in the copy, so each coarse Elem is an ancestor (or itself a leaf) of the reference Mesh.
    pub fn build(&self, coarse: &Space) -> Result<Space, AdaptError> {
        let mut mesh = coarse.mesh().copy();
        if self.h_refine {
            mesh.refine_all_elements()?;
        }

        let mut reference = coarse.dup(mesh);
        for elem_id in reference.mesh().active_elem_ids() {
            let coarse_id = coarse_ancestor(&reference, coarse, elem_id);
            let orders = coarse.element_order(coarse_id).saturating_increase(self.order_increase);
            reference.set_element_order(elem_id, orders)?;
        }
        let ndof = reference.assign_dofs()?;

        debug!(
            "built reference Space with {} active Elems and {} DoFs",
            reference.mesh().num_active_elements(),
            ndof
        );
        Ok(reference)
    }
}

// the Elem itself if the coarse Mesh knows it, otherwise its nearest ancestor that does
fn coarse_ancestor(reference: &Space, coarse: &Space, elem_id: usize) -> usize {
    let num_coarse = coarse.mesh().elems.len();
    let mut current = elem_id;
    while current >= num_coarse {
        match reference.mesh().elems[current].parent_id() {
            Some(parent_id) => current = parent_id,
            None => break,
        }
    }
    current
}
