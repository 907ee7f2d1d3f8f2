use nalgebra::DMatrix;
use std::collections::BTreeMap;

/// Wrapper around a BTreeMap to store square-symmetric matrices in a sparse data structure
///
/// Only the upper triangle is stored.
#[derive(Clone, Debug)]
pub struct SparseMatrix {
    /// Size of the square matrix
    pub dimension: usize,
    /// Matrix Entries
    entries: BTreeMap<[u32; 2], f64>,
}

impl SparseMatrix {
    pub fn new(dimension: usize) -> Self {
        assert!(
            dimension <= (std::u32::MAX as usize),
            "Matrix Dimension cannot exceed the size of a u32!"
        );

        Self {
            dimension,
            entries: BTreeMap::new(),
        }
    }

    /// Number of non-zero entries in the full (symmetric) matrix
    pub fn num_entries(&self) -> usize {
        let num_diag = self.entries.keys().filter(|[i, j]| i == j).count();
        2 * self.entries.len() - num_diag
    }

    fn coordinates(&self, [row_idx, col_idx]: [usize; 2]) -> [u32; 2] {
        assert!(
            row_idx < self.dimension,
            "row_idx exceeded matrix dimension; cannot insert value!"
        );
        assert!(
            col_idx < self.dimension,
            "col_idx exceeded matrix dimension; cannot insert value!"
        );

        // dimension is bounded by u32::MAX
        if row_idx <= col_idx {
            [row_idx as u32, col_idx as u32]
        } else {
            [col_idx as u32, row_idx as u32]
        }
    }

    /// Insert a value into the matrix. Assumes symmetry: row/col order does not matter.
    pub fn insert(&mut self, rc: [usize; 2], value: f64) {
        let coordinates = self.coordinates(rc);
        self.entries
            .entry(coordinates)
            .and_modify(|current_value| *current_value += value)
            .or_insert(value);
    }

    /// Insert a group of entries
    pub fn insert_group(&mut self, entry_group: Vec<([usize; 2], f64)>) {
        for (rc, value) in entry_group {
            self.insert(rc, value);
        }
    }

    /// Get an entry (zero if it has never been inserted)
    pub fn get(&self, rc: [usize; 2]) -> f64 {
        self.entries
            .get(&self.coordinates(rc))
            .copied()
            .unwrap_or(0.0)
    }

    // Remove the entries from the matrix, replacing them with an empty BTreeMap.
    fn take_entries(&mut self) -> BTreeMap<[u32; 2], f64> {
        std::mem::take(&mut self.entries)
    }

    /// Consume the entries from another sparse matrix leaving it empty.
    pub fn consume_matrix(&mut self, other: &mut Self) {
        assert!(
            self.dimension == other.dimension,
            "Sparse Matrices have different dimensions; cannot consume matrix!"
        );

        for (coordinates, value) in other.take_entries() {
            self.entries
                .entry(coordinates)
                .and_modify(|current_value| *current_value += value)
                .or_insert(value);
        }
    }

    /// Iterate over the upper triangle of the matrix.
    pub fn iter_upper_tri(&self) -> impl Iterator<Item = ([usize; 2], f64)> + '_ {
        self.entries
            .iter()
            .map(|(coords, value)| ([coords[0] as usize, coords[1] as usize], *value))
    }
}

impl From<SparseMatrix> for DMatrix<f64> {
    fn from(sm: SparseMatrix) -> Self {
        let mut dense = DMatrix::zeros(sm.dimension, sm.dimension);

        for ([r, c], v) in sm.iter_upper_tri() {
            dense[(r, c)] = v;
            dense[(c, r)] = v;
        }

        dense
    }
}
