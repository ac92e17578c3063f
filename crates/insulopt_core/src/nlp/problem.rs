use crate::error::EvalError;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::convert::serial::convert_coo_dense;
use nalgebra_sparse::CooMatrix;

/// Lower/upper bounds; infinite entries mean "unbounded on that side".
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    pub fn unbounded(len: usize) -> Self {
        Self {
            lower: vec![f64::NEG_INFINITY; len],
            upper: vec![f64::INFINITY; len],
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn set(&mut self, index: usize, lower: Option<f64>, upper: Option<f64>) {
        self.lower[index] = lower.unwrap_or(f64::NEG_INFINITY);
        self.upper[index] = upper.unwrap_or(f64::INFINITY);
    }

    pub fn set_equal(&mut self, index: usize, value: f64) {
        self.lower[index] = value;
        self.upper[index] = value;
    }

    /// Total amount by which `values` leave the box.
    pub fn violation(&self, values: &[f64]) -> f64 {
        values
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .map(|(v, (lo, hi))| (lo - v).max(0.0) + (v - hi).max(0.0))
            .sum()
    }
}

/// Row/column pattern of the constraint Jacobian. Fixed for the lifetime of a
/// problem; only the values change between evaluations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JacobianStructure {
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl JacobianStructure {
    pub fn new(nrows: usize, ncols: usize, rows: Vec<usize>, cols: Vec<usize>) -> Self {
        assert_eq!(rows.len(), cols.len(), "row/column index lists differ in length");
        assert!(
            rows.iter().all(|&r| r < nrows) && cols.iter().all(|&c| c < ncols),
            "Jacobian index outside {nrows}x{ncols}"
        );
        Self {
            nrows,
            ncols,
            rows,
            cols,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Triplet form of `values` (duplicates are summed by consumers).
    pub fn to_coo(&self, values: &[f64]) -> CooMatrix<f64> {
        assert_eq!(values.len(), self.nnz(), "Jacobian value count mismatch");
        let mut coo = CooMatrix::new(self.nrows, self.ncols);
        for ((&r, &c), &v) in self.rows.iter().zip(&self.cols).zip(values) {
            coo.push(r, c, v);
        }
        coo
    }

    pub fn to_dense(&self, values: &[f64]) -> DMatrix<f64> {
        convert_coo_dense(&self.to_coo(values))
    }

    /// True when `(row, col)` is a declared entry.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.rows.iter().zip(&self.cols).any(|(&r, &c)| r == row && c == col)
    }
}

/// A smooth nonlinear program
///
/// ```text
/// min f(x)  s.t.  cl <= c(x) <= cu,  xl <= x <= xu
/// ```
///
/// Evaluation methods take `&mut self` so implementations can reuse work
/// buffers; they return [`EvalError`] when `x` lies outside the model's domain.
pub trait NlpProblem {
    fn num_variables(&self) -> usize;

    fn num_constraints(&self) -> usize;

    fn variable_bounds(&self) -> Bounds;

    fn constraint_bounds(&self) -> Bounds;

    /// Characteristic magnitude of every variable; the solver iterates on
    /// `x / scale`.
    fn variable_scales(&self) -> Vec<f64> {
        vec![1.0; self.num_variables()]
    }

    /// Characteristic magnitude of every constraint row.
    fn constraint_scales(&self) -> Vec<f64> {
        vec![1.0; self.num_constraints()]
    }

    fn objective_scale(&self) -> f64 {
        1.0
    }

    fn initial_guess(&self) -> DVector<f64>;

    fn objective(&mut self, x: &DVector<f64>) -> Result<f64, EvalError>;

    fn objective_gradient(
        &mut self,
        x: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), EvalError>;

    fn constraints(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), EvalError>;

    fn jacobian_structure(&self) -> &JacobianStructure;

    /// Values in the order of [`NlpProblem::jacobian_structure`].
    fn jacobian_values(&mut self, x: &DVector<f64>, values: &mut [f64]) -> Result<(), EvalError>;

    fn jacobian(&mut self, x: &DVector<f64>) -> Result<CooMatrix<f64>, EvalError> {
        let mut values = vec![0.0; self.jacobian_structure().nnz()];
        self.jacobian_values(x, &mut values)?;
        Ok(self.jacobian_structure().to_coo(&values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_round_trips_to_dense() {
        let structure = JacobianStructure::new(2, 3, vec![0, 0, 1, 1], vec![0, 2, 1, 1]);
        let dense = structure.to_dense(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dense, DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, 7.0, 0.0]));
        assert_eq!(structure.nnz(), 4);
        assert!(structure.contains(0, 2));
        assert!(!structure.contains(1, 2));
    }

    #[test]
    #[should_panic(expected = "Jacobian index outside")]
    fn structure_rejects_out_of_range_indices() {
        JacobianStructure::new(2, 2, vec![0, 2], vec![0, 1]);
    }

    #[test]
    fn bounds_measure_violation() {
        let mut bounds = Bounds::unbounded(3);
        bounds.set(0, Some(1.0), Some(2.0));
        bounds.set_equal(1, 5.0);
        bounds.set(2, None, Some(0.0));
        assert_eq!(bounds.violation(&[0.5, 5.0, 3.0]), 3.5);
        assert_eq!(bounds.violation(&[1.5, 5.0, -10.0]), 0.0);
    }
}
