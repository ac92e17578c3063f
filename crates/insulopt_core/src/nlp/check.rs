use super::problem::NlpProblem;
use crate::error::EvalError;
use nalgebra::DVector;
use serde::Serialize;

/// Comparison of the analytic constraint Jacobian with central differences.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JacobianCheck {
    pub max_abs_error: f64,
    /// Error relative to `max(1, |analytic|)`.
    pub max_rel_error: f64,
    /// `(row, col)` of the largest relative error.
    pub worst_entry: (usize, usize),
    /// Largest finite-difference magnitude outside the declared pattern.
    pub max_undeclared: f64,
}

/// Differentiates the constraints column by column with steps of
/// `rel_step * max(|x_j|, scale_j)`.
pub fn check_jacobian<P: NlpProblem + ?Sized>(
    problem: &mut P,
    x: &DVector<f64>,
    rel_step: f64,
) -> Result<JacobianCheck, EvalError> {
    let n = problem.num_variables();
    let m = problem.num_constraints();
    let scales = problem.variable_scales();

    let mut values = vec![0.0; problem.jacobian_structure().nnz()];
    problem.jacobian_values(x, &mut values)?;
    let analytic = problem.jacobian_structure().to_dense(&values);

    let mut plus = DVector::zeros(m);
    let mut minus = DVector::zeros(m);
    let mut report = JacobianCheck {
        max_abs_error: 0.0,
        max_rel_error: 0.0,
        worst_entry: (0, 0),
        max_undeclared: 0.0,
    };

    for col in 0..n {
        let step = rel_step * x[col].abs().max(scales[col]);
        let mut xp = x.clone();
        xp[col] += step;
        problem.constraints(&xp, &mut plus)?;
        let mut xm = x.clone();
        xm[col] -= step;
        problem.constraints(&xm, &mut minus)?;

        for row in 0..m {
            let fd = (plus[row] - minus[row]) / (2.0 * step);
            if !problem.jacobian_structure().contains(row, col) {
                report.max_undeclared = report.max_undeclared.max(fd.abs());
                continue;
            }
            let exact = analytic[(row, col)];
            let abs = (fd - exact).abs();
            let rel = abs / exact.abs().max(1.0);
            report.max_abs_error = report.max_abs_error.max(abs);
            if rel > report.max_rel_error {
                report.max_rel_error = rel;
                report.worst_entry = (row, col);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlp::problem::{Bounds, JacobianStructure};

    /// c = [x0 * x1, sin(x1)] with a deliberately wrong entry when `wrong` is set.
    struct Toy {
        structure: JacobianStructure,
        wrong: bool,
    }

    impl Toy {
        fn new(wrong: bool) -> Self {
            Self {
                structure: JacobianStructure::new(2, 2, vec![0, 0, 1], vec![0, 1, 1]),
                wrong,
            }
        }
    }

    impl NlpProblem for Toy {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            2
        }
        fn variable_bounds(&self) -> Bounds {
            Bounds::unbounded(2)
        }
        fn constraint_bounds(&self) -> Bounds {
            Bounds::unbounded(2)
        }
        fn initial_guess(&self) -> DVector<f64> {
            DVector::from_vec(vec![1.0, 0.5])
        }
        fn objective(&mut self, _x: &DVector<f64>) -> Result<f64, EvalError> {
            Ok(0.0)
        }
        fn objective_gradient(
            &mut self,
            _x: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> Result<(), EvalError> {
            out.fill(0.0);
            Ok(())
        }
        fn constraints(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), EvalError> {
            out[0] = x[0] * x[1];
            out[1] = x[1].sin() + if self.wrong { x[0] } else { 0.0 };
            Ok(())
        }
        fn jacobian_structure(&self) -> &JacobianStructure {
            &self.structure
        }
        fn jacobian_values(&mut self, x: &DVector<f64>, values: &mut [f64]) -> Result<(), EvalError> {
            values[0] = x[1];
            values[1] = x[0];
            values[2] = x[1].cos();
            Ok(())
        }
    }

    #[test]
    fn correct_jacobian_passes() {
        let mut toy = Toy::new(false);
        let x = toy.initial_guess();
        let check = check_jacobian(&mut toy, &x, 1e-6).expect("evaluates");
        assert!(check.max_rel_error < 1e-8, "{check:?}");
        assert_eq!(check.max_undeclared, 0.0);
    }

    #[test]
    fn missing_entry_is_reported_as_undeclared() {
        let mut toy = Toy::new(true);
        let x = toy.initial_guess();
        let check = check_jacobian(&mut toy, &x, 1e-6).expect("evaluates");
        assert!((check.max_undeclared - 1.0).abs() < 1e-8, "{check:?}");
    }
}
