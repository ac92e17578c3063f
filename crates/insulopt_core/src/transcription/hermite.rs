use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};

/// Hermite interpolation of a segment from its state-discretization nodes to
/// its collocation nodes, on the normalized segment interval [0, 1].
///
/// With `h` the segment duration, `x_d`/`f_d` the values and rates at the
/// discretization nodes:
///
/// ```text
/// x_c    = Ai · x_d + h · Bi · f_d
/// xdot_c = Ad · x_d / h + Bd · f_d
/// ```
///
/// Each matrix is `num_collocation × num_discretization`.
#[derive(Debug, Clone, PartialEq)]
pub struct HermiteMatrices {
    pub ai: DMatrix<f64>,
    pub bi: DMatrix<f64>,
    pub ad: DMatrix<f64>,
    pub bd: DMatrix<f64>,
}

impl HermiteMatrices {
    /// Builds the matrices for value/slope data at `disc` evaluated at `col`.
    pub fn new(disc: &[f64], col: &[f64]) -> Result<Self> {
        if disc.len() < 2 {
            bail!("Hermite interpolation needs at least two nodes, got {}", disc.len());
        }
        let basis = hermite_basis(disc)?;
        let ns = disc.len();
        let nc = col.len();
        let mut ai = DMatrix::zeros(nc, ns);
        let mut bi = DMatrix::zeros(nc, ns);
        let mut ad = DMatrix::zeros(nc, ns);
        let mut bd = DMatrix::zeros(nc, ns);
        for (c, &tau) in col.iter().enumerate() {
            for j in 0..ns {
                let (value, slope) = polynomial_eval(basis.column(2 * j).as_slice(), tau);
                ai[(c, j)] = value;
                ad[(c, j)] = slope;
                let (value, slope) = polynomial_eval(basis.column(2 * j + 1).as_slice(), tau);
                bi[(c, j)] = value;
                bd[(c, j)] = slope;
            }
        }
        Ok(Self { ai, bi, ad, bd })
    }

    pub fn num_discretization(&self) -> usize {
        self.ai.ncols()
    }

    pub fn num_collocation(&self) -> usize {
        self.ai.nrows()
    }

    /// Interpolated values and transcribed rates at the collocation nodes of one
    /// segment of duration `h`.
    pub fn interpolate(
        &self,
        values: &[f64],
        rates: &[f64],
        h: f64,
        col_values: &mut [f64],
        col_rates: &mut [f64],
    ) {
        let ns = self.num_discretization();
        assert_eq!(values.len(), ns, "segment value count mismatch");
        assert_eq!(rates.len(), ns, "segment rate count mismatch");
        for c in 0..self.num_collocation() {
            let mut x = 0.0;
            let mut xdot = 0.0;
            for j in 0..ns {
                x += self.ai[(c, j)] * values[j] + h * self.bi[(c, j)] * rates[j];
                xdot += self.ad[(c, j)] * values[j] / h + self.bd[(c, j)] * rates[j];
            }
            col_values[c] = x;
            col_rates[c] = xdot;
        }
    }
}

/// Monomial coefficients of the Hermite cardinal basis. Column `2j` is the
/// polynomial with unit value at node `j`, column `2j + 1` the one with unit
/// slope there; every other value and slope vanishes.
fn hermite_basis(nodes: &[f64]) -> Result<DMatrix<f64>> {
    let size = 2 * nodes.len();
    let mut confluent = DMatrix::zeros(size, size);
    for (i, &node) in nodes.iter().enumerate() {
        let mut power = 1.0;
        for k in 0..size {
            confluent[(2 * i, k)] = power;
            if k + 1 < size {
                confluent[(2 * i + 1, k + 1)] = (k + 1) as f64 * power;
            }
            power *= node;
        }
    }
    let lu = confluent.lu();
    if !lu.is_invertible() {
        bail!("Confluent Vandermonde matrix is singular; nodes must be distinct");
    }
    let mut basis = DMatrix::zeros(size, size);
    for j in 0..size {
        let mut rhs = DVector::zeros(size);
        rhs[j] = 1.0;
        let sol = lu
            .solve(&rhs)
            .ok_or_else(|| anyhow!("Failed to solve for Hermite basis coefficients"))?;
        basis.set_column(j, &sol);
    }
    Ok(basis)
}

/// Value and first derivative of `Σ coeffs[k] x^k`.
fn polynomial_eval(coeffs: &[f64], x: f64) -> (f64, f64) {
    let mut value = 0.0;
    let mut slope = 0.0;
    for &c in coeffs.iter().rev() {
        slope = slope * x + value;
        value = value * x + c;
    }
    (value, slope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_matrix(actual: &DMatrix<f64>, expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.row_iter().flat_map(|r| r.iter().copied().collect::<Vec<_>>()).zip(expected) {
            assert!((a - e).abs() < 1e-12, "{actual} vs {expected:?}");
        }
    }

    #[test]
    fn third_order_matrices_match_closed_form() {
        let m = HermiteMatrices::new(&[0.0, 1.0], &[0.5]).expect("matrices should compute");
        assert_matrix(&m.ai, &[0.5, 0.5]);
        assert_matrix(&m.bi, &[0.125, -0.125]);
        assert_matrix(&m.ad, &[-1.5, 1.5]);
        assert_matrix(&m.bd, &[-0.25, -0.25]);
    }

    #[test]
    fn polynomial_eval_uses_horner() {
        // 1 + 2x + 3x^2 at x = 2
        assert_eq!(polynomial_eval(&[1.0, 2.0, 3.0], 2.0), (17.0, 14.0));
    }

    #[test]
    fn interpolation_is_exact_for_matching_degree() {
        // Three discretization nodes support degree 5.
        let disc = [0.0, 0.5, 1.0];
        let col = [0.2, 0.7];
        let m = HermiteMatrices::new(&disc, &col).expect("matrices should compute");
        let h = 2.5;
        // x(t) = t^5 - 2 t^2 on t in [0, h], tau = t / h.
        let x = |t: f64| t.powi(5) - 2.0 * t * t;
        let dx = |t: f64| 5.0 * t.powi(4) - 4.0 * t;
        let values: Vec<f64> = disc.iter().map(|tau| x(tau * h)).collect();
        let rates: Vec<f64> = disc.iter().map(|tau| dx(tau * h)).collect();
        let mut col_values = [0.0; 2];
        let mut col_rates = [0.0; 2];
        m.interpolate(&values, &rates, h, &mut col_values, &mut col_rates);
        for (c, tau) in col.iter().enumerate() {
            assert!((col_values[c] - x(tau * h)).abs() < 1e-10);
            assert!((col_rates[c] - dx(tau * h)).abs() < 1e-10);
        }
    }

    #[test]
    fn duplicate_nodes_are_rejected() {
        let err = HermiteMatrices::new(&[0.0, 0.0], &[0.5]).expect_err("singular system");
        assert!(format!("{err}").contains("singular"));
    }
}
