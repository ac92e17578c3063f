//! Primal-dual interior-point solver for the convex subproblems
//!
//! ```text
//! min ½ zᵀQz + qᵀz   s.t.   Gz <= h
//! ```
//!
//! with Mehrotra predictor-corrector steps. `Q` must be positive definite on
//! the null space of the active rows; the SQP driver guarantees this by giving
//! every elastic variable its own `-t <= 0` row.

use crate::error::SolveError;
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpSettings {
    pub tolerance: f64,
    /// Residual level at which a solve that stops improving is still accepted.
    pub acceptable_tolerance: f64,
    pub max_iterations: usize,
    pub stall_iterations: usize,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            acceptable_tolerance: 1e-7,
            max_iterations: 200,
            stall_iterations: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub z: DVector<f64>,
    /// One multiplier per row of `G`, all non-negative.
    pub multipliers: DVector<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// `a · v` for a sparse `a`.
pub(crate) fn sparse_mul(a: &CsrMatrix<f64>, v: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(a.nrows());
    for (i, row) in a.row_iter().enumerate() {
        out[i] = row
            .col_indices()
            .iter()
            .zip(row.values())
            .map(|(&j, &value)| value * v[j])
            .sum();
    }
    out
}

/// `aᵀ · v` for a sparse `a`.
pub(crate) fn sparse_tr_mul(a: &CsrMatrix<f64>, v: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(a.ncols());
    for (i, row) in a.row_iter().enumerate() {
        for (&j, &value) in row.col_indices().iter().zip(row.values()) {
            out[j] += value * v[i];
        }
    }
    out
}

/// Largest `α <= 1` keeping `w + α dw` and `λ + α dλ` non-negative.
fn max_step(w: &DVector<f64>, dw: &DVector<f64>, lam: &DVector<f64>, dlam: &DVector<f64>) -> f64 {
    let mut alpha: f64 = 1.0;
    for i in 0..w.len() {
        if dw[i] < 0.0 {
            alpha = alpha.min(-w[i] / dw[i]);
        }
        if dlam[i] < 0.0 {
            alpha = alpha.min(-lam[i] / dlam[i]);
        }
    }
    alpha
}

/// Cholesky factor of `normal`, shifting the diagonal when rounding has cost
/// the matrix its definiteness.
fn shifted_cholesky(normal: DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    if let Some(chol) = Cholesky::new(normal.clone()) {
        return Some(chol);
    }
    let mut shift = 1e-14 * normal.diagonal().amax().max(1.0);
    for _ in 0..MAX_SHIFTS {
        let mut shifted = normal.clone();
        for i in 0..shifted.nrows() {
            shifted[(i, i)] += shift;
        }
        if let Some(chol) = Cholesky::new(shifted) {
            return Some(chol);
        }
        shift *= 100.0;
    }
    None
}

const MAX_SHIFTS: usize = 12;

/// Best iterate seen so far, by the scaled residual.
struct Best {
    error: f64,
    z: DVector<f64>,
    lam: DVector<f64>,
}

impl Best {
    fn into_solution(self, iterations: usize, acceptable: f64) -> QpSolution {
        QpSolution {
            converged: self.error <= acceptable,
            z: self.z,
            multipliers: self.lam,
            iterations,
        }
    }
}

/// Solves the QP by a primal-dual interior-point method.
///
/// Converged when the scaled dual and primal residuals and the mean
/// complementarity all fall below `settings.tolerance`. Near the solution
/// rounding can keep the residuals from falling further; once the best
/// iterate is within `acceptable_tolerance` and `stall_iterations` pass
/// without improvement, that iterate is returned as converged.
pub fn solve_qp(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    rows: &CsrMatrix<f64>,
    rhs: &DVector<f64>,
    settings: &QpSettings,
) -> Result<QpSolution, SolveError> {
    let n = gradient.len();
    let m = rhs.len();
    assert_eq!(hessian.shape(), (n, n), "QP Hessian shape mismatch");
    assert_eq!((rows.nrows(), rows.ncols()), (m, n), "QP constraint shape mismatch");

    if m == 0 {
        let chol = Cholesky::new(hessian.clone()).ok_or_else(|| SolveError::NumericalFailure {
            what: "QP Hessian is not positive definite".to_string(),
        })?;
        return Ok(QpSolution {
            z: chol.solve(&(-gradient)),
            multipliers: DVector::zeros(0),
            iterations: 0,
            converged: true,
        });
    }

    let tol = settings.tolerance;
    let acceptable = settings.acceptable_tolerance;
    let q_norm = gradient.amax();
    let h_norm = rhs.amax();
    let mut z = DVector::zeros(n);
    let mut w = rhs.map(|h| h.max(1.0));
    let mut lam = DVector::from_element(m, 1.0);
    let mut best: Option<Best> = None;
    let mut stalled = 0;

    for iteration in 0..settings.max_iterations {
        let gz = sparse_mul(rows, &z);
        let rd = hessian * &z + gradient + sparse_tr_mul(rows, &lam);
        let rp = &gz + &w - rhs;
        let mu = w.dot(&lam) / m as f64;
        if !(mu.is_finite() && rd.iter().chain(rp.iter()).all(|v| v.is_finite())) {
            return match best {
                Some(best) if best.error <= acceptable => {
                    Ok(best.into_solution(iteration, acceptable))
                }
                _ => Err(SolveError::NumericalFailure {
                    what: format!("QP iterate became non-finite at iteration {iteration}"),
                }),
            };
        }
        let error = (rd.amax() / (1.0 + q_norm))
            .max(rp.amax() / (1.0 + h_norm))
            .max(mu);
        if error <= tol {
            return Ok(QpSolution {
                z,
                multipliers: lam,
                iterations: iteration,
                converged: true,
            });
        }
        if best.as_ref().map_or(true, |b| error < b.error) {
            best = Some(Best {
                error,
                z: z.clone(),
                lam: lam.clone(),
            });
            stalled = 0;
        } else if best.as_ref().is_some_and(|b| b.error <= acceptable) {
            stalled += 1;
            if stalled >= settings.stall_iterations {
                if let Some(b) = best.take() {
                    return Ok(b.into_solution(iteration, acceptable));
                }
            }
        }

        // Normal matrix Q + Gᵀ diag(λ/w) G, accumulated row by row.
        let d = lam.component_div(&w);
        let mut normal = hessian.clone();
        for (i, row) in rows.row_iter().enumerate() {
            let cols = row.col_indices();
            let vals = row.values();
            for (&a, &va) in cols.iter().zip(vals) {
                for (&b, &vb) in cols.iter().zip(vals) {
                    normal[(a, b)] += d[i] * va * vb;
                }
            }
        }
        let chol = shifted_cholesky(normal).ok_or_else(|| SolveError::NumericalFailure {
            what: format!("QP normal matrix lost definiteness at iteration {iteration}"),
        })?;

        let newton = |rc: &DVector<f64>| {
            let r = d.component_mul(&rp) + rc.component_div(&w);
            let dz = chol.solve(&(-&rd - sparse_tr_mul(rows, &r)));
            let dlam = d.component_mul(&(sparse_mul(rows, &dz) + &rp)) + rc.component_div(&w);
            let dw = (rc - w.component_mul(&dlam)).component_div(&lam);
            (dz, dw, dlam)
        };

        // Predictor.
        let rc = -w.component_mul(&lam);
        let (_, dw_aff, dlam_aff) = newton(&rc);
        let alpha_aff = max_step(&w, &dw_aff, &lam, &dlam_aff);
        let mu_aff = (&w + &dw_aff * alpha_aff).dot(&(&lam + &dlam_aff * alpha_aff)) / m as f64;
        let sigma = (mu_aff / mu).powi(3);

        // Corrector.
        let rc = rc.add_scalar(sigma * mu) - dw_aff.component_mul(&dlam_aff);
        let (dz, dw, dlam) = newton(&rc);
        let alpha = (0.99 * max_step(&w, &dw, &lam, &dlam)).min(1.0);
        z += dz * alpha;
        w += dw * alpha;
        lam += dlam * alpha;
    }

    Ok(match best {
        Some(best) => best.into_solution(settings.max_iterations, acceptable),
        None => QpSolution {
            z,
            multipliers: lam,
            iterations: settings.max_iterations,
            converged: false,
        },
    })
}
