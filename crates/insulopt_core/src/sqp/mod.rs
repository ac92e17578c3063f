//! Sequential quadratic programming with an elastic ℓ1 merit function.
//!
//! Every constraint row gets a slack `t_i >= 0` in the subproblem so the QP is
//! always feasible; the slacks are penalized with weight `ν`. When the
//! constraints are still violated, `ν` has reached its ceiling and no step can
//! reduce the ℓ1 violation any further, the problem is reported infeasible.

pub mod bfgs;
pub mod qp;

use crate::error::{EvalError, SolveError};
use crate::nlp::{Bounds, NlpProblem};
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use bfgs::damped_update;
pub use qp::{solve_qp, QpSettings, QpSolution};

use qp::sparse_tr_mul;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqpSettings {
    pub max_iterations: usize,
    /// Converged once the scaled step's max-norm drops below this.
    pub step_tolerance: f64,
    /// Largest scaled ℓ1 violation accepted as feasible.
    pub feasibility_tolerance: f64,
    pub initial_penalty: f64,
    pub max_penalty: f64,
    /// Sufficient-decrease factor of the backtracking line search.
    pub armijo: f64,
    pub min_step_length: f64,
    pub qp: QpSettings,
}

impl Default for SqpSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            step_tolerance: 1e-8,
            feasibility_tolerance: 1e-7,
            initial_penalty: 10.0,
            max_penalty: 1e6,
            armijo: 1e-4,
            min_step_length: 1e-10,
            qp: QpSettings::default(),
        }
    }
}

impl SqpSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            bail!("solver.max_iterations must be greater than zero.");
        }
        for (name, value) in [
            ("solver.step_tolerance", self.step_tolerance),
            ("solver.feasibility_tolerance", self.feasibility_tolerance),
            ("solver.initial_penalty", self.initial_penalty),
            ("solver.armijo", self.armijo),
            ("solver.min_step_length", self.min_step_length),
            ("solver.qp.tolerance", self.qp.tolerance),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                bail!("{name} must be positive, got {value}.");
            }
        }
        if !(self.max_penalty >= self.initial_penalty) {
            bail!("solver.max_penalty must not be below solver.initial_penalty.");
        }
        if self.qp.max_iterations == 0 {
            bail!("solver.qp.max_iterations must be greater than zero.");
        }
        if !(self.qp.acceptable_tolerance >= self.qp.tolerance) {
            bail!("solver.qp.acceptable_tolerance must not be below solver.qp.tolerance.");
        }
        if self.qp.stall_iterations == 0 {
            bail!("solver.qp.stall_iterations must be greater than zero.");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqpSolution {
    /// Optimal point in problem units.
    pub x: DVector<f64>,
    pub objective: f64,
    /// ℓ1 constraint violation in scaled units.
    pub violation: f64,
    pub iterations: usize,
    pub penalty: f64,
}

/// View of a problem in which variables, constraints and the objective are
/// divided by their characteristic scales.
struct Scaled<'a, P: ?Sized> {
    problem: &'a mut P,
    x_scale: DVector<f64>,
    c_scale: DVector<f64>,
    f_scale: f64,
}

impl<'a, P: NlpProblem + ?Sized> Scaled<'a, P> {
    fn new(problem: &'a mut P) -> Self {
        let x_scale = DVector::from_vec(problem.variable_scales());
        let c_scale = DVector::from_vec(problem.constraint_scales());
        let f_scale = problem.objective_scale();
        Self {
            problem,
            x_scale,
            c_scale,
            f_scale,
        }
    }

    fn unscale(&self, x: &DVector<f64>) -> DVector<f64> {
        x.component_mul(&self.x_scale)
    }

    fn objective(&mut self, x: &DVector<f64>) -> Result<f64, EvalError> {
        let xp = self.unscale(x);
        Ok(self.problem.objective(&xp)? / self.f_scale)
    }

    fn gradient(&mut self, x: &DVector<f64>) -> Result<DVector<f64>, EvalError> {
        let xp = self.unscale(x);
        let mut g = DVector::zeros(xp.len());
        self.problem.objective_gradient(&xp, &mut g)?;
        Ok(g.component_mul(&self.x_scale) / self.f_scale)
    }

    fn constraints(&mut self, x: &DVector<f64>) -> Result<DVector<f64>, EvalError> {
        let xp = self.unscale(x);
        let mut c = DVector::zeros(self.c_scale.len());
        self.problem.constraints(&xp, &mut c)?;
        Ok(c.component_div(&self.c_scale))
    }

    fn jacobian(&mut self, x: &DVector<f64>) -> Result<CsrMatrix<f64>, EvalError> {
        let xp = self.unscale(x);
        let mut values = vec![0.0; self.problem.jacobian_structure().nnz()];
        self.problem.jacobian_values(&xp, &mut values)?;
        let structure = self.problem.jacobian_structure();
        for ((v, &r), &c) in values.iter_mut().zip(structure.rows()).zip(structure.cols()) {
            *v *= self.x_scale[c] / self.c_scale[r];
        }
        Ok(CsrMatrix::from(&structure.to_coo(&values)))
    }
}

/// Which constraint side a subproblem row linearizes, for recovering
/// the NLP multipliers.
#[derive(Debug, Clone, Copy)]
enum RowKind {
    Upper(usize),
    Lower(usize),
    Other,
}

struct Subproblem {
    hessian: DMatrix<f64>,
    gradient: DVector<f64>,
    rows: CsrMatrix<f64>,
    rhs: DVector<f64>,
    kinds: Vec<RowKind>,
}

/// Elastic QP in `z = (p, t)`:
///
/// ```text
/// min ½ pᵀBp + gᵀp + ν Σt
///   J_i p - t_i <= hi_i - c_i,   -J_i p - t_i <= c_i - lo_i,   -t_i <= 0
///   xlo - x <= p <= xhi - x
/// ```
#[allow(clippy::too_many_arguments)]
fn build_subproblem(
    b: &DMatrix<f64>,
    g: &DVector<f64>,
    jac: &CsrMatrix<f64>,
    c: &DVector<f64>,
    cons: &Bounds,
    x: &DVector<f64>,
    vars: &Bounds,
    penalty: f64,
) -> Subproblem {
    let n = x.len();
    let m = c.len();
    let size = n + m;

    let mut hessian = DMatrix::zeros(size, size);
    hessian.view_mut((0, 0), (n, n)).copy_from(b);
    let mut gradient = DVector::from_element(size, penalty);
    gradient.rows_mut(0, n).copy_from(g);

    let mut entries: Vec<(usize, usize, f64)> = Vec::new();
    let mut rhs = Vec::new();
    let mut kinds = Vec::new();
    let mut push_row = |terms: &[(usize, f64)], h: f64, kind: RowKind| {
        let row = rhs.len();
        entries.extend(terms.iter().map(|&(col, v)| (row, col, v)));
        rhs.push(h);
        kinds.push(kind);
    };

    for (i, row) in jac.row_iter().enumerate() {
        let linear: Vec<(usize, f64)> = row
            .col_indices()
            .iter()
            .copied()
            .zip(row.values().iter().copied())
            .collect();
        if cons.upper[i].is_finite() {
            let mut terms = linear.clone();
            terms.push((n + i, -1.0));
            push_row(&terms, cons.upper[i] - c[i], RowKind::Upper(i));
        }
        if cons.lower[i].is_finite() {
            let mut terms: Vec<(usize, f64)> = linear.iter().map(|&(j, v)| (j, -v)).collect();
            terms.push((n + i, -1.0));
            push_row(&terms, c[i] - cons.lower[i], RowKind::Lower(i));
        }
        push_row(&[(n + i, -1.0)], 0.0, RowKind::Other);
    }
    for j in 0..n {
        if vars.upper[j].is_finite() {
            push_row(&[(j, 1.0)], vars.upper[j] - x[j], RowKind::Other);
        }
        if vars.lower[j].is_finite() {
            push_row(&[(j, -1.0)], x[j] - vars.lower[j], RowKind::Other);
        }
    }

    let mut coo = CooMatrix::new(rhs.len(), size);
    for (r, col, v) in entries {
        coo.push(r, col, v);
    }
    Subproblem {
        hessian,
        gradient,
        rows: CsrMatrix::from(&coo),
        rhs: DVector::from_vec(rhs),
        kinds,
    }
}

fn scale_bounds(bounds: Bounds, scale: &DVector<f64>) -> Bounds {
    Bounds {
        lower: bounds.lower.iter().zip(scale.iter()).map(|(v, s)| v / s).collect(),
        upper: bounds.upper.iter().zip(scale.iter()).map(|(v, s)| v / s).collect(),
    }
}

fn eval_failure(stage: &str, err: EvalError) -> SolveError {
    SolveError::NumericalFailure {
        what: format!("{stage}: {err}"),
    }
}

/// Fraction of the current violation that the elastic step must remove for
/// the violation to count as still reducible.
const STATIONARY_FRACTION: f64 = 1e-6;

/// Search direction from one elastic subproblem.
struct ElasticStep {
    p: DVector<f64>,
    elastic_sum: f64,
    /// Constraint multipliers recovered from the subproblem rows.
    eta: DVector<f64>,
    qp_iterations: usize,
}

/// Solves the elastic subproblem, raising `penalty` and solving again until
/// it dominates the constraint multipliers or reaches `max_penalty`. The
/// returned step is always computed with the final penalty.
#[allow(clippy::too_many_arguments)]
fn elastic_step(
    b: &DMatrix<f64>,
    g: &DVector<f64>,
    jac: &CsrMatrix<f64>,
    c: &DVector<f64>,
    cons: &Bounds,
    x: &DVector<f64>,
    vars: &Bounds,
    penalty: &mut f64,
    settings: &SqpSettings,
) -> Result<ElasticStep, SolveError> {
    let n = x.len();
    let m = c.len();
    loop {
        let sub = build_subproblem(b, g, jac, c, cons, x, vars, *penalty);
        let qp = solve_qp(&sub.hessian, &sub.gradient, &sub.rows, &sub.rhs, &settings.qp)?;
        if !qp.converged {
            if !qp.z.iter().all(|v| v.is_finite()) {
                return Err(SolveError::NumericalFailure {
                    what: "QP subproblem diverged".to_string(),
                });
            }
            warn!(qp_iterations = qp.iterations, "QP subproblem did not converge");
        }

        let mut eta = DVector::<f64>::zeros(m);
        for (kind, lam) in sub.kinds.iter().zip(qp.multipliers.iter()) {
            match *kind {
                RowKind::Upper(i) => eta[i] += lam,
                RowKind::Lower(i) => eta[i] -= lam,
                RowKind::Other => {}
            }
        }
        let eta_max = eta.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
        if *penalty < 1.5 * eta_max && *penalty < settings.max_penalty {
            *penalty = settings.max_penalty.min((2.0 * eta_max).max(10.0 * *penalty));
            debug!(penalty = *penalty, "penalty raised, solving the subproblem again");
            continue;
        }

        return Ok(ElasticStep {
            p: qp.z.rows(0, n).into_owned(),
            elastic_sum: qp.z.rows(n, m).sum(),
            eta,
            qp_iterations: qp.iterations,
        });
    }
}

/// Whether no step can reduce the linearized ℓ1 violation at `x`.
///
/// Solves the elastic subproblem with a unit Hessian, no objective and the
/// largest penalty; the point is stationary when the slacks still carry
/// (almost) all of the current violation.
fn violation_is_stationary(
    jac: &CsrMatrix<f64>,
    c: &DVector<f64>,
    cons: &Bounds,
    x: &DVector<f64>,
    vars: &Bounds,
    settings: &SqpSettings,
) -> bool {
    let n = x.len();
    let m = c.len();
    let violation = cons.violation(c.as_slice());
    let identity = DMatrix::identity(n, n);
    let zero = DVector::zeros(n);
    let sub = build_subproblem(&identity, &zero, jac, c, cons, x, vars, settings.max_penalty);
    match solve_qp(&sub.hessian, &sub.gradient, &sub.rows, &sub.rhs, &settings.qp) {
        Ok(qp) if qp.z.iter().all(|v| v.is_finite()) => {
            violation - qp.z.rows(n, m).sum() <= STATIONARY_FRACTION * violation
        }
        _ => false,
    }
}

/// Minimizes `problem` from its initial guess.
///
/// Converges once the point is feasible and either the scaled step or the
/// predicted merit decrease is negligible. With the penalty at its ceiling,
/// a violated point whose ℓ1 violation no step can reduce is reported as
/// [`SolveError::Infeasible`].
///
/// Evaluation errors at trial points are treated as rejected line-search
/// steps; an evaluation error at an accepted point is a
/// [`SolveError::NumericalFailure`].
pub fn solve<P: NlpProblem + ?Sized>(
    problem: &mut P,
    settings: &SqpSettings,
) -> Result<SqpSolution, SolveError> {
    let n = problem.num_variables();
    let m = problem.num_constraints();
    let x0 = problem.initial_guess();
    assert_eq!(x0.len(), n, "initial guess length mismatch");

    let mut scaled = Scaled::new(problem);
    let vars = scale_bounds(scaled.problem.variable_bounds(), &scaled.x_scale);
    let cons = scale_bounds(scaled.problem.constraint_bounds(), &scaled.c_scale);

    let mut x = x0.component_div(&scaled.x_scale);
    for j in 0..n {
        x[j] = x[j].max(vars.lower[j]).min(vars.upper[j]);
    }

    let mut f = scaled
        .objective(&x)
        .map_err(|e| eval_failure("initial objective", e))?;
    let mut c = scaled
        .constraints(&x)
        .map_err(|e| eval_failure("initial constraints", e))?;
    let mut g = scaled
        .gradient(&x)
        .map_err(|e| eval_failure("initial gradient", e))?;
    let mut jac = scaled
        .jacobian(&x)
        .map_err(|e| eval_failure("initial Jacobian", e))?;
    let mut b = DMatrix::identity(n, n);
    // No curvature pairs have entered `b` since it was last reset.
    let mut fresh_hessian = true;
    let mut penalty = settings.initial_penalty;
    let mut step_norm = f64::INFINITY;

    debug!(variables = n, constraints = m, "starting SQP");

    for iteration in 0..settings.max_iterations {
        let violation = cons.violation(c.as_slice());
        let feasible = violation <= settings.feasibility_tolerance;

        let step = match elastic_step(&b, &g, &jac, &c, &cons, &x, &vars, &mut penalty, settings) {
            Ok(step) => step,
            Err(err) if !fresh_hessian => {
                warn!(iteration, %err, "subproblem failed, resetting the Hessian approximation");
                b = DMatrix::identity(n, n);
                fresh_hessian = true;
                continue;
            }
            Err(err) => {
                if !feasible
                    && penalty >= settings.max_penalty
                    && violation_is_stationary(&jac, &c, &cons, &x, &vars, settings)
                {
                    return Err(SolveError::Infeasible {
                        violation,
                        iterations: iteration,
                    });
                }
                return Err(err);
            }
        };

        step_norm = step.p.amax();
        let predicted = g.dot(&step.p) - penalty * (violation - step.elastic_sum);
        debug!(
            iteration,
            objective = f * scaled.f_scale,
            violation,
            step = step_norm,
            predicted,
            penalty,
            qp_iterations = step.qp_iterations,
            "SQP iteration"
        );

        let stalled = step_norm <= settings.step_tolerance * (1.0 + x.amax());
        if feasible && (stalled || predicted.abs() <= settings.step_tolerance * (1.0 + f.abs())) {
            info!(iterations = iteration, objective = f * scaled.f_scale, "SQP converged");
            return Ok(SqpSolution {
                x: scaled.unscale(&x),
                objective: f * scaled.f_scale,
                violation,
                iterations: iteration,
                penalty,
            });
        }
        if !feasible
            && penalty >= settings.max_penalty
            && (stalled || violation - step.elastic_sum <= STATIONARY_FRACTION * violation)
        {
            return Err(SolveError::Infeasible {
                violation,
                iterations: iteration,
            });
        }
        if stalled {
            // Violated but no progress: weight the slacks harder and retry.
            penalty = settings.max_penalty.min(10.0 * penalty);
            continue;
        }

        let merit0 = f + penalty * violation;
        let decrease = predicted.min(0.0);
        let mut alpha = 1.0;
        let mut accepted = None;
        while alpha > settings.min_step_length {
            let trial = &x + &step.p * alpha;
            let outcome = scaled
                .objective(&trial)
                .and_then(|ft| scaled.constraints(&trial).map(|ct| (ft, ct)));
            match outcome {
                Ok((ft, ct)) => {
                    let merit = ft + penalty * cons.violation(ct.as_slice());
                    if merit <= merit0 + settings.armijo * alpha * decrease + 1e-14 * merit0.abs() {
                        accepted = Some((trial, ft, ct));
                        break;
                    }
                }
                Err(err) => warn!(iteration, alpha, %err, "trial point rejected"),
            }
            alpha *= 0.5;
        }
        let Some((x_new, f_new, c_new)) = accepted else {
            if !feasible && penalty < settings.max_penalty {
                penalty = settings.max_penalty.min(10.0 * penalty);
            } else if !feasible && violation_is_stationary(&jac, &c, &cons, &x, &vars, settings) {
                return Err(SolveError::Infeasible {
                    violation,
                    iterations: iteration,
                });
            } else if fresh_hessian {
                return Err(SolveError::LineSearchFailed {
                    iteration,
                    violation,
                });
            }
            warn!(iteration, penalty, "line search failed, resetting the Hessian approximation");
            b = DMatrix::identity(n, n);
            fresh_hessian = true;
            continue;
        };

        let g_new = scaled
            .gradient(&x_new)
            .map_err(|e| eval_failure("gradient at accepted point", e))?;
        let jac_new = scaled
            .jacobian(&x_new)
            .map_err(|e| eval_failure("Jacobian at accepted point", e))?;

        let s = &x_new - &x;
        let y = &g_new - &g + sparse_tr_mul(&jac_new, &step.eta) - sparse_tr_mul(&jac, &step.eta);
        if damped_update(&mut b, &s, &y) {
            fresh_hessian = false;
        }

        x = x_new;
        f = f_new;
        c = c_new;
        g = g_new;
        jac = jac_new;
    }

    Err(SolveError::IterationLimit {
        iterations: settings.max_iterations,
        violation: cons.violation(c.as_slice()),
        step_norm,
    })
}
