//! Error types shared across the crate.

use thiserror::Error;

/// A trial point the model cannot be evaluated at.
///
/// The SQP line search treats this as a rejected trial point and backtracks,
/// it is never fatal for the solve as a whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{name} must be strictly positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("non-finite {what} at node {node}")]
    NonFinite { what: &'static str, node: usize },
}

/// Malformed transcription setup, detected at problem construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranscriptionError {
    #[error("Gauss-Lobatto order must be odd and at least 3, got {order}")]
    InvalidOrder { order: usize },

    #[error("number of segments must be at least 1")]
    NoSegments,

    #[error("invalid segment ends: {what}")]
    SegmentEnds { what: String },

    #[error("failed to build interpolation matrices: {what}")]
    Interpolation { what: String },
}

/// Outcomes of an optimization that did not reach a KKT point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("problem is infeasible: constraint violation {violation:.3e} remains after {iterations} iterations at maximum penalty")]
    Infeasible { violation: f64, iterations: usize },

    #[error("optimization did not converge in {iterations} iterations (violation {violation:.3e}, step {step_norm:.3e})")]
    IterationLimit {
        iterations: usize,
        violation: f64,
        step_norm: f64,
    },

    #[error("line search failed at iteration {iteration} (violation {violation:.3e})")]
    LineSearchFailed { iteration: usize, violation: f64 },

    #[error("numerical failure: {what}")]
    NumericalFailure { what: String },
}

impl SolveError {
    /// True when the solver proved the constraints cannot be met, as opposed to
    /// giving up for numerical reasons.
    pub fn is_infeasible(&self) -> bool {
        matches!(self, SolveError::Infeasible { .. })
    }
}

/// Forward integration failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("step size underflow at t = {t} (h = {step:.3e})")]
    StepSizeUnderflow { t: f64, step: f64 },

    #[error("step budget of {max_steps} exhausted at t = {t}")]
    TooManySteps { max_steps: usize, t: f64 },

    #[error("state became non-finite at t = {t}")]
    NonFiniteState { t: f64 },

    #[error("invalid simulation setup: {what}")]
    Setup { what: String },
}
