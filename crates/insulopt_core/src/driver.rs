use crate::config::{BoundaryLocation, ProblemConfig};
use crate::nlp::{InsulationProblem, NlpProblem, TranscribedSolution};
use crate::simulate::{verify, Verification};
use crate::sqp;
use anyhow::{Context, Result};
use nalgebra::DVector;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub thickness: f64,
    pub final_temperature: f64,
    pub iterations: usize,
    /// ℓ1 violation of the constraint rows in problem units.
    pub violation: f64,
    pub penalty: f64,
    /// Thickness that lands exactly on the tightest final upper bound, from
    /// the closed-form trajectory. Absent when no such bound is reachable.
    pub closed_form_thickness: Option<f64>,
    pub solution: TranscribedSolution,
    pub verification: Verification,
}

/// Builds the transcribed problem, minimizes the thickness and re-integrates
/// the optimum.
///
/// A solver failure comes back as a [`crate::error::SolveError`] inside the
/// [`anyhow::Error`], so callers can tell an infeasible problem apart with
/// `err.downcast_ref::<SolveError>()`.
pub fn run_optimization(config: &ProblemConfig) -> Result<OptimizationReport> {
    config.validate()?;
    let mut problem = InsulationProblem::new(config)?;
    info!(
        segments = problem.transcription().num_segments(),
        order = problem.transcription().order(),
        variables = problem.num_variables(),
        constraints = problem.num_constraints(),
        "solving insulation problem"
    );

    let result = sqp::solve(&mut problem, &config.solver)?;
    let solution = problem
        .solution(&result.x)
        .context("Failed to evaluate the optimal trajectory")?;
    let violation = physical_violation(&mut problem, &result.x)?;

    let physics = problem.physics_at(&result.x);
    let verification = verify(
        &physics,
        &solution.timeseries.time,
        &solution.timeseries.temperature,
        &config.simulation,
    )
    .context("Failed to re-integrate the optimal trajectory")?;
    if !verification.passed {
        warn!(
            max_difference = verification.max_difference,
            tolerance = verification.tolerance,
            "transcribed trajectory disagrees with forward integration"
        );
    }

    let closed_form_thickness = config
        .boundary_constraints
        .iter()
        .filter(|bc| bc.location == BoundaryLocation::Final)
        .filter_map(|bc| bc.upper)
        .reduce(f64::min)
        .and_then(|upper| {
            physics.thickness_reaching(config.state.initial, upper, solution.t_duration)
        });

    info!(
        thickness = solution.thickness,
        final_temperature = solution.final_temperature(),
        iterations = result.iterations,
        "optimization finished"
    );

    Ok(OptimizationReport {
        thickness: solution.thickness,
        final_temperature: solution.final_temperature(),
        iterations: result.iterations,
        violation,
        penalty: result.penalty,
        closed_form_thickness,
        solution,
        verification,
    })
}

fn physical_violation(problem: &mut InsulationProblem, x: &DVector<f64>) -> Result<f64> {
    let mut c = DVector::zeros(problem.num_constraints());
    problem
        .constraints(x, &mut c)
        .context("Failed to evaluate constraints at the optimum")?;
    Ok(problem.constraint_bounds().violation(c.as_slice()))
}
