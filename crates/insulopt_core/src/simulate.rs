//! Forward integration of the cell temperature, used to cross-check a
//! transcribed solution against an independent integrator.

use crate::dynamics::{InsulatedCell, PhysicalParameters};
use crate::error::SimulationError;
use crate::solvers::{integrate_adaptive, AdaptiveSettings, StepStats, RK4};
use crate::traits::Steppable;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    Rk4,
    Tsit5,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub method: IntegrationMethod,
    pub adaptive: AdaptiveSettings,
    /// Upper bound on the RK4 step; each output interval is split evenly.
    pub fixed_step: f64,
    /// Samples of a plain forward run.
    pub output_points: usize,
    /// Largest accepted gap between transcription and integration, K.
    pub verification_tolerance: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Tsit5,
            adaptive: AdaptiveSettings::default(),
            fixed_step: 0.01,
            output_points: 101,
            verification_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatedTrajectory {
    pub times: Vec<f64>,
    pub temperatures: Vec<f64>,
    pub steps: usize,
    pub rejected_steps: usize,
}

impl SimulatedTrajectory {
    pub fn final_temperature(&self) -> Option<f64> {
        self.temperatures.last().copied()
    }
}

/// `count` evenly spaced times over `[t_initial, t_initial + t_duration]`.
pub fn sample_times(t_initial: f64, t_duration: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![t_initial],
        _ => (0..count)
            .map(|i| t_initial + t_duration * i as f64 / (count - 1) as f64)
            .collect(),
    }
}

/// Integrates the cell from `initial_temperature` at `times[0]` and reports the
/// temperature at every entry of `times`.
pub fn simulate(
    params: &PhysicalParameters,
    initial_temperature: f64,
    times: &[f64],
    settings: &SimulationSettings,
) -> Result<SimulatedTrajectory, SimulationError> {
    params
        .check_divisors()
        .map_err(|err| SimulationError::Setup {
            what: err.to_string(),
        })?;
    let Some(&t0) = times.first() else {
        return Ok(SimulatedTrajectory {
            times: Vec::new(),
            temperatures: Vec::new(),
            steps: 0,
            rejected_steps: 0,
        });
    };
    let cell = InsulatedCell::new(*params);

    let (temperatures, stats) = match settings.method {
        IntegrationMethod::Tsit5 => {
            let (states, stats) =
                integrate_adaptive(&cell, t0, &[initial_temperature], times, &settings.adaptive)?;
            (states.into_iter().map(|s| s[0]).collect(), stats)
        }
        IntegrationMethod::Rk4 => fixed_step(&cell, initial_temperature, times, settings.fixed_step)?,
    };
    debug!(
        method = ?settings.method,
        steps = stats.accepted,
        rejected = stats.rejected,
        "forward simulation finished"
    );

    Ok(SimulatedTrajectory {
        times: times.to_vec(),
        temperatures,
        steps: stats.accepted,
        rejected_steps: stats.rejected,
    })
}

fn fixed_step(
    cell: &InsulatedCell,
    initial_temperature: f64,
    times: &[f64],
    max_step: f64,
) -> Result<(Vec<f64>, StepStats), SimulationError> {
    if !(max_step > 0.0 && max_step.is_finite()) {
        return Err(SimulationError::Setup {
            what: format!("fixed_step must be positive, got {max_step}"),
        });
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(SimulationError::Setup {
            what: "output times must be ascending".to_string(),
        });
    }
    let mut solver = RK4::<f64>::new(1);
    let mut stats = StepStats::default();
    let mut t = times[0];
    let mut state = [initial_temperature];
    let mut out = Vec::with_capacity(times.len());
    for &target in times {
        let span = target - t;
        if span > 0.0 {
            let steps = (span / max_step).ceil() as usize;
            let dt = span / steps as f64;
            for _ in 0..steps {
                solver.step(cell, &mut t, &mut state, dt);
            }
            stats.accepted += steps;
            t = target;
        }
        if !state[0].is_finite() {
            return Err(SimulationError::NonFiniteState { t });
        }
        out.push(state[0]);
    }
    Ok((out, stats))
}

/// Agreement between a transcribed trajectory and a forward integration
/// through the same times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub simulated_final_temperature: f64,
    pub transcribed_final_temperature: f64,
    pub final_difference: f64,
    pub max_difference: f64,
    pub tolerance: f64,
    pub passed: bool,
}

/// Re-integrates from the first transcribed temperature and compares at every
/// transcribed time.
pub fn verify(
    params: &PhysicalParameters,
    times: &[f64],
    temperatures: &[f64],
    settings: &SimulationSettings,
) -> Result<Verification, SimulationError> {
    if times.len() != temperatures.len() || times.is_empty() {
        return Err(SimulationError::Setup {
            what: format!(
                "need matching, non-empty times and temperatures ({} vs {})",
                times.len(),
                temperatures.len()
            ),
        });
    }
    let simulated = simulate(params, temperatures[0], times, settings)?;
    let max_difference = simulated
        .temperatures
        .iter()
        .zip(temperatures)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    let last = temperatures.len() - 1;
    let simulated_final = simulated.temperatures[last];
    let final_difference = (simulated_final - temperatures[last]).abs();
    Ok(Verification {
        simulated_final_temperature: simulated_final,
        transcribed_final_temperature: temperatures[last],
        final_difference,
        max_difference,
        tolerance: settings.verification_tolerance,
        passed: max_difference <= settings.verification_tolerance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// T(t) = Th − (Th − T0)·exp(−λ t), λ = K·A / (d·m·Cp).
    fn analytic(params: &PhysicalParameters, t0: f64, t: f64) -> f64 {
        let lambda = params.conductivity * params.area
            / (params.thickness * params.mass * params.specific_heat);
        params.hot_temperature - (params.hot_temperature - t0) * (-lambda * t).exp()
    }

    #[test]
    fn adaptive_run_matches_closed_form() {
        let params = PhysicalParameters::default().with_thickness(0.002);
        let times = sample_times(0.0, 45.0, 10);
        let run = simulate(&params, 293.15, &times, &SimulationSettings::default())
            .expect("simulation should succeed");
        for (t, temp) in run.times.iter().zip(&run.temperatures) {
            assert!((temp - analytic(&params, 293.15, *t)).abs() < 1e-8, "t = {t}");
        }
        assert!(run.final_temperature().expect("final") > 293.15);
    }

    #[test]
    fn rk4_run_matches_closed_form() {
        let params = PhysicalParameters::default();
        let settings = SimulationSettings {
            method: IntegrationMethod::Rk4,
            fixed_step: 0.5,
            ..SimulationSettings::default()
        };
        let times = sample_times(0.0, 45.0, 4);
        let run = simulate(&params, 293.15, &times, &settings).expect("simulation should succeed");
        assert_eq!(run.steps, 90);
        let exact = analytic(&params, 293.15, 45.0);
        assert!((run.final_temperature().expect("final") - exact).abs() < 1e-6);
    }

    #[test]
    fn zero_thickness_is_a_setup_error() {
        let params = PhysicalParameters::default().with_thickness(0.0);
        let err = simulate(&params, 293.15, &[0.0, 1.0], &SimulationSettings::default())
            .expect_err("thickness must be positive");
        assert!(matches!(err, SimulationError::Setup { .. }));
    }

    #[test]
    fn verify_flags_mismatch() {
        let params = PhysicalParameters::default();
        let times = sample_times(0.0, 45.0, 5);
        let exact: Vec<f64> = times.iter().map(|t| analytic(&params, 293.15, *t)).collect();
        let settings = SimulationSettings::default();

        let good = verify(&params, &times, &exact, &settings).expect("verify");
        assert!(good.passed);
        assert!(good.final_difference < 1e-8);

        let mut shifted = exact.clone();
        shifted[4] += 0.01;
        let bad = verify(&params, &times, &shifted, &settings).expect("verify");
        assert!(!bad.passed);
        assert!((bad.max_difference - 0.01).abs() < 1e-6);
    }

    #[test]
    fn sample_times_are_evenly_spaced() {
        assert_eq!(sample_times(0.0, 45.0, 4), vec![0.0, 15.0, 30.0, 45.0]);
        assert_eq!(sample_times(2.0, 45.0, 1), vec![2.0]);
        assert!(sample_times(0.0, 1.0, 0).is_empty());
    }
}
