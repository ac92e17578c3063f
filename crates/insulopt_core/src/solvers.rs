use crate::error::SimulationError;
use crate::traits::{DynamicalSystem, Scalar, Steppable};
use serde::{Deserialize, Serialize};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = T::constant(0.5);
        let sixth = T::constant(1.0 / 6.0);
        let two = T::constant(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

// Tsitouras (2011) 5(4) tableau.
const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];
const TSIT5_A: [[f64; 6]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.161, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0, 0.0],
    [2.897153057105493, -6.359448489975075, 4.3622954328695815, 0.0, 0.0, 0.0],
    [
        5.325864828439257,
        -11.748883564062828,
        7.4955393428898365,
        -0.09249506636175525,
        0.0,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.028269050394068383,
        0.0,
    ],
];
const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436081,
    2.324710524099774,
];
// b - b_hat, the seventh entry weights the FSAL stage f(t + dt, y_new).
const TSIT5_BTILDE: [f64; 7] = [
    -0.00178001105222577714,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    0.015151515151515152,
];

/// Tsitouras 5/4 Solver
pub struct Tsit5<T: Scalar> {
    k: [Vec<T>; 7],
    tmp: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![T::zero(); dim]),
            tmp: vec![T::zero(); dim],
        }
    }

    fn stages(&mut self, system: &impl DynamicalSystem<T>, t0: T, state: &[T], dt: T) {
        system.apply(t0, state, &mut self.k[0]);
        for s in 1..6 {
            for i in 0..state.len() {
                let mut acc = T::zero();
                for j in 0..s {
                    acc = acc + T::constant(TSIT5_A[s][j]) * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            system.apply(t0 + T::constant(TSIT5_C[s]) * dt, &self.tmp, &mut self.k[s]);
        }
    }

    fn advance(&self, state: &mut [T], dt: T) {
        for i in 0..state.len() {
            let mut acc = T::zero();
            for s in 0..6 {
                acc = acc + T::constant(TSIT5_B[s]) * self.k[s][i];
            }
            state[i] = state[i] + dt * acc;
        }
    }

    /// Takes one step and writes the embedded 4th order error estimate into
    /// `error` (same units as the state).
    pub fn step_with_error(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
        error: &mut [T],
    ) {
        let t0 = *t;
        self.stages(system, t0, state, dt);
        self.advance(state, dt);
        system.apply(t0 + dt, state, &mut self.k[6]);
        for i in 0..state.len() {
            let mut acc = T::zero();
            for s in 0..7 {
                acc = acc + T::constant(TSIT5_BTILDE[s]) * self.k[s][i];
            }
            error[i] = dt * acc;
        }
        *t = t0 + dt;
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;
        self.stages(system, t0, state, dt);
        self.advance(state, dt);
        *t = t0 + dt;
    }
}

/// Step-size controller and tolerances for [`integrate_adaptive`].
///
/// h_new = safety * h * error^(-1/5), clamped to [min_factor, max_factor].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveSettings {
    pub rtol: f64,
    pub atol: f64,
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: Option<f64>,
    pub max_steps: usize,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-10,
            atol: 1e-10,
            initial_step: 1e-2,
            min_step: 1e-12,
            max_step: None,
            max_steps: 100_000,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 5.0,
        }
    }
}

impl AdaptiveSettings {
    fn factor(&self, error: f64) -> f64 {
        if error == 0.0 {
            return self.max_factor;
        }
        (self.safety * error.powf(-0.2)).clamp(self.min_factor, self.max_factor)
    }

    fn validate(&self) -> Result<(), SimulationError> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(SimulationError::Setup {
                    what: format!("{name} must be positive, got {v}"),
                })
            }
        };
        positive("rtol", self.rtol)?;
        positive("atol", self.atol)?;
        positive("initial_step", self.initial_step)?;
        positive("min_step", self.min_step)?;
        if let Some(max_step) = self.max_step {
            positive("max_step", max_step)?;
        }
        if self.max_steps == 0 {
            return Err(SimulationError::Setup {
                what: "max_steps must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Accepted/rejected step counts of an adaptive run.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StepStats {
    pub accepted: usize,
    pub rejected: usize,
}

/// Integrates forward from `(t0, y0)` with adaptive Tsit5 and returns the
/// state at every entry of `output_times` (ascending, all >= t0). Steps are
/// shortened to land on each output time exactly.
pub fn integrate_adaptive<S: DynamicalSystem<f64>>(
    system: &S,
    t0: f64,
    y0: &[f64],
    output_times: &[f64],
    settings: &AdaptiveSettings,
) -> Result<(Vec<Vec<f64>>, StepStats), SimulationError> {
    settings.validate()?;
    let dim = system.dimension();
    if y0.len() != dim {
        return Err(SimulationError::Setup {
            what: format!("initial state has {} entries, system has {dim}", y0.len()),
        });
    }
    if output_times.iter().any(|&t| t < t0 || !t.is_finite())
        || output_times.windows(2).any(|w| w[1] < w[0])
    {
        return Err(SimulationError::Setup {
            what: "output times must be finite, ascending and not before t0".to_string(),
        });
    }

    let mut solver = Tsit5::<f64>::new(dim);
    let mut stats = StepStats::default();
    let mut t = t0;
    let mut y = y0.to_vec();
    let mut trial = vec![0.0; dim];
    let mut error = vec![0.0; dim];
    let mut h = settings.initial_step;
    let mut outputs = Vec::with_capacity(output_times.len());
    let max_step = settings.max_step.unwrap_or(f64::INFINITY);

    for &target in output_times {
        while target - t > settings.min_step * (1.0 + t.abs()) {
            if stats.accepted + stats.rejected >= settings.max_steps {
                return Err(SimulationError::TooManySteps {
                    max_steps: settings.max_steps,
                    t,
                });
            }
            let dt = h.min(max_step).min(target - t);
            let mut t_trial = t;
            trial.copy_from_slice(&y);
            solver.step_with_error(system, &mut t_trial, &mut trial, dt, &mut error);

            let err = error
                .iter()
                .zip(&trial)
                .zip(&y)
                .map(|((e, new), old)| {
                    e.abs() / (settings.atol + settings.rtol * new.abs().max(old.abs()))
                })
                .fold(0.0, f64::max);

            let factor = if err.is_finite() {
                settings.factor(err)
            } else {
                settings.min_factor
            };
            if err <= 1.0 {
                if trial.iter().any(|v| !v.is_finite()) {
                    return Err(SimulationError::NonFiniteState { t: t_trial });
                }
                stats.accepted += 1;
                // Landing exactly on the target avoids drift from t + dt rounding.
                t = if dt == target - t { target } else { t_trial };
                y.copy_from_slice(&trial);
                h = if dt < h {
                    // Clipped by the output time; keep the unclipped proposal.
                    h.max(dt * factor)
                } else {
                    dt * factor
                };
            } else {
                stats.rejected += 1;
                h = dt * factor;
                if h < settings.min_step {
                    return Err(SimulationError::StepSizeUnderflow { t, step: h });
                }
            }
        }
        outputs.push(y.clone());
    }
    Ok((outputs, stats))
}
