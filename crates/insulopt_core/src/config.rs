//! Problem configuration. Every section has defaults reproducing the
//! reference problem, so a YAML file only needs the fields it changes.

use crate::dynamics::PhysicalParameters;
use crate::simulate::SimulationSettings;
use crate::sqp::SqpSettings;
use crate::transcription::TranscriptionConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeOptions {
    pub t_initial: f64,
    pub t_duration: f64,
    pub fix_initial: bool,
    pub fix_duration: bool,
    /// Bounds on `t_initial` when it is free.
    pub initial_bounds: Option<[f64; 2]>,
    /// Bounds on `t_duration` when it is free.
    pub duration_bounds: Option<[f64; 2]>,
    pub initial_reference: f64,
    pub duration_reference: f64,
}

impl Default for TimeOptions {
    fn default() -> Self {
        Self {
            t_initial: 0.0,
            t_duration: 45.0,
            fix_initial: true,
            fix_duration: true,
            initial_bounds: None,
            duration_bounds: None,
            initial_reference: 1.0,
            duration_reference: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateOptions {
    /// Initial cold-side temperature, K.
    pub initial: f64,
    /// Pin the first state node to `initial`.
    pub fix_initial: bool,
    /// End value of the linear initial guess.
    pub final_guess: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    /// Scale of the state variables and boundary rows.
    pub reference: f64,
    /// Scale of the defect rows.
    pub defect_reference: f64,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            initial: 293.15,
            fix_initial: true,
            final_guess: 333.15,
            lower: None,
            upper: None,
            reference: 333.15,
            defect_reference: 333.15,
        }
    }
}

/// Bounds and scaling of the design parameter `d`. Its starting value is
/// `physics.thickness`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThicknessOptions {
    pub lower: f64,
    pub upper: f64,
    pub reference: f64,
}

impl Default for ThicknessOptions {
    fn default() -> Self {
        Self {
            lower: 0.001,
            upper: 0.5,
            reference: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryLocation {
    Initial,
    Final,
}

/// Bound on the temperature at the first or last state node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConstraint {
    pub location: BoundaryLocation,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl BoundaryConstraint {
    pub fn final_between(lower: f64, upper: f64) -> Self {
        Self {
            location: BoundaryLocation::Final,
            lower: Some(lower),
            upper: Some(upper),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveOptions {
    pub reference: f64,
}

impl Default for ObjectiveOptions {
    fn default() -> Self {
        Self { reference: 0.01 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProblemConfig {
    pub physics: PhysicalParameters,
    pub transcription: TranscriptionConfig,
    pub time: TimeOptions,
    pub state: StateOptions,
    pub thickness: ThicknessOptions,
    pub boundary_constraints: Vec<BoundaryConstraint>,
    pub objective: ObjectiveOptions,
    pub solver: SqpSettings,
    pub simulation: SimulationSettings,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            physics: PhysicalParameters::default(),
            transcription: TranscriptionConfig::default(),
            time: TimeOptions::default(),
            state: StateOptions::default(),
            thickness: ThicknessOptions::default(),
            boundary_constraints: vec![BoundaryConstraint::final_between(293.15, 333.15)],
            objective: ObjectiveOptions::default(),
            solver: SqpSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl ProblemConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("In {}", path.display()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Replaces the upper bound of every final-temperature constraint.
    pub fn with_final_upper_bound(mut self, upper: f64) -> Self {
        for bc in &mut self.boundary_constraints {
            if bc.location == BoundaryLocation::Final {
                bc.upper = Some(upper);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.physics;
        for (name, value) in [
            ("physics.conductivity", p.conductivity),
            ("physics.area", p.area),
            ("physics.thickness", p.thickness),
            ("physics.mass", p.mass),
            ("physics.specific_heat", p.specific_heat),
        ] {
            require_positive(name, value)?;
        }
        if !p.hot_temperature.is_finite() {
            bail!("physics.hot_temperature must be finite.");
        }

        require_positive("time.t_duration", self.time.t_duration)?;
        if !self.time.t_initial.is_finite() {
            bail!("time.t_initial must be finite.");
        }
        require_positive("time.initial_reference", self.time.initial_reference)?;
        require_positive("time.duration_reference", self.time.duration_reference)?;
        if let Some([lo, hi]) = self.time.initial_bounds {
            require_ordered("time.initial_bounds", Some(lo), Some(hi))?;
        }
        if let Some([lo, hi]) = self.time.duration_bounds {
            require_ordered("time.duration_bounds", Some(lo), Some(hi))?;
            if hi <= 0.0 {
                bail!("time.duration_bounds must admit a positive duration.");
            }
        }

        require_positive("state.reference", self.state.reference)?;
        require_positive("state.defect_reference", self.state.defect_reference)?;
        require_ordered("state bounds", self.state.lower, self.state.upper)?;

        let d = &self.thickness;
        require_positive("thickness.lower", d.lower)?;
        require_positive("thickness.reference", d.reference)?;
        require_ordered("thickness bounds", Some(d.lower), Some(d.upper))?;

        require_positive("objective.reference", self.objective.reference)?;

        for (i, bc) in self.boundary_constraints.iter().enumerate() {
            if bc.lower.is_none() && bc.upper.is_none() {
                bail!("boundary_constraints[{i}] needs a lower or an upper bound.");
            }
            require_ordered(&format!("boundary_constraints[{i}]"), bc.lower, bc.upper)?;
        }
        self.solver.validate()
    }
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value.is_finite()) {
        bail!("{name} must be positive, got {value}.");
    }
    Ok(())
}

fn require_ordered(name: &str, lower: Option<f64>, upper: Option<f64>) -> Result<()> {
    if let (Some(lo), Some(hi)) = (lower, upper) {
        if lo.is_nan() || hi.is_nan() || lo > hi {
            bail!("{name}: lower bound {lo} exceeds upper bound {hi}.");
        }
    }
    Ok(())
}
