//! The insulation-thickness NLP: Gauss-Lobatto defects of the thermal model,
//! an initial pin, boundary bounds on the temperature and `min d`.

use super::layout::{ConstraintLayout, DesignLayout};
use super::problem::{Bounds, JacobianStructure, NlpProblem};
use crate::config::{
    BoundaryConstraint, BoundaryLocation, ObjectiveOptions, ProblemConfig, StateOptions,
    ThicknessOptions, TimeOptions,
};
use crate::dynamics::{NodeInputs, OdeInput, OdePartials, PhysicalParameters, ThermalOde};
use crate::error::{EvalError, TranscriptionError};
use crate::transcription::{GaussLobatto, NodeSubset};
use nalgebra::DVector;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone)]
struct Workspace {
    disc_inputs: NodeInputs,
    col_inputs: NodeInputs,
    disc_rates: Vec<f64>,
    col_values: Vec<f64>,
    col_rates: Vec<f64>,
    col_dynamics: Vec<f64>,
    disc_partials: OdePartials,
    col_partials: OdePartials,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    thickness: f64,
    t_initial: f64,
    t_duration: f64,
}

#[derive(Debug, Clone)]
pub struct InsulationProblem {
    physics: PhysicalParameters,
    transcription: GaussLobatto,
    time: TimeOptions,
    state: StateOptions,
    thickness: ThicknessOptions,
    boundary: Vec<BoundaryConstraint>,
    objective: ObjectiveOptions,
    design: DesignLayout,
    rows: ConstraintLayout,
    structure: JacobianStructure,
    disc_ode: ThermalOde,
    col_ode: ThermalOde,
    work: Workspace,
}

/// Optimized trajectory sampled at the transcription nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscribedSolution {
    pub thickness: f64,
    pub t_initial: f64,
    pub t_duration: f64,
    pub state_times: Vec<f64>,
    pub state_temperatures: Vec<f64>,
    pub state_rates: Vec<f64>,
    pub collocation_times: Vec<f64>,
    pub collocation_temperatures: Vec<f64>,
    pub collocation_rates: Vec<f64>,
    pub defects: Vec<f64>,
    pub timeseries: Timeseries,
}

impl TranscribedSolution {
    pub fn final_temperature(&self) -> f64 {
        self.state_temperatures[self.state_temperatures.len() - 1]
    }
}

/// State and collocation nodes merged in time order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeseries {
    pub time: Vec<f64>,
    pub temperature: Vec<f64>,
}

impl InsulationProblem {
    /// Builds the transcription and the sparsity pattern. The configuration is
    /// assumed validated (see [`ProblemConfig::validate`]); a malformed
    /// transcription is rejected here.
    pub fn new(config: &ProblemConfig) -> Result<Self, TranscriptionError> {
        let transcription = GaussLobatto::from_config(&config.transcription)?;
        let num_state = transcription.num_state_nodes();
        let num_col = transcription.num_collocation_nodes();
        let design = DesignLayout::new(
            num_state,
            !config.time.fix_initial,
            !config.time.fix_duration,
        );
        let rows = ConstraintLayout::new(
            num_col,
            config.state.fix_initial,
            config.boundary_constraints.len(),
        );
        let structure = build_structure(&transcription, &design, &rows, &config.boundary_constraints);
        debug!(
            segments = transcription.num_segments(),
            order = transcription.order(),
            variables = design.len(),
            constraints = rows.len(),
            nnz = structure.nnz(),
            "built insulation problem"
        );

        let physics = config.physics;
        let work = Workspace {
            disc_inputs: NodeInputs::broadcast(&physics, &vec![0.0; num_state]),
            col_inputs: NodeInputs::broadcast(&physics, &vec![0.0; num_col]),
            disc_rates: vec![0.0; num_state],
            col_values: vec![0.0; num_col],
            col_rates: vec![0.0; num_col],
            col_dynamics: vec![0.0; num_col],
            disc_partials: OdePartials::new(num_state),
            col_partials: OdePartials::new(num_col),
        };

        Ok(Self {
            physics,
            transcription,
            time: config.time,
            state: config.state,
            thickness: config.thickness,
            boundary: config.boundary_constraints.clone(),
            objective: config.objective,
            design,
            rows,
            structure,
            disc_ode: ThermalOde::new(num_state),
            col_ode: ThermalOde::new(num_col),
            work,
        })
    }

    pub fn transcription(&self) -> &GaussLobatto {
        &self.transcription
    }

    pub fn design_layout(&self) -> &DesignLayout {
        &self.design
    }

    pub fn constraint_layout(&self) -> &ConstraintLayout {
        &self.rows
    }

    /// Physical parameters with the thickness taken from `x`.
    pub fn physics_at(&self, x: &DVector<f64>) -> PhysicalParameters {
        self.physics.with_thickness(self.unpack(x).thickness)
    }

    /// Packs node temperatures and a thickness into a design vector, using the
    /// configured times for any free time variable.
    pub fn design_vector(&self, temperatures: &[f64], thickness: f64) -> DVector<f64> {
        assert_eq!(
            temperatures.len(),
            self.transcription.num_state_nodes(),
            "expected one temperature per state node"
        );
        let mut x = DVector::zeros(self.design.len());
        x.as_mut_slice()[self.design.states()].copy_from_slice(temperatures);
        x[self.design.thickness()] = thickness;
        if let Some(i) = self.design.t_initial() {
            x[i] = self.time.t_initial;
        }
        if let Some(i) = self.design.t_duration() {
            x[i] = self.time.t_duration;
        }
        x
    }

    fn unpack(&self, x: &DVector<f64>) -> Point {
        assert_eq!(
            x.len(),
            self.design.len(),
            "design vector has {} entries, problem has {} variables",
            x.len(),
            self.design.len()
        );
        Point {
            thickness: x[self.design.thickness()],
            t_initial: self.design.t_initial().map_or(self.time.t_initial, |i| x[i]),
            t_duration: self.design.t_duration().map_or(self.time.t_duration, |i| x[i]),
        }
    }

    /// Runs the model at every state and collocation node.
    fn evaluate(&mut self, x: &DVector<f64>) -> Result<Point, EvalError> {
        let point = self.unpack(x);
        if !(point.t_duration > 0.0 && point.t_duration.is_finite()) {
            return Err(EvalError::NonPositive {
                name: "t_duration",
                value: point.t_duration,
            });
        }
        let temps = &x.as_slice()[self.design.states()];
        let w = &mut self.work;

        w.disc_inputs
            .get_mut(OdeInput::Temperature)
            .copy_from_slice(temps);
        w.disc_inputs.fill(OdeInput::Thickness, point.thickness);
        w.disc_inputs.validate()?;
        self.disc_ode.compute(&w.disc_inputs, &mut w.disc_rates);

        self.transcription.collocation_values(
            temps,
            &w.disc_rates,
            point.t_duration,
            &mut w.col_values,
            &mut w.col_rates,
        );

        w.col_inputs
            .get_mut(OdeInput::Temperature)
            .copy_from_slice(&w.col_values);
        w.col_inputs.fill(OdeInput::Thickness, point.thickness);
        w.col_inputs.validate()?;
        self.col_ode.compute(&w.col_inputs, &mut w.col_dynamics);

        if let Some(node) = w
            .col_rates
            .iter()
            .zip(&w.col_dynamics)
            .position(|(a, b)| !(a - b).is_finite())
        {
            return Err(EvalError::NonFinite {
                what: "defect",
                node,
            });
        }
        Ok(point)
    }

    fn boundary_node(&self, location: BoundaryLocation) -> usize {
        match location {
            BoundaryLocation::Initial => self.design.state(0),
            BoundaryLocation::Final => self.design.final_state(),
        }
    }

    /// Trajectory, defects and timeseries at `x`.
    pub fn solution(&mut self, x: &DVector<f64>) -> Result<TranscribedSolution, EvalError> {
        let point = self.evaluate(x)?;
        let tx = &self.transcription;
        let w = &self.work;
        let state_temperatures = x.as_slice()[self.design.states()].to_vec();
        let defects: Vec<f64> = w
            .col_rates
            .iter()
            .zip(&w.col_dynamics)
            .map(|(a, b)| a - b)
            .collect();

        let mut series_temperature =
            Vec::with_capacity(tx.num_state_nodes() + tx.num_collocation_nodes());
        for seg in 0..tx.num_segments() {
            let disc = tx.segment_state_indices(seg);
            let col = tx.segment_collocation_indices(seg);
            for local in usize::from(seg > 0)..tx.order() {
                let value = if local % 2 == 0 {
                    state_temperatures[disc.start + local / 2]
                } else {
                    w.col_values[col.start + local / 2]
                };
                series_temperature.push(value);
            }
        }

        Ok(TranscribedSolution {
            thickness: point.thickness,
            t_initial: point.t_initial,
            t_duration: point.t_duration,
            state_times: tx.node_times(NodeSubset::StateInput, point.t_initial, point.t_duration),
            state_temperatures,
            state_rates: w.disc_rates.clone(),
            collocation_times: tx.node_times(NodeSubset::Collocation, point.t_initial, point.t_duration),
            collocation_temperatures: w.col_values.clone(),
            collocation_rates: w.col_rates.clone(),
            defects,
            timeseries: Timeseries {
                time: tx.node_times(NodeSubset::All, point.t_initial, point.t_duration),
                temperature: series_temperature,
            },
        })
    }
}

fn build_structure(
    tx: &GaussLobatto,
    design: &DesignLayout,
    rows: &ConstraintLayout,
    boundary: &[BoundaryConstraint],
) -> JacobianStructure {
    let mut r = Vec::new();
    let mut c = Vec::new();
    for seg in 0..tx.num_segments() {
        for row in tx.segment_collocation_indices(seg) {
            for node in tx.segment_state_indices(seg) {
                r.push(row);
                c.push(design.state(node));
            }
            r.push(row);
            c.push(design.thickness());
            if let Some(col) = design.t_duration() {
                r.push(row);
                c.push(col);
            }
        }
    }
    if let Some(row) = rows.initial_pin() {
        r.push(row);
        c.push(design.state(0));
    }
    for (i, bc) in boundary.iter().enumerate() {
        r.push(rows.boundary(i));
        c.push(match bc.location {
            BoundaryLocation::Initial => design.state(0),
            BoundaryLocation::Final => design.final_state(),
        });
    }
    JacobianStructure::new(rows.len(), design.len(), r, c)
}

impl NlpProblem for InsulationProblem {
    fn num_variables(&self) -> usize {
        self.design.len()
    }

    fn num_constraints(&self) -> usize {
        self.rows.len()
    }

    fn variable_bounds(&self) -> Bounds {
        let mut bounds = Bounds::unbounded(self.design.len());
        for i in self.design.states() {
            bounds.set(i, self.state.lower, self.state.upper);
        }
        bounds.set(
            self.design.thickness(),
            Some(self.thickness.lower),
            Some(self.thickness.upper),
        );
        if let Some(i) = self.design.t_initial() {
            let [lo, hi] = self
                .time
                .initial_bounds
                .unwrap_or([f64::NEG_INFINITY, f64::INFINITY]);
            bounds.set(i, Some(lo), Some(hi));
        }
        if let Some(i) = self.design.t_duration() {
            let [lo, hi] = self.time.duration_bounds.unwrap_or([0.0, f64::INFINITY]);
            bounds.set(i, Some(lo.max(0.0)), Some(hi));
        }
        bounds
    }

    fn constraint_bounds(&self) -> Bounds {
        let mut bounds = Bounds::unbounded(self.rows.len());
        for row in self.rows.defects() {
            bounds.set_equal(row, 0.0);
        }
        if let Some(row) = self.rows.initial_pin() {
            bounds.set_equal(row, self.state.initial);
        }
        for (i, bc) in self.boundary.iter().enumerate() {
            bounds.set(self.rows.boundary(i), bc.lower, bc.upper);
        }
        bounds
    }

    fn variable_scales(&self) -> Vec<f64> {
        let mut scales = vec![self.state.reference; self.design.len()];
        scales[self.design.thickness()] = self.thickness.reference;
        if let Some(i) = self.design.t_initial() {
            scales[i] = self.time.initial_reference;
        }
        if let Some(i) = self.design.t_duration() {
            scales[i] = self.time.duration_reference;
        }
        scales
    }

    fn constraint_scales(&self) -> Vec<f64> {
        let mut scales = vec![self.state.reference; self.rows.len()];
        for row in self.rows.defects() {
            scales[row] = self.state.defect_reference;
        }
        scales
    }

    fn objective_scale(&self) -> f64 {
        self.objective.reference
    }

    fn initial_guess(&self) -> DVector<f64> {
        let temps = self.transcription.interpolate_linear(
            [self.state.initial, self.state.final_guess],
            NodeSubset::StateInput,
        );
        self.design_vector(&temps, self.physics.thickness)
    }

    fn objective(&mut self, x: &DVector<f64>) -> Result<f64, EvalError> {
        let point = self.unpack(x);
        if !point.thickness.is_finite() {
            return Err(EvalError::NonFinite {
                what: "thickness",
                node: 0,
            });
        }
        Ok(point.thickness)
    }

    fn objective_gradient(
        &mut self,
        x: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), EvalError> {
        self.unpack(x);
        out.fill(0.0);
        out[self.design.thickness()] = 1.0;
        Ok(())
    }

    fn constraints(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), EvalError> {
        self.evaluate(x)?;
        assert_eq!(out.len(), self.rows.len(), "constraint buffer length mismatch");
        let w = &self.work;
        for (row, (rate, dynamics)) in self.rows.defects().zip(w.col_rates.iter().zip(&w.col_dynamics)) {
            out[row] = rate - dynamics;
        }
        if let Some(row) = self.rows.initial_pin() {
            out[row] = x[self.design.state(0)];
        }
        for (i, bc) in self.boundary.iter().enumerate() {
            out[self.rows.boundary(i)] = x[self.boundary_node(bc.location)];
        }
        Ok(())
    }

    fn jacobian_structure(&self) -> &JacobianStructure {
        &self.structure
    }

    fn jacobian_values(&mut self, x: &DVector<f64>, values: &mut [f64]) -> Result<(), EvalError> {
        let point = self.evaluate(x)?;
        assert_eq!(values.len(), self.structure.nnz(), "Jacobian buffer length mismatch");
        let w = &mut self.work;
        self.disc_ode.compute_partials(&w.disc_inputs, &mut w.disc_partials);
        self.col_ode.compute_partials(&w.col_inputs, &mut w.col_partials);

        let tx = &self.transcription;
        let m = tx.matrices();
        let temps = &x.as_slice()[self.design.states()];
        let free_duration = self.design.t_duration().is_some();
        let ft_disc = w.disc_partials.get(OdeInput::Temperature);
        let fd_disc = w.disc_partials.get(OdeInput::Thickness);
        let ft_col = w.col_partials.get(OdeInput::Temperature);
        let fd_col = w.col_partials.get(OdeInput::Thickness);

        let mut idx = 0;
        for seg in 0..tx.num_segments() {
            let disc = tx.segment_state_indices(seg);
            let phi = tx.grid().fraction(seg);
            let h = phi * point.t_duration;
            let x_d = &temps[disc.clone()];
            let f_d = &w.disc_rates[disc.clone()];
            let ft_d = &ft_disc[disc.clone()];
            let fd_d = &fd_disc[disc];

            for (k, row) in tx.segment_collocation_indices(seg).enumerate() {
                let ft_c = ft_col[row];
                let fd_c = fd_col[row];
                let mut bd_fd = 0.0;
                let mut bi_fd = 0.0;
                let mut ad_x = 0.0;
                let mut bi_f = 0.0;
                for j in 0..x_d.len() {
                    let (ai, bi, ad, bd) = (m.ai[(k, j)], m.bi[(k, j)], m.ad[(k, j)], m.bd[(k, j)]);
                    // d(xdot_c)/dx_j - f_T(x_c) * d(x_c)/dx_j
                    values[idx] = ad / h + bd * ft_d[j] - ft_c * (ai + h * bi * ft_d[j]);
                    idx += 1;
                    bd_fd += bd * fd_d[j];
                    bi_fd += bi * fd_d[j];
                    ad_x += ad * x_d[j];
                    bi_f += bi * f_d[j];
                }
                values[idx] = bd_fd - fd_c - ft_c * h * bi_fd;
                idx += 1;
                if free_duration {
                    values[idx] = -phi / (h * h) * ad_x - ft_c * phi * bi_f;
                    idx += 1;
                }
            }
        }
        if self.rows.initial_pin().is_some() {
            values[idx] = 1.0;
            idx += 1;
        }
        for _ in &self.boundary {
            values[idx] = 1.0;
            idx += 1;
        }
        debug_assert_eq!(idx, values.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlp::check::check_jacobian;

    fn problem(config: &ProblemConfig) -> InsulationProblem {
        InsulationProblem::new(config).expect("problem should build")
    }

    /// Closed-form T(t) for a fixed thickness.
    fn exact_temperatures(p: &InsulationProblem, thickness: f64) -> Vec<f64> {
        let physics = p.physics.with_thickness(thickness);
        let lambda = physics.conductivity * physics.area
            / (physics.thickness * physics.mass * physics.specific_heat);
        p.transcription
            .node_times(NodeSubset::StateInput, 0.0, 45.0)
            .iter()
            .map(|t| {
                physics.hot_temperature - (physics.hot_temperature - 293.15) * (-lambda * t).exp()
            })
            .collect()
    }

    #[test]
    fn sizes_follow_transcription() {
        let p = problem(&ProblemConfig::default());
        assert_eq!(p.num_variables(), 22);
        assert_eq!(p.num_constraints(), 22);
        // Each defect row touches two state nodes and d.
        assert_eq!(p.jacobian_structure().nnz(), 20 * 3 + 2);
    }

    #[test]
    fn defect_rows_only_touch_their_segment() {
        let mut config = ProblemConfig::default();
        config.transcription.num_segments = 4;
        config.transcription.order = 5;
        let p = problem(&config);
        let tx = p.transcription();
        let s = p.jacobian_structure();
        for (&row, &col) in s.rows().iter().zip(s.cols()) {
            if row >= tx.num_collocation_nodes() {
                continue;
            }
            let seg = row / tx.collocation_nodes_per_segment();
            assert!(
                tx.segment_state_indices(seg).contains(&col) || col == p.design_layout().thickness(),
                "row {row} depends on column {col}"
            );
        }
    }

    #[test]
    fn initial_guess_interpolates_linearly() {
        let p = problem(&ProblemConfig::default());
        let x = p.initial_guess();
        assert!((x[0] - 293.15).abs() < 1e-12);
        assert!((x[20] - 333.15).abs() < 1e-12);
        assert!((x[10] - 313.15).abs() < 1e-12);
        assert_eq!(x[21], 0.001);
    }

    #[test]
    fn bounds_and_scales() {
        let p = problem(&ProblemConfig::default());
        let vb = p.variable_bounds();
        assert_eq!((vb.lower[21], vb.upper[21]), (0.001, 0.5));
        assert_eq!(vb.lower[3], f64::NEG_INFINITY);
        let cb = p.constraint_bounds();
        assert_eq!((cb.lower[0], cb.upper[0]), (0.0, 0.0));
        assert_eq!((cb.lower[20], cb.upper[20]), (293.15, 293.15));
        assert_eq!((cb.lower[21], cb.upper[21]), (293.15, 333.15));
        assert_eq!(p.variable_scales()[21], 0.01);
        assert_eq!(p.constraint_scales()[0], 333.15);
        assert_eq!(p.objective_scale(), 0.01);
    }

    #[test]
    fn exact_solution_has_vanishing_defects() {
        let mut p = problem(&ProblemConfig::default());
        let d = 0.0022;
        let x = p.design_vector(&exact_temperatures(&p, d), d);
        let mut c = DVector::zeros(p.num_constraints());
        p.constraints(&x, &mut c).expect("constraints should evaluate");
        for row in p.constraint_layout().defects() {
            assert!(c[row].abs() < 1e-9, "defect {row} = {}", c[row]);
        }
        assert!((c[20] - 293.15).abs() < 1e-12);
    }

    #[test]
    fn defects_shrink_with_refinement() {
        let worst = |segments: usize| {
            let mut config = ProblemConfig::default();
            config.transcription.num_segments = segments;
            // A thin layer makes the curvature visible.
            let mut p = problem(&config);
            let d = 1e-4;
            let x = p.design_vector(&exact_temperatures(&p, d), d);
            let mut c = DVector::zeros(p.num_constraints());
            p.constraints(&x, &mut c).expect("constraints should evaluate");
            p.constraint_layout()
                .defects()
                .map(|r| c[r].abs())
                .fold(0.0, f64::max)
        };
        let coarse = worst(5);
        let fine = worst(10);
        assert!(fine < coarse / 4.0, "coarse {coarse}, fine {fine}");
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let mut p = problem(&ProblemConfig::default());
        let mut x = p.initial_guess();
        x[21] = 0.003;
        let check = check_jacobian(&mut p, &x, 1e-6).expect("check should evaluate");
        assert!(check.max_rel_error < 1e-6, "{check:?}");
        assert!(check.max_undeclared < 1e-8, "{check:?}");
    }

    #[test]
    fn jacobian_with_free_duration_matches_finite_differences() {
        let mut config = ProblemConfig::default();
        config.time.fix_duration = false;
        config.time.duration_bounds = Some([10.0, 100.0]);
        config.transcription.segment_ends = Some(vec![0.0, 1.0, 3.0, 4.0]);
        config.transcription.order = 5;
        let mut p = problem(&config);
        assert_eq!(p.design_layout().t_duration(), Some(8));
        let mut x = p.initial_guess();
        x[7] = 0.002;
        let check = check_jacobian(&mut p, &x, 1e-6).expect("check should evaluate");
        assert!(check.max_rel_error < 1e-6, "{check:?}");
        assert!(check.max_undeclared < 1e-8, "{check:?}");
        let bounds = p.variable_bounds();
        assert_eq!((bounds.lower[8], bounds.upper[8]), (10.0, 100.0));
    }

    #[test]
    fn non_positive_thickness_is_an_evaluation_error() {
        let mut p = problem(&ProblemConfig::default());
        let mut x = p.initial_guess();
        x[21] = 0.0;
        let mut c = DVector::zeros(p.num_constraints());
        assert_eq!(
            p.constraints(&x, &mut c),
            Err(EvalError::NonPositive {
                name: "d",
                value: 0.0
            })
        );
        let mut values = vec![0.0; p.jacobian_structure().nnz()];
        assert!(p.jacobian_values(&x, &mut values).is_err());
    }

    #[test]
    #[should_panic(expected = "design vector has 3 entries")]
    fn wrong_design_length_panics() {
        let mut p = problem(&ProblemConfig::default());
        let mut c = DVector::zeros(p.num_constraints());
        let _ = p.constraints(&DVector::zeros(3), &mut c);
    }

    #[test]
    fn even_order_is_rejected_at_construction() {
        let mut config = ProblemConfig::default();
        config.transcription.order = 4;
        assert_eq!(
            InsulationProblem::new(&config).map(|_| ()),
            Err(TranscriptionError::InvalidOrder { order: 4 })
        );
    }

    #[test]
    fn solution_merges_nodes_in_time_order() {
        let mut config = ProblemConfig::default();
        config.transcription.num_segments = 3;
        let mut p = problem(&config);
        let x = p.initial_guess();
        let sol = p.solution(&x).expect("solution should evaluate");
        assert_eq!(sol.state_times.len(), 4);
        assert_eq!(sol.collocation_times.len(), 3);
        assert_eq!(sol.timeseries.time.len(), 7);
        assert_eq!(sol.timeseries.temperature.len(), 7);
        assert!(sol.timeseries.time.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sol.timeseries.temperature[0], sol.state_temperatures[0]);
        assert_eq!(sol.timeseries.temperature[1], sol.collocation_temperatures[0]);
        assert_eq!(sol.timeseries.temperature[6], sol.final_temperature());
        assert_eq!(sol.defects.len(), 3);
    }
}
