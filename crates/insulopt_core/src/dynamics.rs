//! Lumped thermal model of a cold cell heated through an insulation layer.
//!
//! `Tdot = K·A·(Th − T) / (d·m·Cp)`, evaluated independently at every node.

use crate::autodiff::{derivative, Dual};
use crate::error::EvalError;
use crate::traits::{DynamicalSystem, Scalar};
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// Fixed physical constants plus the insulation thickness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalParameters {
    /// K, W/(m·K)
    pub conductivity: f64,
    /// A, m²
    pub area: f64,
    /// d, m
    pub thickness: f64,
    /// m, kg
    pub mass: f64,
    /// Cp, kJ/(kg·K)
    pub specific_heat: f64,
    /// Th, K
    pub hot_temperature: f64,
}

impl Default for PhysicalParameters {
    fn default() -> Self {
        Self {
            conductivity: 0.03,
            area: 0.102 * 0.0003,
            thickness: 0.001,
            mass: 0.06,
            specific_heat: 3.56,
            hot_temperature: 773.0,
        }
    }
}

impl PhysicalParameters {
    pub fn with_thickness(mut self, thickness: f64) -> Self {
        self.thickness = thickness;
        self
    }

    /// Pointwise rate at temperature `t`.
    pub fn rate(&self, temperature: f64) -> f64 {
        temperature_rate(
            self.conductivity,
            self.area,
            self.thickness,
            self.mass,
            self.specific_heat,
            self.hot_temperature,
            temperature,
        )
    }

    /// Thickness for which the cell warms from `initial` to exactly `target`
    /// in `duration`, from the closed-form solution
    /// `T(t) = Th − (Th − T0)·exp(−K·A·t / (d·m·Cp))`.
    ///
    /// `None` unless `initial < target < Th` and `duration > 0`.
    pub fn thickness_reaching(&self, initial: f64, target: f64, duration: f64) -> Option<f64> {
        let th = self.hot_temperature;
        if !(initial < target && target < th && duration > 0.0) {
            return None;
        }
        let ratio = ((th - initial) / (th - target)).ln();
        Some(self.conductivity * self.area * duration / (self.mass * self.specific_heat * ratio))
    }

    /// Checks the inputs the model divides by.
    pub fn check_divisors(&self) -> Result<(), EvalError> {
        check_positive("d", self.thickness)?;
        check_positive("m", self.mass)?;
        check_positive("Cp", self.specific_heat)
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), EvalError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(EvalError::NonPositive { name, value })
    }
}

/// Inputs of the thermal model, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OdeInput {
    Conductivity,
    Area,
    Thickness,
    Mass,
    SpecificHeat,
    HotTemperature,
    Temperature,
}

impl OdeInput {
    pub const ALL: [OdeInput; 7] = [
        OdeInput::Conductivity,
        OdeInput::Area,
        OdeInput::Thickness,
        OdeInput::Mass,
        OdeInput::SpecificHeat,
        OdeInput::HotTemperature,
        OdeInput::Temperature,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            OdeInput::Conductivity => "K",
            OdeInput::Area => "A",
            OdeInput::Thickness => "d",
            OdeInput::Mass => "m",
            OdeInput::SpecificHeat => "Cp",
            OdeInput::HotTemperature => "Th",
            OdeInput::Temperature => "T",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-node input arrays. Every input is a vector of length `num_nodes`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInputs {
    values: [Vec<f64>; 7],
}

impl NodeInputs {
    /// Broadcasts scalar parameters over the given node temperatures.
    pub fn broadcast(params: &PhysicalParameters, temperature: &[f64]) -> Self {
        let n = temperature.len();
        Self {
            values: [
                vec![params.conductivity; n],
                vec![params.area; n],
                vec![params.thickness; n],
                vec![params.mass; n],
                vec![params.specific_heat; n],
                vec![params.hot_temperature; n],
                temperature.to_vec(),
            ],
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.values[OdeInput::Temperature.index()].len()
    }

    pub fn get(&self, input: OdeInput) -> &[f64] {
        &self.values[input.index()]
    }

    pub fn get_mut(&mut self, input: OdeInput) -> &mut [f64] {
        &mut self.values[input.index()]
    }

    /// Overwrites one input at every node.
    pub fn fill(&mut self, input: OdeInput, value: f64) {
        self.values[input.index()].fill(value);
    }

    /// Rejects inputs the model is undefined for: non-positive divisors and
    /// non-finite temperatures.
    pub fn validate(&self) -> Result<(), EvalError> {
        for input in [OdeInput::Thickness, OdeInput::Mass, OdeInput::SpecificHeat] {
            for &value in self.get(input) {
                check_positive(input.symbol(), value)?;
            }
        }
        for (node, value) in self.get(OdeInput::Temperature).iter().enumerate() {
            if !value.is_finite() {
                return Err(EvalError::NonFinite {
                    what: "temperature",
                    node,
                });
            }
        }
        Ok(())
    }

    fn node(&self, i: usize) -> [f64; 7] {
        let mut out = [0.0; 7];
        for (slot, column) in out.iter_mut().zip(self.values.iter()) {
            *slot = column[i];
        }
        out
    }
}

impl Index<OdeInput> for NodeInputs {
    type Output = [f64];

    fn index(&self, input: OdeInput) -> &[f64] {
        self.get(input)
    }
}

/// Diagonal partials ∂Tdot/∂input, one value per node for every input.
#[derive(Debug, Clone, PartialEq)]
pub struct OdePartials {
    values: [Vec<f64>; 7],
}

impl OdePartials {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            values: std::array::from_fn(|_| vec![0.0; num_nodes]),
        }
    }

    pub fn get(&self, input: OdeInput) -> &[f64] {
        &self.values[input.index()]
    }
}

impl Index<OdeInput> for OdePartials {
    type Output = [f64];

    fn index(&self, input: OdeInput) -> &[f64] {
        self.get(input)
    }
}

/// Vectorized thermal model over a fixed number of nodes.
///
/// Nodes are independent, so every partial has diagonal sparsity.
/// Precondition: `d`, `m`, `Cp` strictly positive (see [`NodeInputs::validate`]).
#[derive(Debug, Clone)]
pub struct ThermalOde {
    num_nodes: usize,
}

impl ThermalOde {
    pub fn new(num_nodes: usize) -> Self {
        Self { num_nodes }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn compute(&self, inputs: &NodeInputs, tdot: &mut [f64]) {
        self.assert_shape(inputs);
        assert_eq!(tdot.len(), self.num_nodes, "Tdot buffer length mismatch");
        for (i, out) in tdot.iter_mut().enumerate() {
            let [k, a, d, m, cp, th, t] = inputs.node(i);
            *out = temperature_rate(k, a, d, m, cp, th, t);
        }
    }

    pub fn compute_partials(&self, inputs: &NodeInputs, partials: &mut OdePartials) {
        self.assert_shape(inputs);
        for i in 0..self.num_nodes {
            let [k, a, d, m, cp, th, t] = inputs.node(i);
            let denom = d * m * cp;
            let gap = th - t;
            let p = &mut partials.values;
            p[OdeInput::Temperature.index()][i] = -k * a / denom;
            p[OdeInput::Conductivity.index()][i] = a * gap / denom;
            p[OdeInput::Area.index()][i] = k * gap / denom;
            p[OdeInput::HotTemperature.index()][i] = k * a / denom;
            p[OdeInput::Thickness.index()][i] = -k * a * gap / (m * cp * d * d);
            p[OdeInput::Mass.index()][i] = -k * a * gap / (d * cp * m * m);
            p[OdeInput::SpecificHeat.index()][i] = -k * a * gap / (d * m * cp * cp);
        }
    }

    fn assert_shape(&self, inputs: &NodeInputs) {
        for column in inputs.values.iter() {
            assert_eq!(
                column.len(),
                self.num_nodes,
                "ThermalOde expects {} nodes per input, got {}",
                self.num_nodes,
                column.len()
            );
        }
    }
}

/// Pointwise model, generic so it also runs on dual numbers.
pub fn temperature_rate<S: Scalar>(k: S, a: S, d: S, m: S, cp: S, th: S, t: S) -> S {
    k * a * (th - t) / (d * m * cp)
}

/// Single cell seen as a one-dimensional autonomous ODE, for forward integration.
#[derive(Debug, Clone, Copy)]
pub struct InsulatedCell {
    pub params: PhysicalParameters,
}

impl InsulatedCell {
    pub fn new(params: PhysicalParameters) -> Self {
        Self { params }
    }
}

impl<S: Scalar> DynamicalSystem<S> for InsulatedCell {
    fn dimension(&self) -> usize {
        1
    }

    fn apply(&self, _t: S, x: &[S], out: &mut [S]) {
        let p = &self.params;
        out[0] = temperature_rate(
            S::constant(p.conductivity),
            S::constant(p.area),
            S::constant(p.thickness),
            S::constant(p.mass),
            S::constant(p.specific_heat),
            S::constant(p.hot_temperature),
            x[0],
        );
    }
}

/// Worst discrepancy between the analytic partials of one input and two
/// independent references.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PartialCheck {
    pub input: OdeInput,
    /// Against forward-mode dual numbers (exact up to rounding).
    pub dual_abs_error: f64,
    pub dual_rel_error: f64,
    /// Against centered finite differences of `compute`.
    pub fd_abs_error: f64,
    pub fd_rel_error: f64,
}

impl PartialCheck {
    pub fn within(&self, rel_tol: f64) -> bool {
        self.dual_rel_error <= rel_tol && self.fd_rel_error <= rel_tol
    }
}

/// Validates [`ThermalOde::compute_partials`] input by input.
/// `rel_step` is the finite-difference step relative to each input's magnitude.
pub fn check_partials(ode: &ThermalOde, inputs: &NodeInputs, rel_step: f64) -> Vec<PartialCheck> {
    let n = ode.num_nodes();
    let mut analytic = OdePartials::new(n);
    ode.compute_partials(inputs, &mut analytic);

    let mut plus = vec![0.0; n];
    let mut minus = vec![0.0; n];
    let mut reports = Vec::with_capacity(OdeInput::ALL.len());

    for input in OdeInput::ALL {
        let mut report = PartialCheck {
            input,
            dual_abs_error: 0.0,
            dual_rel_error: 0.0,
            fd_abs_error: 0.0,
            fd_rel_error: 0.0,
        };

        let mut perturbed = inputs.clone();
        let base = inputs.get(input);
        let steps: Vec<f64> = base
            .iter()
            .map(|v| if *v != 0.0 { rel_step * v.abs() } else { rel_step })
            .collect();
        for (slot, (v, h)) in perturbed.get_mut(input).iter_mut().zip(base.iter().zip(&steps)) {
            *slot = v + h;
        }
        ode.compute(&perturbed, &mut plus);
        for (slot, (v, h)) in perturbed.get_mut(input).iter_mut().zip(base.iter().zip(&steps)) {
            *slot = v - h;
        }
        ode.compute(&perturbed, &mut minus);

        for i in 0..n {
            let exact = analytic.get(input)[i];
            let scale = exact.abs().max(f64::MIN_POSITIVE);

            let fd = (plus[i] - minus[i]) / (2.0 * steps[i]);
            let fd_err = (fd - exact).abs();
            report.fd_abs_error = report.fd_abs_error.max(fd_err);
            report.fd_rel_error = report.fd_rel_error.max(fd_err / scale);

            let dual = dual_partial(inputs, i, input);
            let dual_err = (dual - exact).abs();
            report.dual_abs_error = report.dual_abs_error.max(dual_err);
            report.dual_rel_error = report.dual_rel_error.max(dual_err / scale);
        }
        reports.push(report);
    }
    reports
}

fn dual_partial(inputs: &NodeInputs, node: usize, seed: OdeInput) -> f64 {
    let values = inputs.node(node);
    let constants = values.map(Dual::constant);
    let (_, slope) = derivative(
        |v| {
            let mut args = constants;
            args[seed.index()] = v;
            let [k, a, d, m, cp, th, t] = args;
            temperature_rate(k, a, d, m, cp, th, t)
        },
        values[seed.index()],
    );
    slope
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_inputs() -> NodeInputs {
        let params = PhysicalParameters::default().with_thickness(0.002);
        NodeInputs::broadcast(&params, &[293.15, 310.0, 333.15, 500.0])
    }

    #[test]
    fn closed_form_thickness() {
        let params = PhysicalParameters::default();
        let d = params
            .thickness_reaching(293.15, 333.15, 45.0)
            .expect("target is reachable");
        assert!((d - 0.002_221_959).abs() < 1e-8, "d = {d}");
        assert_eq!(params.thickness_reaching(293.15, 293.15, 45.0), None);
        assert_eq!(params.thickness_reaching(293.15, 800.0, 45.0), None);
    }

    #[test]
    fn reference_rate_matches_hand_calculation() {
        let params = PhysicalParameters::default();
        let expected = 0.03 * 3.06e-5 * (773.0 - 293.15) / (0.001 * 0.06 * 3.56);
        assert!((params.rate(293.15) - expected).abs() < 1e-12);
    }

    #[test]
    fn compute_is_pointwise() {
        let ode = ThermalOde::new(4);
        let inputs = sample_inputs();
        let mut tdot = vec![0.0; 4];
        ode.compute(&inputs, &mut tdot);
        let params = PhysicalParameters::default().with_thickness(0.002);
        for (out, t) in tdot.iter().zip(inputs.get(OdeInput::Temperature)) {
            assert_eq!(*out, params.rate(*t));
        }
    }

    #[test]
    fn check_partials_reports_small_errors() {
        let ode = ThermalOde::new(4);
        for report in check_partials(&ode, &sample_inputs(), 1e-6) {
            assert!(
                report.within(1e-6),
                "{} partial off: {:?}",
                report.input.symbol(),
                report
            );
        }
    }

    #[test]
    fn validate_rejects_non_positive_divisors() {
        let mut inputs = sample_inputs();
        inputs.fill(OdeInput::Thickness, 0.0);
        assert_eq!(
            inputs.validate(),
            Err(EvalError::NonPositive {
                name: "d",
                value: 0.0
            })
        );

        let mut inputs = sample_inputs();
        inputs.get_mut(OdeInput::SpecificHeat)[2] = -1.0;
        assert!(matches!(
            inputs.validate(),
            Err(EvalError::NonPositive { name: "Cp", .. })
        ));

        let mut inputs = sample_inputs();
        inputs.get_mut(OdeInput::Temperature)[1] = f64::NAN;
        assert_eq!(
            inputs.validate(),
            Err(EvalError::NonFinite {
                what: "temperature",
                node: 1
            })
        );
    }

    #[test]
    fn insulated_cell_agrees_with_vectorized_model() {
        let params = PhysicalParameters::default();
        let cell = InsulatedCell::new(params);
        let mut out = [0.0];
        cell.apply(0.0, &[300.0], &mut out);
        assert_eq!(out[0], params.rate(300.0));

        let mut dual_out = [Dual::constant(0.0)];
        cell.apply(Dual::constant(0.0), &[Dual::variable(300.0)], &mut dual_out);
        let ode = ThermalOde::new(1);
        let mut partials = OdePartials::new(1);
        ode.compute_partials(&NodeInputs::broadcast(&params, &[300.0]), &mut partials);
        assert!((dual_out[0].eps - partials[OdeInput::Temperature][0]).abs() < 1e-15);
    }

    #[test]
    #[should_panic(expected = "ThermalOde expects 3 nodes")]
    fn compute_panics_on_node_count_mismatch() {
        let ode = ThermalOde::new(3);
        let mut tdot = vec![0.0; 3];
        ode.compute(&sample_inputs(), &mut tdot);
    }

    proptest! {
        #[test]
        fn heat_flows_from_hot_to_cold(
            k in 1e-3f64..1.0,
            a in 1e-6f64..1e-2,
            d in 1e-3f64..0.5,
            m in 1e-2f64..10.0,
            cp in 0.1f64..10.0,
            t in 200.0f64..800.0,
            gap in 1e-3f64..500.0,
        ) {
            let rate = temperature_rate(k, a, d, m, cp, t + gap, t);
            prop_assert!(rate > 0.0);
        }

        #[test]
        fn analytic_partials_match_central_differences(
            k in 1e-3f64..1.0,
            a in 1e-6f64..1e-2,
            d in 1e-3f64..0.5,
            m in 1e-2f64..10.0,
            cp in 0.1f64..10.0,
            th in 300.0f64..1000.0,
            t in 200.0f64..290.0,
        ) {
            let params = PhysicalParameters {
                conductivity: k,
                area: a,
                thickness: d,
                mass: m,
                specific_heat: cp,
                hot_temperature: th,
            };
            let inputs = NodeInputs::broadcast(&params, &[t]);
            for report in check_partials(&ThermalOde::new(1), &inputs, 1e-6) {
                prop_assert!(
                    report.fd_rel_error <= 1e-6,
                    "{}: fd relative error {}", report.input.symbol(), report.fd_rel_error
                );
                prop_assert!(report.dual_rel_error <= 1e-12);
            }
        }
    }
}
