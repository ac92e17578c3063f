//! Validation of the analytic derivatives.
//!
//! 1. Model partials against dual numbers and central differences, over a
//!    sampled box of physical inputs.
//! 2. The assembled constraint Jacobian against central differences, for
//!    several transcriptions and free/fixed duration.

use insulopt_core::dynamics::{check_partials, NodeInputs, PhysicalParameters, ThermalOde};
use insulopt_core::nlp::{check_jacobian, InsulationProblem, NlpProblem};
use insulopt_core::ProblemConfig;
use proptest::prelude::*;

const FD_REL_TOL: f64 = 1e-6;
const DUAL_REL_TOL: f64 = 1e-12;

fn physics() -> impl Strategy<Value = PhysicalParameters> {
    (
        0.01f64..1.0,
        1e-5f64..1e-3,
        1e-4f64..0.5,
        0.01f64..1.0,
        0.5f64..5.0,
        400.0f64..1200.0,
    )
        .prop_map(|(k, a, d, m, cp, th)| PhysicalParameters {
            conductivity: k,
            area: a,
            thickness: d,
            mass: m,
            specific_heat: cp,
            hot_temperature: th,
        })
}

proptest! {
    #[test]
    fn model_partials_match_references(
        params in physics(),
        temps in prop::collection::vec(200.0f64..390.0, 1..8),
    ) {
        let inputs = NodeInputs::broadcast(&params, &temps);
        let checks = check_partials(&ThermalOde::new(temps.len()), &inputs, 1e-6);
        for check in checks {
            prop_assert!(check.fd_rel_error <= FD_REL_TOL, "{:?}", check);
            prop_assert!(check.dual_rel_error <= DUAL_REL_TOL, "{:?}", check);
        }
    }
}

fn assert_jacobian(label: &str, config: &ProblemConfig, thickness: f64) {
    let mut problem = InsulationProblem::new(config).expect("problem should build");
    let mut x = problem.initial_guess();
    x[problem.design_layout().thickness()] = thickness;
    let check = check_jacobian(&mut problem, &x, 1e-6).expect("check should evaluate");
    assert!(
        check.max_rel_error < FD_REL_TOL,
        "{label}: worst entry {:?}, {check:?}",
        check.worst_entry
    );
    assert!(check.max_undeclared < 1e-8, "{label}: {check:?}");
}

#[test]
fn constraint_jacobian_matches_finite_differences() {
    for (segments, order) in [(1, 3), (5, 3), (3, 5), (2, 7)] {
        let mut config = ProblemConfig::default();
        config.transcription.num_segments = segments;
        config.transcription.order = order;
        for thickness in [0.001, 0.0022, 0.05] {
            assert_jacobian(
                &format!("{segments} segments, order {order}, d = {thickness}"),
                &config,
                thickness,
            );
        }
    }
}

#[test]
fn free_time_jacobian_matches_finite_differences() {
    let mut config = ProblemConfig::default();
    config.transcription.num_segments = 4;
    config.time.fix_initial = false;
    config.time.fix_duration = false;
    config.time.initial_bounds = Some([0.0, 0.0]);
    config.time.duration_bounds = Some([20.0, 60.0]);
    assert_jacobian("free t_initial and t_duration", &config, 0.002);
}

#[test]
fn nonuniform_segments_jacobian_matches_finite_differences() {
    let mut config = ProblemConfig::default();
    config.transcription.segment_ends = Some(vec![-1.0, -0.8, 0.1, 1.0]);
    config.time.fix_duration = false;
    config.time.duration_bounds = Some([1.0, 100.0]);
    assert_jacobian("nonuniform segments", &config, 0.003);
}
