//! Nonlinear-program assembly: the generic [`NlpProblem`] interface and the
//! transcribed insulation problem.

pub mod check;
pub mod insulation;
pub mod layout;
pub mod problem;

pub use check::{check_jacobian, JacobianCheck};
pub use insulation::{InsulationProblem, Timeseries, TranscribedSolution};
pub use layout::{ConstraintLayout, DesignLayout};
pub use problem::{Bounds, JacobianStructure, NlpProblem};
