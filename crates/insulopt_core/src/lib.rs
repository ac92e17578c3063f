pub mod autodiff;
pub mod config;
pub mod driver;
pub mod dynamics;
pub mod error;
pub mod nlp;
pub mod simulate;
pub mod solvers;
pub mod sqp;
/// Gauss-Lobatto collocation of the cell-heating ODE for sizing an insulation
/// layer: the thinnest layer that keeps the cell below a temperature limit
/// over a fixed exposure.
///
/// Key components:
/// - **Dynamics**: the vectorized thermal model with exact diagonal partials.
/// - **Transcription**: LGL nodes, Hermite interpolation matrices and segment bookkeeping.
/// - **NLP**: design/constraint layout, defects and the sparse constraint Jacobian.
/// - **SQP**: an elastic-mode SQP with an interior-point QP subsolver.
/// - **Simulate**: RK4 and adaptive Tsit5 forward runs to cross-check an optimum.
pub mod transcription;
pub mod traits;

pub use config::ProblemConfig;
pub use driver::{run_optimization, OptimizationReport};
pub use error::{EvalError, SimulationError, SolveError, TranscriptionError};
