use num_traits::{NumOps, One, Zero};
use std::fmt::Debug;
use std::ops::Neg;

/// A trait for types that can be used as scalars in the thermal model.
/// Arithmetic only: the dynamics never need transcendental functions, so
/// both `f64` and forward-mode `Dual` numbers qualify.
pub trait Scalar: Copy + Debug + PartialOrd + NumOps + Neg<Output = Self> + Zero + One + 'static {
    /// Lifts a real constant into the scalar type (zero derivative part).
    fn constant(value: f64) -> Self;

    /// Real (primal) part.
    fn real(self) -> f64;
}

impl Scalar for f64 {
    fn constant(value: f64) -> Self {
        value
    }

    fn real(self) -> f64 {
        self
    }
}

/// Represents a continuous-time dynamical system dx/dt = f(t, x).
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}
