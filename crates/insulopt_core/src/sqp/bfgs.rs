use nalgebra::{DMatrix, DVector};

/// Powell-damped BFGS update of the Lagrangian Hessian approximation.
///
/// When `sᵀy < 0.2 sᵀBs` the secant pair is blended with `Bs` so the update
/// keeps `B` positive definite. Returns `false` (and leaves `B` untouched)
/// when the step is too short to carry curvature information.
pub fn damped_update(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) -> bool {
    let bs = &*b * s;
    let sbs = s.dot(&bs);
    if !(sbs > 1e-16) {
        return false;
    }
    let mut y = y.clone();
    let mut sy = s.dot(&y);
    if sy < 0.2 * sbs {
        let theta = 0.8 * sbs / (sbs - sy);
        y = y * theta + &bs * (1.0 - theta);
        sy = s.dot(&y);
    }
    *b -= &bs * bs.transpose() / sbs;
    *b += &y * y.transpose() / sy;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_positive_definite(b: &DMatrix<f64>) -> bool {
        b.clone().cholesky().is_some()
    }

    #[test]
    fn secant_condition_holds() {
        let mut b = DMatrix::identity(2, 2);
        let s = DVector::from_vec(vec![1.0, 0.5]);
        let y = DVector::from_vec(vec![2.0, 1.5]);
        assert!(damped_update(&mut b, &s, &y));
        let bs = &b * &s;
        assert!((bs - &y).amax() < 1e-12);
    }

    #[test]
    fn negative_curvature_is_damped() {
        let mut b = DMatrix::identity(2, 2);
        let s = DVector::from_vec(vec![1.0, 0.0]);
        let y = DVector::from_vec(vec![-3.0, 1.0]);
        assert!(damped_update(&mut b, &s, &y));
        assert!(is_positive_definite(&b));
        // Damping targets sᵀBs_new = sᵀy_damped = 0.2 sᵀBs.
        let sbs = s.dot(&(&b * &s));
        assert!((sbs - 0.2).abs() < 1e-12);
    }

    #[test]
    fn tiny_step_is_skipped() {
        let mut b = DMatrix::identity(3, 3);
        let s = DVector::from_element(3, 1e-10);
        assert!(!damped_update(&mut b, &s, &DVector::from_element(3, 1.0)));
        assert_eq!(b, DMatrix::identity(3, 3));
    }
}
