use crate::error::TranscriptionError;
use std::f64::consts::PI;

/// Legendre-Gauss-Lobatto points for `count` nodes, mapped from [-1, 1] to
/// [0, 1] and sorted ascending. Both endpoints are included; the interior
/// points are the roots of P'_{count-1}.
pub fn lobatto_nodes(count: usize) -> Result<Vec<f64>, TranscriptionError> {
    if count < 2 {
        return Err(TranscriptionError::InvalidOrder { order: count });
    }
    let n = count - 1;
    let mut nodes = vec![0.0; count];
    nodes[0] = 0.0;
    nodes[n] = 1.0;

    for i in 1..n {
        // Chebyshev-Gauss-Lobatto points are close enough for Newton.
        let mut x = -f64::cos(PI * i as f64 / n as f64);
        for _ in 0..100 {
            let (p, dp) = legendre_eval(n, x);
            let d2p = (2.0 * x * dp - (n * (n + 1)) as f64 * p) / (1.0 - x * x);
            let dx = -dp / d2p;
            x += dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        nodes[i] = 0.5 * (x + 1.0);
    }
    nodes.sort_by(|a, b| a.total_cmp(b));
    Ok(nodes)
}

/// P_n(x) and P_n'(x) by the three-term recurrence. Interior points only for
/// the derivative.
pub(crate) fn legendre_eval(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (1.0, 0.0);
    }
    let mut p0 = 1.0;
    let mut p1 = x;
    if n == 1 {
        return (p1, 1.0);
    }
    for k in 2..=n {
        let kf = k as f64;
        let pn = ((2.0 * kf - 1.0) * x * p1 - (kf - 1.0) * p0) / kf;
        p0 = p1;
        p1 = pn;
    }
    let dp = (n as f64) * (x * p1 - p0) / (x * x - 1.0);
    (p1, dp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-14, "{actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn three_point_rule_is_midpoint() {
        assert_close(&lobatto_nodes(3).expect("3 nodes"), &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn five_point_rule_matches_closed_form() {
        // Interior roots of P_4' on [-1, 1] are 0 and ±sqrt(3/7).
        let r = (3.0f64 / 7.0).sqrt();
        let expected = [0.0, 0.5 * (1.0 - r), 0.5, 0.5 * (1.0 + r), 1.0];
        assert_close(&lobatto_nodes(5).expect("5 nodes"), &expected);
    }

    #[test]
    fn nodes_are_symmetric() {
        for count in [4, 7, 9, 11] {
            let nodes = lobatto_nodes(count).expect("nodes should compute");
            for i in 0..count {
                assert!((nodes[i] + nodes[count - 1 - i] - 1.0).abs() < 1e-13);
            }
            assert!(nodes.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn single_node_is_rejected() {
        assert!(lobatto_nodes(1).is_err());
    }
}
