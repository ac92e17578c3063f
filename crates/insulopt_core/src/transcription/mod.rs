//! Gauss-Lobatto collocation.
//!
//! A segment of odd order `p` carries the `p` Legendre-Gauss-Lobatto points of
//! [0, 1]. The even-indexed points (both endpoints included) are state
//! discretization nodes, the odd-indexed interior points are collocation nodes
//! where the dynamics defect is enforced. Neighbouring segments share their
//! boundary state node, so a phase of `S` segments has `S·(ns − 1) + 1` state
//! nodes for `ns = (p + 1) / 2`.

pub mod grid;
pub mod hermite;
pub mod nodes;

pub use grid::{phase_time, SegmentGrid};
pub use hermite::HermiteMatrices;

use crate::error::TranscriptionError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub num_segments: usize,
    pub order: usize,
    /// Optional non-uniform segment boundaries; overrides `num_segments`.
    pub segment_ends: Option<Vec<f64>>,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            num_segments: 20,
            order: 3,
            segment_ends: None,
        }
    }
}

/// Which nodes a time or value query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSubset {
    /// Unique state nodes in phase order (the design variables).
    StateInput,
    Collocation,
    /// State and collocation nodes merged in phase order, shared boundaries once.
    All,
}

#[derive(Debug, Clone)]
pub struct GaussLobatto {
    order: usize,
    grid: SegmentGrid,
    disc_taus: Vec<f64>,
    col_taus: Vec<f64>,
    matrices: HermiteMatrices,
}

impl GaussLobatto {
    pub fn new(num_segments: usize, order: usize) -> Result<Self, TranscriptionError> {
        Self::build(SegmentGrid::uniform(num_segments)?, order)
    }

    pub fn with_segment_ends(ends: &[f64], order: usize) -> Result<Self, TranscriptionError> {
        Self::build(SegmentGrid::from_ends(ends)?, order)
    }

    pub fn from_config(config: &TranscriptionConfig) -> Result<Self, TranscriptionError> {
        match &config.segment_ends {
            Some(ends) => Self::with_segment_ends(ends, config.order),
            None => Self::new(config.num_segments, config.order),
        }
    }

    fn build(grid: SegmentGrid, order: usize) -> Result<Self, TranscriptionError> {
        if order < 3 || order % 2 == 0 {
            return Err(TranscriptionError::InvalidOrder { order });
        }
        let taus = nodes::lobatto_nodes(order)?;
        let disc_taus: Vec<f64> = taus.iter().step_by(2).copied().collect();
        let col_taus: Vec<f64> = taus.iter().skip(1).step_by(2).copied().collect();
        let matrices = HermiteMatrices::new(&disc_taus, &col_taus).map_err(|err| {
            TranscriptionError::Interpolation {
                what: format!("{err:#}"),
            }
        })?;
        Ok(Self {
            order,
            grid,
            disc_taus,
            col_taus,
            matrices,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn grid(&self) -> &SegmentGrid {
        &self.grid
    }

    pub fn num_segments(&self) -> usize {
        self.grid.num_segments()
    }

    pub fn matrices(&self) -> &HermiteMatrices {
        &self.matrices
    }

    /// State discretization nodes per segment, `(order + 1) / 2`.
    pub fn state_nodes_per_segment(&self) -> usize {
        self.disc_taus.len()
    }

    /// Collocation nodes per segment, `(order - 1) / 2`.
    pub fn collocation_nodes_per_segment(&self) -> usize {
        self.col_taus.len()
    }

    pub fn num_state_nodes(&self) -> usize {
        self.num_segments() * (self.state_nodes_per_segment() - 1) + 1
    }

    pub fn num_collocation_nodes(&self) -> usize {
        self.num_segments() * self.collocation_nodes_per_segment()
    }

    /// Global state-node indices of `segment`; consecutive segments overlap in
    /// exactly one index.
    pub fn segment_state_indices(&self, segment: usize) -> Range<usize> {
        let start = segment * (self.state_nodes_per_segment() - 1);
        start..start + self.state_nodes_per_segment()
    }

    pub fn segment_collocation_indices(&self, segment: usize) -> Range<usize> {
        let nc = self.collocation_nodes_per_segment();
        segment * nc..(segment + 1) * nc
    }

    /// Duration of `segment` in seconds for a phase lasting `t_duration`.
    pub fn segment_duration(&self, segment: usize, t_duration: f64) -> f64 {
        self.grid.fraction(segment) * t_duration
    }

    /// Phase fractions in [0, 1] of the requested nodes.
    pub fn node_taus(&self, subset: NodeSubset) -> Vec<f64> {
        let mut taus = Vec::new();
        for seg in 0..self.num_segments() {
            match subset {
                NodeSubset::StateInput => {
                    let skip = usize::from(seg > 0);
                    for &tau in self.disc_taus.iter().skip(skip) {
                        taus.push(self.grid.phase_tau(seg, tau));
                    }
                }
                NodeSubset::Collocation => {
                    for &tau in &self.col_taus {
                        taus.push(self.grid.phase_tau(seg, tau));
                    }
                }
                NodeSubset::All => {
                    let all = merged_taus(&self.disc_taus, &self.col_taus);
                    let skip = usize::from(seg > 0);
                    for tau in all.into_iter().skip(skip) {
                        taus.push(self.grid.phase_tau(seg, tau));
                    }
                }
            }
        }
        taus
    }

    pub fn node_times(&self, subset: NodeSubset, t_initial: f64, t_duration: f64) -> Vec<f64> {
        self.node_taus(subset)
            .into_iter()
            .map(|tau| phase_time(tau, t_initial, t_duration))
            .collect()
    }

    /// Linear interpolation in time between `ys[0]` at the phase start and
    /// `ys[1]` at its end, sampled at the requested nodes.
    pub fn interpolate_linear(&self, ys: [f64; 2], subset: NodeSubset) -> Vec<f64> {
        self.node_taus(subset)
            .into_iter()
            .map(|tau| ys[0] + tau * (ys[1] - ys[0]))
            .collect()
    }

    /// Interpolated values and transcribed rates at every collocation node from
    /// values and rates at every state node.
    pub fn collocation_values(
        &self,
        state: &[f64],
        rates: &[f64],
        t_duration: f64,
        col_values: &mut [f64],
        col_rates: &mut [f64],
    ) {
        assert_eq!(state.len(), self.num_state_nodes(), "state node count mismatch");
        assert_eq!(rates.len(), self.num_state_nodes(), "rate node count mismatch");
        assert_eq!(col_values.len(), self.num_collocation_nodes());
        assert_eq!(col_rates.len(), self.num_collocation_nodes());
        for seg in 0..self.num_segments() {
            let disc = self.segment_state_indices(seg);
            let col = self.segment_collocation_indices(seg);
            self.matrices.interpolate(
                &state[disc.clone()],
                &rates[disc],
                self.segment_duration(seg, t_duration),
                &mut col_values[col.clone()],
                &mut col_rates[col],
            );
        }
    }
}

fn merged_taus(disc: &[f64], col: &[f64]) -> Vec<f64> {
    let mut all: Vec<f64> = disc.iter().chain(col).copied().collect();
    all.sort_by(|a, b| a.total_cmp(b));
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_must_be_odd_and_at_least_three() {
        for order in [0, 1, 2, 4, 6] {
            assert_eq!(
                GaussLobatto::new(5, order).map(|_| ()),
                Err(TranscriptionError::InvalidOrder { order })
            );
        }
        assert!(GaussLobatto::new(5, 3).is_ok());
        assert!(GaussLobatto::new(5, 7).is_ok());
    }

    #[test]
    fn node_counts_follow_order() {
        let tx = GaussLobatto::new(20, 3).expect("transcription");
        assert_eq!(tx.state_nodes_per_segment(), 2);
        assert_eq!(tx.collocation_nodes_per_segment(), 1);
        assert_eq!(tx.num_state_nodes(), 21);
        assert_eq!(tx.num_collocation_nodes(), 20);

        let tx = GaussLobatto::new(4, 7).expect("transcription");
        assert_eq!(tx.state_nodes_per_segment(), 4);
        assert_eq!(tx.collocation_nodes_per_segment(), 3);
        assert_eq!(tx.num_state_nodes(), 13);
        assert_eq!(tx.num_collocation_nodes(), 12);
    }

    #[test]
    fn segments_share_boundary_state_nodes() {
        let tx = GaussLobatto::new(3, 5).expect("transcription");
        assert_eq!(tx.segment_state_indices(0), 0..3);
        assert_eq!(tx.segment_state_indices(1), 2..5);
        assert_eq!(tx.segment_state_indices(2), 4..7);
        assert_eq!(tx.segment_collocation_indices(2), 4..6);
    }

    #[test]
    fn node_times_cover_the_phase() {
        let tx = GaussLobatto::new(2, 3).expect("transcription");
        assert_eq!(
            tx.node_times(NodeSubset::StateInput, 10.0, 40.0),
            vec![10.0, 30.0, 50.0]
        );
        assert_eq!(tx.node_times(NodeSubset::Collocation, 10.0, 40.0), vec![20.0, 40.0]);
        assert_eq!(
            tx.node_times(NodeSubset::All, 10.0, 40.0),
            vec![10.0, 20.0, 30.0, 40.0, 50.0]
        );
    }

    #[test]
    fn non_uniform_segments_scale_durations() {
        let tx = GaussLobatto::with_segment_ends(&[0.0, 1.0, 4.0], 3).expect("transcription");
        assert_eq!(tx.segment_duration(0, 40.0), 10.0);
        assert_eq!(tx.segment_duration(1, 40.0), 30.0);
        assert_eq!(tx.node_times(NodeSubset::Collocation, 0.0, 40.0), vec![5.0, 25.0]);
    }

    #[test]
    fn linear_guess_spans_endpoints() {
        let tx = GaussLobatto::new(4, 3).expect("transcription");
        let guess = tx.interpolate_linear([293.15, 333.15], NodeSubset::StateInput);
        assert_eq!(guess.len(), 5);
        assert!((guess[0] - 293.15).abs() < 1e-12);
        assert!((guess[2] - 313.15).abs() < 1e-12);
        assert!((guess[4] - 333.15).abs() < 1e-12);
    }

    #[test]
    fn collocation_values_reproduce_exponential() {
        // x' = -x, x(0) = 1 over [0, 2]; error shrinks with the order.
        let t_duration = 2.0;
        let mut errors = Vec::new();
        for order in [3, 5] {
            let tx = GaussLobatto::new(4, order).expect("transcription");
            let times = tx.node_times(NodeSubset::StateInput, 0.0, t_duration);
            let state: Vec<f64> = times.iter().map(|t| (-t).exp()).collect();
            let rates: Vec<f64> = state.iter().map(|x| -x).collect();
            let n = tx.num_collocation_nodes();
            let (mut values, mut col_rates) = (vec![0.0; n], vec![0.0; n]);
            tx.collocation_values(&state, &rates, t_duration, &mut values, &mut col_rates);
            let col_times = tx.node_times(NodeSubset::Collocation, 0.0, t_duration);
            let worst = col_times
                .iter()
                .zip(values.iter().zip(&col_rates))
                .map(|(t, (x, xdot))| ((x - (-t).exp()).abs()).max((xdot + (-t).exp()).abs()))
                .fold(0.0, f64::max);
            errors.push(worst);
        }
        assert!(errors[0] < 1e-3, "{errors:?}");
        assert!(errors[1] < errors[0] * 1e-2, "{errors:?}");
    }
}
