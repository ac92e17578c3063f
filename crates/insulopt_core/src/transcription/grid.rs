use crate::error::TranscriptionError;

/// Segment boundaries of a phase, normalized to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentGrid {
    ends: Vec<f64>,
}

impl SegmentGrid {
    pub fn uniform(num_segments: usize) -> Result<Self, TranscriptionError> {
        if num_segments == 0 {
            return Err(TranscriptionError::NoSegments);
        }
        let ends = (0..=num_segments)
            .map(|i| i as f64 / num_segments as f64)
            .collect();
        Ok(Self { ends })
    }

    /// Accepts any strictly increasing list of at least two boundaries and
    /// rescales it onto [0, 1].
    pub fn from_ends(ends: &[f64]) -> Result<Self, TranscriptionError> {
        if ends.len() < 2 {
            return Err(TranscriptionError::NoSegments);
        }
        if ends.iter().any(|e| !e.is_finite()) {
            return Err(TranscriptionError::SegmentEnds {
                what: "boundaries must be finite".to_string(),
            });
        }
        if let Some(pair) = ends.windows(2).find(|w| w[1] <= w[0]) {
            return Err(TranscriptionError::SegmentEnds {
                what: format!(
                    "boundaries must be strictly increasing ({} then {})",
                    pair[0], pair[1]
                ),
            });
        }
        let first = ends[0];
        let span = ends[ends.len() - 1] - first;
        let mut normalized: Vec<f64> = ends.iter().map(|e| (e - first) / span).collect();
        // Pin the endpoints exactly.
        normalized[0] = 0.0;
        let last = normalized.len() - 1;
        normalized[last] = 1.0;
        Ok(Self { ends: normalized })
    }

    pub fn num_segments(&self) -> usize {
        self.ends.len() - 1
    }

    pub fn ends(&self) -> &[f64] {
        &self.ends
    }

    pub fn start(&self, segment: usize) -> f64 {
        self.ends[segment]
    }

    /// Fraction of the phase covered by `segment`.
    pub fn fraction(&self, segment: usize) -> f64 {
        self.ends[segment + 1] - self.ends[segment]
    }

    /// Maps a segment-local tau in [0, 1] to a phase fraction.
    pub fn phase_tau(&self, segment: usize, tau: f64) -> f64 {
        self.start(segment) + self.fraction(segment) * tau
    }
}

/// Absolute time of a phase fraction.
pub fn phase_time(tau: f64, t_initial: f64, t_duration: f64) -> f64 {
    t_initial + tau * t_duration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_grid_splits_evenly() {
        let grid = SegmentGrid::uniform(4).expect("grid");
        assert_eq!(grid.ends(), &[0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(grid.fraction(2), 0.25);
        assert_eq!(grid.phase_tau(1, 0.5), 0.375);
    }

    #[test]
    fn custom_ends_are_normalized() {
        let grid = SegmentGrid::from_ends(&[-1.0, 0.0, 3.0]).expect("grid");
        assert_eq!(grid.num_segments(), 2);
        assert_eq!(grid.ends(), &[0.0, 0.25, 1.0]);
    }

    #[test]
    fn malformed_ends_are_rejected() {
        assert_eq!(SegmentGrid::uniform(0), Err(TranscriptionError::NoSegments));
        assert_eq!(SegmentGrid::from_ends(&[1.0]), Err(TranscriptionError::NoSegments));
        assert!(matches!(
            SegmentGrid::from_ends(&[0.0, 0.5, 0.5, 1.0]),
            Err(TranscriptionError::SegmentEnds { .. })
        ));
        assert!(matches!(
            SegmentGrid::from_ends(&[0.0, f64::NAN]),
            Err(TranscriptionError::SegmentEnds { .. })
        ));
    }

    #[test]
    fn phase_time_maps_linearly() {
        assert_eq!(phase_time(0.5, 10.0, 45.0), 32.5);
    }
}
