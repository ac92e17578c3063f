use std::ops::Range;

/// Positions of the design variables:
/// `[T at every state node, d, t_initial?, t_duration?]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesignLayout {
    num_state_nodes: usize,
    free_t_initial: bool,
    free_t_duration: bool,
}

impl DesignLayout {
    pub fn new(num_state_nodes: usize, free_t_initial: bool, free_t_duration: bool) -> Self {
        Self {
            num_state_nodes,
            free_t_initial,
            free_t_duration,
        }
    }

    pub fn states(&self) -> Range<usize> {
        0..self.num_state_nodes
    }

    pub fn state(&self, node: usize) -> usize {
        debug_assert!(node < self.num_state_nodes);
        node
    }

    pub fn final_state(&self) -> usize {
        self.num_state_nodes - 1
    }

    pub fn thickness(&self) -> usize {
        self.num_state_nodes
    }

    pub fn t_initial(&self) -> Option<usize> {
        self.free_t_initial.then_some(self.num_state_nodes + 1)
    }

    pub fn t_duration(&self) -> Option<usize> {
        self.free_t_duration
            .then_some(self.num_state_nodes + 1 + usize::from(self.free_t_initial))
    }

    pub fn len(&self) -> usize {
        self.num_state_nodes + 1 + usize::from(self.free_t_initial) + usize::from(self.free_t_duration)
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Positions of the constraint rows:
/// `[defect per collocation node, initial pin?, boundary constraints...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintLayout {
    num_defects: usize,
    pin_initial: bool,
    num_boundary: usize,
}

impl ConstraintLayout {
    pub fn new(num_defects: usize, pin_initial: bool, num_boundary: usize) -> Self {
        Self {
            num_defects,
            pin_initial,
            num_boundary,
        }
    }

    pub fn defects(&self) -> Range<usize> {
        0..self.num_defects
    }

    pub fn initial_pin(&self) -> Option<usize> {
        self.pin_initial.then_some(self.num_defects)
    }

    pub fn boundary(&self, index: usize) -> usize {
        debug_assert!(index < self.num_boundary);
        self.num_defects + usize::from(self.pin_initial) + index
    }

    pub fn len(&self) -> usize {
        self.num_defects + usize::from(self.pin_initial) + self.num_boundary
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_time_layout() {
        let layout = DesignLayout::new(21, false, false);
        assert_eq!(layout.len(), 22);
        assert_eq!(layout.thickness(), 21);
        assert_eq!(layout.final_state(), 20);
        assert_eq!(layout.t_initial(), None);
        assert_eq!(layout.t_duration(), None);
    }

    #[test]
    fn free_time_variables_follow_thickness() {
        let layout = DesignLayout::new(5, true, true);
        assert_eq!(layout.t_initial(), Some(6));
        assert_eq!(layout.t_duration(), Some(7));
        assert_eq!(layout.len(), 8);

        let layout = DesignLayout::new(5, false, true);
        assert_eq!(layout.t_duration(), Some(6));
        assert_eq!(layout.len(), 7);
    }

    #[test]
    fn constraint_rows_are_contiguous() {
        let rows = ConstraintLayout::new(20, true, 2);
        assert_eq!(rows.defects(), 0..20);
        assert_eq!(rows.initial_pin(), Some(20));
        assert_eq!(rows.boundary(0), 21);
        assert_eq!(rows.boundary(1), 22);
        assert_eq!(rows.len(), 23);

        let rows = ConstraintLayout::new(4, false, 1);
        assert_eq!(rows.initial_pin(), None);
        assert_eq!(rows.boundary(0), 4);
    }
}
