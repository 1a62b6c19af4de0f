use serde::{Deserialize, Serialize};

/// How `ControlSequence::shift` fills the steps it appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceFill {
    /// Repeat the last control of the sequence before shifting.
    #[default]
    Last,
    Zero,
}

/// A horizon of control vectors, one per decision step, each `dof` wide.
///
/// Stored step-major so a single step's controls are contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSequence {
    dof: usize,
    horizon: usize,
    data: Vec<f32>,
}

impl ControlSequence {
    pub fn zeros(dof: usize, horizon: usize) -> Self {
        Self {
            dof,
            horizon,
            data: vec![0.0; dof * horizon],
        }
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Number of decision steps. Always the horizon the sequence was built with.
    pub fn len(&self) -> usize {
        self.horizon
    }

    pub fn is_empty(&self) -> bool {
        self.horizon == 0
    }

    pub fn step(&self, j: usize) -> &[f32] {
        &self.data[j * self.dof..(j + 1) * self.dof]
    }

    pub fn step_mut(&mut self, j: usize) -> &mut [f32] {
        &mut self.data[j * self.dof..(j + 1) * self.dof]
    }

    pub fn steps(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dof.max(1)).take(self.horizon)
    }

    /// Entry `(joint, step)` of the dof × horizon table.
    pub fn get(&self, joint: usize, step: usize) -> f32 {
        self.data[step * self.dof + joint]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Drop the first `k` steps and append `k` filler steps. Returns the
    /// dropped steps in order. `k` is clamped to the horizon.
    pub fn shift(&mut self, k: usize, fill: AdvanceFill) -> Vec<Vec<f32>> {
        let k = k.min(self.horizon);
        if k == 0 {
            return Vec::new();
        }
        let filler = match fill {
            AdvanceFill::Last => self.step(self.horizon - 1).to_vec(),
            AdvanceFill::Zero => vec![0.0; self.dof],
        };

        let dropped: Vec<Vec<f32>> = self
            .data
            .drain(..k * self.dof)
            .collect::<Vec<_>>()
            .chunks_exact(self.dof.max(1))
            .map(<[f32]>::to_vec)
            .collect();
        for _ in 0..k {
            self.data.extend_from_slice(&filler);
        }
        debug_assert_eq!(self.data.len(), self.dof * self.horizon);
        dropped
    }

    pub fn clamp(&mut self, limit: f32) {
        for v in &mut self.data {
            *v = v.clamp(-limit, limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dof: usize, horizon: usize) -> ControlSequence {
        let mut seq = ControlSequence::zeros(dof, horizon);
        for (i, v) in seq.as_mut_slice().iter_mut().enumerate() {
            *v = i as f32;
        }
        seq
    }

    #[test]
    fn shift_drops_front_and_repeats_last() {
        let mut seq = ramp(2, 4);
        let dropped = seq.shift(1, AdvanceFill::Last);
        assert_eq!(dropped, vec![vec![0.0, 1.0]]);
        assert_eq!(seq.as_slice(), &[2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 6.0, 7.0]);
        assert_eq!(seq.len(), 4);
    }

    #[test]
    fn shift_with_zero_fill() {
        let mut seq = ramp(1, 3);
        seq.shift(2, AdvanceFill::Zero);
        assert_eq!(seq.as_slice(), &[2.0, 0.0, 0.0]);
    }

    #[test]
    fn shift_whole_horizon_keeps_length() {
        for k in 0..=5 {
            let mut seq = ramp(3, 5);
            seq.shift(k, AdvanceFill::Last);
            seq.shift(5 - k, AdvanceFill::Last);
            assert_eq!(seq.len(), 5);
            assert_eq!(seq.as_slice().len(), 15);
        }
    }

    #[test]
    fn table_indexing() {
        let seq = ramp(2, 3);
        assert_eq!(seq.get(1, 2), 5.0);
        assert_eq!(seq.step(1), &[2.0, 3.0]);
        assert_eq!(seq.steps().count(), 3);
    }
}
