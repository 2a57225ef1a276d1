//! Threshold-driven batch accumulation.

use crate::{
    config::CountPolicy,
    rollout::{RolloutBatch, RolloutFragment},
};

/// Concatenates fragments until their total size reaches the configured
/// minimum, then emits one batch and resets.
///
/// Stateful across calls; batch boundaries are fully determined by the
/// input fragment sequence and the threshold.
pub struct BatchAccumulator {
    policy: CountPolicy,
    min_size: usize,
    buffered: Vec<RolloutFragment>,
    count: usize,
}

impl BatchAccumulator {
    pub fn new(policy: CountPolicy, min_size: usize) -> Self {
        Self {
            policy,
            min_size,
            buffered: Vec::new(),
            count: 0,
        }
    }

    /// Size currently buffered, in the configured unit.
    pub fn pending(&self) -> usize {
        self.count
    }

    fn measure(&self, fragment: &RolloutFragment) -> usize {
        match self.policy {
            CountPolicy::Steps => fragment.steps(),
            CountPolicy::Episodes => fragment.episodes(),
        }
    }

    /// Takes ownership of a fragment; returns the accumulated batch once
    /// the running total first meets the threshold, resetting the counter.
    ///
    /// A single fragment that alone exceeds the threshold emits exactly one
    /// batch; emitted batches are never split.
    pub fn accept(&mut self, fragment: RolloutFragment) -> Option<RolloutBatch> {
        self.count += self.measure(&fragment);
        self.buffered.push(fragment);

        if self.count >= self.min_size {
            self.count = 0;
            Some(RolloutBatch::from_fragments(std::mem::take(&mut self.buffered)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::Transition;

    fn frag(steps: usize, episodes: usize) -> RolloutFragment {
        let mut transitions: Vec<Transition> = (0..steps)
            .map(|_| Transition::new(vec![0.0], vec![0.0], 0.0, vec![0.0]))
            .collect();
        for t in transitions.iter_mut().take(episodes) {
            t.done = true;
        }
        RolloutFragment::new(0, transitions)
    }

    #[test]
    fn emits_once_threshold_is_reached_and_resets() {
        let mut acc = BatchAccumulator::new(CountPolicy::Steps, 100);

        assert!(acc.accept(frag(40, 0)).is_none());
        assert!(acc.accept(frag(40, 0)).is_none());
        assert_eq!(acc.pending(), 80);

        let batch = acc.accept(frag(40, 0)).expect("third fragment crosses 100");
        assert_eq!(batch.steps(), 120);
        assert_eq!(acc.pending(), 0);

        // The counter restarted from zero.
        assert!(acc.accept(frag(99, 0)).is_none());
        assert!(acc.accept(frag(1, 0)).is_some());
    }

    #[test]
    fn oversized_fragment_emits_exactly_one_unsplit_batch() {
        let mut acc = BatchAccumulator::new(CountPolicy::Steps, 100);
        let batch = acc.accept(frag(150, 0)).expect("oversized fragment emits");
        assert_eq!(batch.steps(), 150);
        assert_eq!(batch.fragments().len(), 1);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn episode_policy_ignores_step_counts() {
        let mut acc = BatchAccumulator::new(CountPolicy::Episodes, 3);

        assert!(acc.accept(frag(500, 1)).is_none());
        assert!(acc.accept(frag(500, 1)).is_none());
        let batch = acc.accept(frag(500, 1)).expect("three episodes");
        assert_eq!(batch.episodes(), 3);
        assert_eq!(batch.steps(), 1500);
    }

    #[test]
    fn boundaries_are_deterministic_for_a_fixed_sequence() {
        let sizes = [30, 30, 30, 30, 30, 30, 30, 30];
        let run = || {
            let mut acc = BatchAccumulator::new(CountPolicy::Steps, 100);
            sizes
                .iter()
                .enumerate()
                .filter_map(|(i, &s)| acc.accept(frag(s, 0)).map(|b| (i, b.steps())))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
        assert_eq!(run(), vec![(3, 120), (7, 120)]);
    }
}
