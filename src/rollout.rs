//! Experience data model: transitions, rollout fragments, training batches,
//! gradient updates and weight blobs.
//!
//! The orchestrator never inspects the numeric content of states or actions;
//! it only counts, concatenates and routes. States and actions are opaque
//! feature vectors at this layer.

use serde::{Deserialize, Serialize};

/// One environment step produced by a worker's policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f32,
    pub next_state: Vec<f32>,
    /// True when this step ended its episode.
    pub done: bool,
}

impl Transition {
    pub fn new(state: Vec<f32>, action: Vec<f32>, reward: f32, next_state: Vec<f32>) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
            done: false,
        }
    }

    /// Marks the transition as the final step of its episode.
    pub fn terminal(mut self) -> Self {
        self.done = true;
        self
    }
}

/// A bounded slice of environment interaction produced by one worker.
///
/// Owned by the collector from the moment the worker replies until the
/// accumulator consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutFragment {
    /// Stable index of the producing worker within the pool.
    pub worker_id: usize,
    /// Producing agent, for multi-agent settings. Single-agent workers use 0.
    pub agent_id: usize,
    pub transitions: Vec<Transition>,
}

impl RolloutFragment {
    pub fn new(worker_id: usize, transitions: Vec<Transition>) -> Self {
        Self {
            worker_id,
            agent_id: 0,
            transitions,
        }
    }

    pub fn with_agent(mut self, agent_id: usize) -> Self {
        self.agent_id = agent_id;
        self
    }

    /// Size in environment steps.
    pub fn steps(&self) -> usize {
        self.transitions.len()
    }

    /// Size in completed episodes.
    pub fn episodes(&self) -> usize {
        self.transitions.iter().filter(|t| t.done).count()
    }

    /// Sum of rewards over the fragment.
    pub fn total_reward(&self) -> f32 {
        self.transitions.iter().map(|t| t.reward).sum()
    }
}

/// A concatenation of fragments whose total size reached the configured
/// threshold. Never split once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutBatch {
    fragments: Vec<RolloutFragment>,
}

impl RolloutBatch {
    pub(crate) fn from_fragments(fragments: Vec<RolloutFragment>) -> Self {
        Self { fragments }
    }

    pub fn fragments(&self) -> &[RolloutFragment] {
        &self.fragments
    }

    pub fn steps(&self) -> usize {
        self.fragments.iter().map(RolloutFragment::steps).sum()
    }

    pub fn episodes(&self) -> usize {
        self.fragments.iter().map(RolloutFragment::episodes).sum()
    }

    /// Ids of the workers that contributed fragments, in fragment order.
    pub fn contributors(&self) -> impl Iterator<Item = usize> + '_ {
        self.fragments.iter().map(|f| f.worker_id)
    }
}

/// Opaque serialized policy weights.
///
/// The version increases monotonically with every applied update so that
/// staleness stays visible in metrics; the payload itself is never
/// interpreted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightBlob {
    pub version: u64,
    pub payload: Vec<f32>,
}

impl WeightBlob {
    pub fn new(version: u64, payload: Vec<f32>) -> Self {
        Self { version, payload }
    }
}

/// A gradient computed remotely by one worker, to be consumed exactly once.
///
/// In async-gradient mode the applying step refreshes only the originating
/// worker's weights; the rest of the group keeps running on its current
/// (possibly stale) policy.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientUpdate {
    /// Stable index of the producing worker within the pool.
    pub worker_id: usize,
    pub gradient: WeightBlob,
    /// Environment steps the gradient was computed over.
    pub samples: usize,
    /// Loss observed by the producing worker.
    pub loss: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(worker_id: usize, steps: usize, episodes: usize) -> RolloutFragment {
        let mut transitions: Vec<Transition> = (0..steps)
            .map(|_| Transition::new(vec![0.0], vec![0.0], 1.0, vec![0.0]))
            .collect();
        for t in transitions.iter_mut().take(episodes) {
            t.done = true;
        }
        RolloutFragment::new(worker_id, transitions)
    }

    #[test]
    fn fragment_counts_steps_and_episodes() {
        let f = frag(3, 10, 2);
        assert_eq!(f.steps(), 10);
        assert_eq!(f.episodes(), 2);
        assert_eq!(f.worker_id, 3);
    }

    #[test]
    fn batch_sums_over_fragments() {
        let batch = RolloutBatch::from_fragments(vec![frag(0, 40, 1), frag(1, 60, 0)]);
        assert_eq!(batch.steps(), 100);
        assert_eq!(batch.episodes(), 1);
        assert_eq!(batch.contributors().collect::<Vec<_>>(), vec![0, 1]);
    }
}
