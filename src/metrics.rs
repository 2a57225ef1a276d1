//! Per-step training statistics and the uniform reporting envelope each
//! pipeline wraps them in before they reach the union stream.

use std::{collections::HashMap, time::Instant};

use serde::{Deserialize, Serialize};

use crate::worker::GroupId;

/// Statistics for one completed training step. Produced once per step,
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub loss: f64,
    pub grad_norm: Option<f64>,
    /// Environment steps consumed by this training step.
    pub samples: usize,
    /// Custom scalars reported by the policy (entropy, KL, ...).
    #[serde(default)]
    pub scalars: HashMap<String, f64>,
}

impl TrainMetrics {
    pub fn new(loss: f64, samples: usize) -> Self {
        Self {
            loss,
            grad_norm: None,
            samples,
            scalars: HashMap::new(),
        }
    }

    pub fn with_grad_norm(mut self, grad_norm: f64) -> Self {
        self.grad_norm = Some(grad_norm);
        self
    }

    pub fn with_scalar(mut self, key: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(key.into(), value);
        self
    }

    /// Element-wise mean over per-lane metrics. Loss and grad norm average,
    /// sample counts sum, custom scalars average per key.
    pub fn merge_lanes(lanes: &[TrainMetrics]) -> TrainMetrics {
        debug_assert!(!lanes.is_empty());
        let n = lanes.len() as f64;
        let loss = lanes.iter().map(|m| m.loss).sum::<f64>() / n;
        let grad_norms: Vec<f64> = lanes.iter().filter_map(|m| m.grad_norm).collect();
        let grad_norm = if grad_norms.is_empty() {
            None
        } else {
            Some(grad_norms.iter().sum::<f64>() / grad_norms.len() as f64)
        };
        let samples = lanes.iter().map(|m| m.samples).sum();

        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        for m in lanes {
            for (key, value) in &m.scalars {
                let entry = sums.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
        let scalars = sums
            .into_iter()
            .map(|(key, (sum, count))| (key, sum / count as f64))
            .collect();

        TrainMetrics {
            loss,
            grad_norm,
            samples,
            scalars,
        }
    }
}

/// One element of the plan's output stream: a completed step's metrics in
/// the uniform envelope, tagged with its originating group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub group: GroupId,
    /// 1-based training iteration within the group.
    pub iteration: u64,
    /// Cumulative environment steps collected by the group's pipeline.
    pub steps_sampled: u64,
    /// Cumulative environment steps consumed by training.
    pub steps_trained: u64,
    /// Samples per second over the iteration that produced this report.
    pub throughput: f64,
    pub metrics: TrainMetrics,
}

/// Per-pipeline wrapper that turns raw step metrics into [`MetricsReport`]s.
/// Stateful: tracks the group's iteration counter, cumulative step counts
/// and iteration timing.
pub struct MetricsAggregator {
    group: GroupId,
    iteration: u64,
    steps_sampled: u64,
    steps_trained: u64,
    last_wrap: Instant,
}

impl MetricsAggregator {
    pub fn new(group: GroupId) -> Self {
        Self {
            group,
            iteration: 0,
            steps_sampled: 0,
            steps_trained: 0,
            last_wrap: Instant::now(),
        }
    }

    /// Records environment steps collected from workers.
    pub fn record_sampled(&mut self, steps: usize) {
        self.steps_sampled += steps as u64;
    }

    /// Wraps one step's metrics, advancing the iteration counter.
    pub fn wrap(&mut self, metrics: TrainMetrics) -> MetricsReport {
        self.iteration += 1;
        self.steps_trained += metrics.samples as u64;

        let elapsed = self.last_wrap.elapsed().as_secs_f64();
        self.last_wrap = Instant::now();
        let throughput = if elapsed > 0.0 {
            metrics.samples as f64 / elapsed
        } else {
            0.0
        };

        MetricsReport {
            group: self.group,
            iteration: self.iteration,
            steps_sampled: self.steps_sampled,
            steps_trained: self.steps_trained,
            throughput,
            metrics,
        }
    }
}
