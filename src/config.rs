//! Statically validated plan configuration.
//!
//! Every knob the orchestrator consumes is an explicit field, checked by
//! [`PlanConfig::validate`] before any pipeline is spawned.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a group's collection round completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every worker must reply before the round completes; fragment order
    /// follows worker index order.
    BulkSync,
    /// Results are consumed in arrival order, one at a time, with no batch
    /// boundary; paired with per-arrival gradient application.
    Async,
}

/// What the batch accumulator counts toward its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// Environment steps (transitions).
    Steps,
    /// Completed episodes.
    Episodes,
}

/// A half-open `[start, end)` slice of pool indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub start: usize,
    pub end: usize,
}

impl PartitionRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

fn default_retries() -> u32 {
    2
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_group_floor() -> usize {
    1
}

fn one() -> NonZeroUsize {
    NonZeroUsize::MIN
}

/// Full configuration surface of one execution plan.
///
/// Hyperparameter semantics (learning rates, loss coefficients) live with
/// the policy, not here; this structure only carries what the orchestrator
/// itself consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    pub mode: SyncMode,
    pub count_policy: CountPolicy,
    /// Batch emission threshold, measured per `count_policy`.
    pub min_batch_size: usize,
    /// Ascending, disjoint slices of the pool; one pipeline per slice.
    pub partitions: Vec<PartitionRange>,
    /// Accelerator lanes a train step fans out over, per group. Clamped to
    /// the group size at dispatch time.
    #[serde(default = "one")]
    pub lanes_per_group: NonZeroUsize,
    /// Whole-round retries before a bulk-sync pipeline degrades its group.
    #[serde(default = "default_retries")]
    pub max_round_retries: u32,
    /// Per-call deadline for `sample()`; expiry counts as a failure of the
    /// slow worker only.
    #[serde(default = "default_timeout_ms")]
    pub sample_timeout_ms: u64,
    /// A degraded group halts once it would shrink below this.
    #[serde(default = "default_group_floor")]
    pub min_group_size: usize,
    /// Local SGD passes a worker runs over each batch inside one step.
    #[serde(default = "one")]
    pub sgd_passes: NonZeroUsize,
}

impl PlanConfig {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    /// Parses and validates a JSON config document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that could never run. Bounds against the pool
    /// are checked at partition time, when the pool size is known.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.min_group_size == 0 {
            return Err(ConfigError::ZeroGroupFloor);
        }
        if self.partitions.is_empty() {
            return Err(ConfigError::NoPartitions);
        }
        let mut covered = 0usize;
        for (index, range) in self.partitions.iter().enumerate() {
            if range.is_empty() {
                return Err(ConfigError::EmptyPartition { index });
            }
            if range.start < covered {
                return Err(ConfigError::OverlappingPartition { index });
            }
            if range.len() < self.min_group_size {
                return Err(ConfigError::GroupBelowFloor {
                    index,
                    floor: self.min_group_size,
                });
            }
            covered = range.end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PlanConfig {
        PlanConfig {
            mode: SyncMode::BulkSync,
            count_policy: CountPolicy::Steps,
            min_batch_size: 100,
            partitions: vec![PartitionRange::new(0, 6), PartitionRange::new(6, 11)],
            lanes_per_group: NonZeroUsize::new(2).unwrap(),
            max_round_retries: 2,
            sample_timeout_ms: 1_000,
            min_group_size: 1,
            sgd_passes: NonZeroUsize::MIN,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut cfg = base();
        cfg.min_batch_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBatchSize));
    }

    #[test]
    fn rejects_empty_range() {
        let mut cfg = base();
        cfg.partitions = vec![PartitionRange::new(3, 3)];
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyPartition { index: 0 }));
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let mut cfg = base();
        cfg.partitions = vec![PartitionRange::new(0, 6), PartitionRange::new(4, 9)];
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OverlappingPartition { index: 1 })
        );
    }

    #[test]
    fn rejects_descending_ranges() {
        let mut cfg = base();
        cfg.partitions = vec![PartitionRange::new(6, 11), PartitionRange::new(0, 6)];
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::OverlappingPartition { index: 1 })
        );
    }

    #[test]
    fn rejects_partition_below_floor() {
        let mut cfg = base();
        cfg.min_group_size = 3;
        cfg.partitions = vec![PartitionRange::new(0, 2)];
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::GroupBelowFloor { index: 0, floor: 3 })
        );
    }

    #[test]
    fn json_round_trip_with_defaults() {
        let text = r#"{
            "mode": "bulk_sync",
            "count_policy": "steps",
            "min_batch_size": 200,
            "partitions": [{ "start": 0, "end": 4 }]
        }"#;
        let cfg = PlanConfig::from_json(text).unwrap();
        assert_eq!(cfg.mode, SyncMode::BulkSync);
        assert_eq!(cfg.min_batch_size, 200);
        assert_eq!(cfg.max_round_retries, 2);
        assert_eq!(cfg.lanes_per_group.get(), 1);
        assert_eq!(cfg.sample_timeout(), Duration::from_millis(30_000));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = PlanConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }
}
