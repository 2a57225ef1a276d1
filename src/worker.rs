//! Worker capability surface, the pool that owns the fleet, and its
//! partitioning into disjoint index-ordered groups.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    config::PartitionRange,
    error::{ConfigError, WorkerError},
    metrics::TrainMetrics,
    rollout::{GradientUpdate, RolloutBatch, RolloutFragment, WeightBlob},
};

/// Capability interface of one remote worker.
///
/// The remote-call substrate behind these methods already exists; every
/// call is a non-blocking request whose completion the orchestrator awaits.
/// Futures must be `Send` because pipelines run them inside spawned tasks.
pub trait RolloutWorker: Send + Sync + 'static {
    /// Generates one rollout fragment of experience.
    fn sample(&self) -> impl Future<Output = Result<RolloutFragment, WorkerError>> + Send;

    /// Generates experience and computes a policy gradient locally instead
    /// of returning the raw rollout.
    fn compute_gradients(&self) -> impl Future<Output = Result<GradientUpdate, WorkerError>> + Send;

    /// Runs one gradient-descent pass over the batch and reports metrics.
    fn train_step(
        &self,
        batch: &RolloutBatch,
    ) -> impl Future<Output = Result<TrainMetrics, WorkerError>> + Send;

    /// Applies a remotely computed gradient to this worker's policy.
    fn apply_gradients(
        &self,
        update: &GradientUpdate,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send;

    /// Reads this worker's current policy weights.
    fn get_weights(&self) -> impl Future<Output = Result<WeightBlob, WorkerError>> + Send;

    /// Replaces this worker's policy weights.
    fn set_weights(&self, blob: &WeightBlob) -> impl Future<Output = Result<(), WorkerError>> + Send;
}

/// Identifier of a worker group, stable for the life of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// A shared view of one worker: its stable pool index plus the per-worker
/// gate that serializes weight writes. A worker never receives two
/// concurrent weight updates through a handle.
pub struct WorkerHandle<W> {
    index: usize,
    worker: Arc<W>,
    weight_gate: Arc<Mutex<()>>,
}

impl<W> Clone for WorkerHandle<W> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            worker: Arc::clone(&self.worker),
            weight_gate: Arc::clone(&self.weight_gate),
        }
    }
}

impl<W> fmt::Debug for WorkerHandle<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .finish()
    }
}

impl<W: RolloutWorker> WorkerHandle<W> {
    fn new(index: usize, worker: Arc<W>) -> Self {
        Self {
            index,
            worker,
            weight_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Stable index of this worker within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn sample(&self) -> Result<RolloutFragment, WorkerError> {
        self.worker.sample().await
    }

    pub async fn compute_gradients(&self) -> Result<GradientUpdate, WorkerError> {
        self.worker.compute_gradients().await
    }

    pub async fn train_step(&self, batch: &RolloutBatch) -> Result<TrainMetrics, WorkerError> {
        self.worker.train_step(batch).await
    }

    pub async fn apply_gradients(&self, update: &GradientUpdate) -> Result<(), WorkerError> {
        self.worker.apply_gradients(update).await
    }

    pub async fn pull_weights(&self) -> Result<WeightBlob, WorkerError> {
        self.worker.get_weights().await
    }

    /// Pushes weights through the per-worker gate.
    pub async fn push_weights(&self, blob: &WeightBlob) -> Result<(), WorkerError> {
        let _gate = self.weight_gate.lock().await;
        self.worker.set_weights(blob).await
    }
}

/// Owns the full fleet of worker handles. Read-mostly after construction:
/// partitioning only creates views.
pub struct WorkerPool<W> {
    handles: Vec<WorkerHandle<W>>,
}

impl<W: RolloutWorker> WorkerPool<W> {
    pub fn new(workers: Vec<W>) -> Self {
        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(index, worker)| WorkerHandle::new(index, Arc::new(worker)))
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handle(&self, index: usize) -> Option<&WorkerHandle<W>> {
        self.handles.get(index)
    }

    /// Splits the pool into disjoint, index-ordered groups.
    ///
    /// Ranges must be ascending, non-overlapping, non-empty and within the
    /// pool; the same fleet can be split into any number of independently
    /// trained sub-swarms without touching worker state.
    pub fn partition(
        &self,
        ranges: &[PartitionRange],
    ) -> Result<Vec<WorkerGroup<W>>, ConfigError> {
        if ranges.is_empty() {
            return Err(ConfigError::NoPartitions);
        }
        let mut covered = 0usize;
        let mut groups = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            if range.is_empty() {
                return Err(ConfigError::EmptyPartition { index });
            }
            if range.start < covered {
                return Err(ConfigError::OverlappingPartition { index });
            }
            if range.end > self.handles.len() {
                return Err(ConfigError::OutOfBounds {
                    index,
                    end: range.end,
                    pool_size: self.handles.len(),
                });
            }
            covered = range.end;
            groups.push(WorkerGroup {
                id: GroupId(index),
                members: self.handles[range.start..range.end].to_vec(),
            });
        }
        Ok(groups)
    }
}

/// An ordered, disjoint slice of the pool. Immutable for the life of a
/// plan; a degraded pipeline continues on a *new* reduced group built with
/// [`WorkerGroup::without`].
pub struct WorkerGroup<W> {
    id: GroupId,
    members: Vec<WorkerHandle<W>>,
}

impl<W> Clone for WorkerGroup<W> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            members: self.members.clone(),
        }
    }
}

impl<W> fmt::Debug for WorkerGroup<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("id", &self.id)
            .field("members", &self.members)
            .finish()
    }
}

impl<W: RolloutWorker> WorkerGroup<W> {
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Members in ascending worker-index order.
    pub fn members(&self) -> &[WorkerHandle<W>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The group's learner: its lowest-indexed member.
    pub fn lead(&self) -> &WorkerHandle<W> {
        &self.members[0]
    }

    pub fn member(&self, worker_id: usize) -> Option<&WorkerHandle<W>> {
        self.members.iter().find(|h| h.index() == worker_id)
    }

    pub fn worker_ids(&self) -> Vec<usize> {
        self.members.iter().map(WorkerHandle::index).collect()
    }

    /// A new group with the given workers removed, keeping the same id.
    pub fn without(&self, lost: &[usize]) -> Self {
        Self {
            id: self.id,
            members: self
                .members
                .iter()
                .filter(|h| !lost.contains(&h.index()))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWorker;

    fn pool(n: usize) -> WorkerPool<SimWorker> {
        WorkerPool::new((0..n).map(|i| SimWorker::healthy(i, 10)).collect())
    }

    #[test]
    fn partition_produces_disjoint_index_ordered_groups() {
        let pool = pool(11);
        let groups = pool
            .partition(&[PartitionRange::new(0, 6), PartitionRange::new(6, 11)])
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id(), GroupId(0));
        assert_eq!(groups[0].worker_ids(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(groups[1].worker_ids(), vec![6, 7, 8, 9, 10]);

        // Union of groups covers exactly the requested indices, no worker
        // appears twice.
        let mut all: Vec<usize> = groups.iter().flat_map(|g| g.worker_ids()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..11).collect::<Vec<_>>());
    }

    #[test]
    fn partition_may_cover_a_subset_of_the_pool() {
        let pool = pool(8);
        let groups = pool
            .partition(&[PartitionRange::new(1, 3), PartitionRange::new(5, 8)])
            .unwrap();
        assert_eq!(groups[0].worker_ids(), vec![1, 2]);
        assert_eq!(groups[1].worker_ids(), vec![5, 6, 7]);
    }

    #[test]
    fn partition_rejects_out_of_bounds() {
        let pool = pool(4);
        let err = pool.partition(&[PartitionRange::new(0, 5)]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::OutOfBounds {
                index: 0,
                end: 5,
                pool_size: 4
            }
        );
    }

    #[test]
    fn partition_rejects_overlap_and_empty() {
        let pool = pool(10);
        let overlap = pool
            .partition(&[PartitionRange::new(0, 5), PartitionRange::new(4, 8)])
            .unwrap_err();
        assert_eq!(overlap, ConfigError::OverlappingPartition { index: 1 });

        let empty = pool.partition(&[PartitionRange::new(2, 2)]).unwrap_err();
        assert_eq!(empty, ConfigError::EmptyPartition { index: 0 });
    }

    #[test]
    fn without_builds_a_reduced_group_with_same_id() {
        let pool = pool(5);
        let groups = pool.partition(&[PartitionRange::new(0, 5)]).unwrap();
        let reduced = groups[0].without(&[1, 3]);
        assert_eq!(reduced.id(), groups[0].id());
        assert_eq!(reduced.worker_ids(), vec![0, 2, 4]);
        // The original group view is untouched.
        assert_eq!(groups[0].len(), 5);
    }
}
