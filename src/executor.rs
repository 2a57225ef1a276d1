//! Training dispatch: the synchronized multi-lane train step and the
//! asymmetric async-gradient application.

use std::num::NonZeroUsize;

use futures::future;

use crate::{
    error::{StepError, WorkerFailure},
    metrics::TrainMetrics,
    rollout::{GradientUpdate, RolloutBatch},
    worker::{RolloutWorker, WorkerGroup},
};

/// Dispatches one synchronized gradient-descent step per batch.
///
/// The batch is replicated across up to `lanes` workers of the owning
/// group; each pass awaits all lanes before the next starts, and after the
/// final pass the lead lane's weights are broadcast to every group member.
pub struct TrainStepExecutor {
    lanes: NonZeroUsize,
    sgd_passes: NonZeroUsize,
}

impl TrainStepExecutor {
    pub fn new(lanes: NonZeroUsize, sgd_passes: NonZeroUsize) -> Self {
        Self { lanes, sgd_passes }
    }

    /// Runs one training step for `batch` against `group`.
    ///
    /// A non-finite merged loss is fatal for the group and must not be
    /// retried; a failed lane or broadcast target surfaces as that worker's
    /// failure so the caller can degrade the group.
    pub async fn run<W: RolloutWorker>(
        &self,
        batch: &RolloutBatch,
        group: &WorkerGroup<W>,
    ) -> Result<TrainMetrics, StepError> {
        let lane_count = self.lanes.get().min(group.len());
        let lanes = &group.members()[..lane_count];

        let mut merged = TrainMetrics::new(0.0, 0);
        for _ in 0..self.sgd_passes.get() {
            let results = future::join_all(
                lanes
                    .iter()
                    .map(|handle| async move { (handle.index(), handle.train_step(batch).await) }),
            )
            .await;

            let mut lane_metrics = Vec::with_capacity(results.len());
            for (worker_id, result) in results {
                match result {
                    Ok(metrics) => lane_metrics.push(metrics),
                    Err(error) => return Err(WorkerFailure::remote(worker_id, error).into()),
                }
            }
            merged = TrainMetrics::merge_lanes(&lane_metrics);
        }

        if !merged.loss.is_finite() {
            return Err(StepError::Diverged { loss: merged.loss });
        }
        merged
            .scalars
            .insert("sgd_passes".to_string(), self.sgd_passes.get() as f64);

        self.broadcast_weights(group).await?;
        Ok(merged)
    }

    /// Symmetric sync: pull the lead lane's weights and push them to every
    /// member. Pushes run concurrently across workers; each individual
    /// worker's writes stay serialized by its handle gate.
    async fn broadcast_weights<W: RolloutWorker>(
        &self,
        group: &WorkerGroup<W>,
    ) -> Result<(), StepError> {
        let lead = group.lead();
        let blob = lead
            .pull_weights()
            .await
            .map_err(|e| WorkerFailure::remote(lead.index(), e))?;

        let pushes = group.members().iter().map(|handle| {
            let blob = &blob;
            async move {
                handle
                    .push_weights(blob)
                    .await
                    .map_err(|e| WorkerFailure::remote(handle.index(), e))
            }
        });
        for result in future::join_all(pushes).await {
            result?;
        }
        Ok(())
    }
}

/// Applies remotely computed gradients in async-gradient mode.
///
/// The group lead holds the canonical policy: it applies each arriving
/// gradient, and only the originating worker is refreshed with the lead's
/// new weights. The rest of the group keeps sampling on its current,
/// possibly stale policy.
pub struct GradientApplier;

impl GradientApplier {
    pub async fn apply<W: RolloutWorker>(
        &self,
        update: &GradientUpdate,
        group: &WorkerGroup<W>,
    ) -> Result<TrainMetrics, StepError> {
        if !update.loss.is_finite() {
            return Err(StepError::Diverged { loss: update.loss });
        }
        let origin = group
            .member(update.worker_id)
            .ok_or(StepError::MissingOrigin {
                worker_id: update.worker_id,
            })?;

        let lead = group.lead();
        lead.apply_gradients(update)
            .await
            .map_err(|e| WorkerFailure::remote(lead.index(), e))?;
        let blob = lead
            .pull_weights()
            .await
            .map_err(|e| WorkerFailure::remote(lead.index(), e))?;

        origin
            .push_weights(&blob)
            .await
            .map_err(|e| WorkerFailure::remote(origin.index(), e))?;

        let mut metrics = TrainMetrics::new(update.loss, update.samples);
        metrics
            .scalars
            .insert("weight_version".to_string(), blob.version as f64);
        Ok(metrics)
    }
}
