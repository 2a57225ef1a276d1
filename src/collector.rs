//! Rollout collection in the two synchronization modes.
//!
//! Bulk-sync issues `sample()` to every group member concurrently and
//! completes only when all have replied; the async feed yields results in
//! arrival order, one at a time, re-issuing to each worker as its previous
//! result is consumed.

use std::{pin::Pin, sync::Arc, time::Duration};

use futures::{future, stream::FuturesUnordered, StreamExt};

use crate::{
    error::{RoundFailure, WorkerError, WorkerFailure},
    rollout::{GradientUpdate, RolloutFragment},
    worker::{RolloutWorker, WorkerGroup, WorkerHandle},
};

/// Bulk-sync collector for one worker group.
pub struct RolloutCollector<W> {
    group: WorkerGroup<W>,
    timeout: Duration,
}

impl<W: RolloutWorker> RolloutCollector<W> {
    pub fn new(group: WorkerGroup<W>, timeout: Duration) -> Self {
        Self { group, timeout }
    }

    pub fn group(&self) -> &WorkerGroup<W> {
        &self.group
    }

    /// Runs one collection round: every member samples concurrently, each
    /// guarded by the per-call deadline, and the round completes once all
    /// have replied.
    ///
    /// Fragments come back in worker-index order regardless of arrival
    /// order, so downstream batch contents are reproducible. A round with
    /// any failure reports every failed worker; callers retry whole rounds.
    pub async fn collect_round(&self) -> Result<Vec<RolloutFragment>, RoundFailure> {
        let timeout = self.timeout;
        let calls = self.group.members().iter().map(|handle| async move {
            match tokio::time::timeout(timeout, handle.sample()).await {
                Ok(Ok(fragment)) => Ok(fragment),
                Ok(Err(error)) => Err(WorkerFailure::remote(handle.index(), error)),
                Err(_) => Err(WorkerFailure::timed_out(handle.index())),
            }
        });

        // `join_all` preserves input order and members are stored ascending
        // by index, which is the ordering guarantee.
        let results = future::join_all(calls).await;

        let mut fragments = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(fragment) => fragments.push(fragment),
                Err(failure) => failures.push(failure),
            }
        }
        if failures.is_empty() {
            Ok(fragments)
        } else {
            Err(RoundFailure { failures })
        }
    }
}

type FeedFuture<T> = Pin<Box<dyn Future<Output = (usize, Result<T, WorkerError>)> + Send>>;
type FeedCall<W, T> = Arc<dyn Fn(WorkerHandle<W>) -> FeedFuture<T> + Send + Sync>;

/// Arrival-ordered lazy feed over one group: first-of-N completion with
/// immediate re-issue on consumption. Order is non-deterministic.
pub struct ArrivalFeed<W, T> {
    members: Vec<WorkerHandle<W>>,
    inflight: FuturesUnordered<FeedFuture<T>>,
    call: FeedCall<W, T>,
}

impl<W: RolloutWorker> ArrivalFeed<W, GradientUpdate> {
    /// A feed of remotely computed gradients (`compute_gradients`).
    pub fn gradients(group: &WorkerGroup<W>) -> Self {
        Self::with_call(
            group,
            Arc::new(|handle: WorkerHandle<W>| -> FeedFuture<GradientUpdate> {
                Box::pin(async move { (handle.index(), handle.compute_gradients().await) })
            }),
        )
    }
}

impl<W: RolloutWorker> ArrivalFeed<W, RolloutFragment> {
    /// A feed of rollout fragments (`sample`).
    pub fn samples(group: &WorkerGroup<W>) -> Self {
        Self::with_call(
            group,
            Arc::new(|handle: WorkerHandle<W>| -> FeedFuture<RolloutFragment> {
                Box::pin(async move { (handle.index(), handle.sample().await) })
            }),
        )
    }
}

impl<W: RolloutWorker, T> ArrivalFeed<W, T> {
    fn with_call(group: &WorkerGroup<W>, call: FeedCall<W, T>) -> Self {
        let mut feed = Self {
            members: group.members().to_vec(),
            inflight: FuturesUnordered::new(),
            call,
        };
        for handle in feed.members.clone() {
            feed.issue(handle);
        }
        feed
    }

    fn issue(&mut self, handle: WorkerHandle<W>) {
        self.inflight.push((self.call)(handle));
    }

    /// Workers still participating in the feed.
    pub fn live_workers(&self) -> usize {
        self.members.len()
    }

    /// Awaits the next arrival. A successful worker is immediately
    /// re-issued; a failed one stays idle until [`ArrivalFeed::rearm`] or
    /// [`ArrivalFeed::retire`] decides its fate. Yields `None` once no
    /// calls remain in flight.
    pub async fn next(&mut self) -> Option<Result<T, WorkerFailure>> {
        let (worker_id, result) = self.inflight.next().await?;
        match result {
            Ok(value) => {
                self.rearm(worker_id);
                Some(Ok(value))
            }
            Err(error) => Some(Err(WorkerFailure::remote(worker_id, error))),
        }
    }

    /// Re-issues to a worker still in the feed.
    pub fn rearm(&mut self, worker_id: usize) {
        let handle = self
            .members
            .iter()
            .find(|h| h.index() == worker_id)
            .cloned();
        if let Some(handle) = handle {
            self.issue(handle);
        }
    }

    /// Permanently removes a worker from the feed.
    pub fn retire(&mut self, worker_id: usize) {
        self.members.retain(|h| h.index() != worker_id);
    }
}
