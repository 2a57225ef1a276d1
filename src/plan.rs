//! Plan assembly: one pipeline task per worker group, all feeding a single
//! union stream of tagged events.
//!
//! Each pipeline cycles `collecting -> accumulating -> training ->
//! reporting` (or the async-gradient variant) with no cross-pipeline
//! barrier; the union channel interleaves reports in completion order. The
//! channel is bounded, so consuming the stream is what lets pipelines keep
//! producing.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    accumulator::BatchAccumulator,
    collector::{ArrivalFeed, RolloutCollector},
    config::{CountPolicy, PlanConfig, SyncMode},
    error::{ConfigError, GroupTermination, StepError},
    executor::{GradientApplier, TrainStepExecutor},
    metrics::{MetricsAggregator, MetricsReport},
    observer::PlanObserver,
    rollout::RolloutFragment,
    worker::{GroupId, RolloutWorker, WorkerGroup, WorkerPool},
};

/// One element of the plan's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanEvent {
    /// A completed training step's report.
    Metrics(MetricsReport),
    /// A group lost workers but continues with the remainder.
    GroupDegraded {
        group: GroupId,
        lost_workers: Vec<usize>,
    },
    /// A group's pipeline stopped; its terminal event, sent exactly once.
    GroupTerminated {
        group: GroupId,
        reason: GroupTermination,
    },
}

impl PlanEvent {
    /// The group this event originated in.
    pub fn group(&self) -> GroupId {
        match self {
            Self::Metrics(report) => report.group,
            Self::GroupDegraded { group, .. } => *group,
            Self::GroupTerminated { group, .. } => *group,
        }
    }
}

/// A running execution plan over one partitioned worker pool.
///
/// Consume events with [`ExecutionPlan::next_event`]; the sequence is lazy,
/// unbounded and non-restartable, and ends only when every pipeline has
/// terminated. Dropping the plan aborts all pipelines.
#[derive(Debug)]
pub struct ExecutionPlan {
    events: mpsc::Receiver<PlanEvent>,
    pipelines: Vec<(GroupId, CancellationToken)>,
    root: CancellationToken,
    tasks: JoinSet<()>,
}

impl ExecutionPlan {
    /// Validates the config, partitions the pool and spawns one pipeline
    /// task per group. Must be called within a Tokio runtime.
    pub fn build<W: RolloutWorker>(
        pool: &WorkerPool<W>,
        config: &PlanConfig,
        observer: Arc<dyn PlanObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let groups = pool.partition(&config.partitions)?;

        // One slot per pipeline: a group cannot run ahead of the consumer
        // by more than one unconsumed report.
        let (tx, events) = mpsc::channel(groups.len());
        let root = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut pipelines = Vec::with_capacity(groups.len());

        for group in groups {
            let token = root.child_token();
            pipelines.push((group.id(), token.clone()));
            let ctx = PipelineContext {
                config: PipelineConfig::from(config),
                events: tx.clone(),
                token,
                observer: Arc::clone(&observer),
            };
            match config.mode {
                SyncMode::BulkSync => tasks.spawn(run_sync_pipeline(group, ctx)),
                SyncMode::Async => tasks.spawn(run_async_pipeline(group, ctx)),
            };
        }

        Ok(Self {
            events,
            pipelines,
            root,
            tasks,
        })
    }

    /// Groups this plan drives, in partition order.
    pub fn groups(&self) -> Vec<GroupId> {
        self.pipelines.iter().map(|(id, _)| *id).collect()
    }

    /// Awaits the next event from any pipeline, in completion order.
    /// Returns `None` once every pipeline has terminated.
    pub async fn next_event(&mut self) -> Option<PlanEvent> {
        self.events.recv().await
    }

    /// Tears down one group's pipeline, cancelling its in-flight calls.
    /// Other pipelines are unaffected. Returns false for an unknown group.
    pub fn stop_group(&self, group: GroupId) -> bool {
        match self.pipelines.iter().find(|(id, _)| *id == group) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Tears down every pipeline.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Shuts down and waits for all pipeline tasks to finish. Pending
    /// events are discarded.
    pub async fn join(mut self) {
        self.root.cancel();
        // Dropping the receiver unblocks any pipeline waiting to send.
        drop(self.events);
        while self.tasks.join_next().await.is_some() {}
    }
}

#[derive(Clone)]
struct PipelineConfig {
    count_policy: CountPolicy,
    min_batch_size: usize,
    lanes: NonZeroUsize,
    sgd_passes: NonZeroUsize,
    max_round_retries: u32,
    sample_timeout: Duration,
    min_group_size: usize,
}

impl From<&PlanConfig> for PipelineConfig {
    fn from(config: &PlanConfig) -> Self {
        Self {
            count_policy: config.count_policy,
            min_batch_size: config.min_batch_size,
            lanes: config.lanes_per_group,
            sgd_passes: config.sgd_passes,
            max_round_retries: config.max_round_retries,
            sample_timeout: config.sample_timeout(),
            min_group_size: config.min_group_size,
        }
    }
}

struct PipelineContext {
    config: PipelineConfig,
    events: mpsc::Sender<PlanEvent>,
    token: CancellationToken,
    observer: Arc<dyn PlanObserver>,
}

/// Outcome of dropping workers from a live group.
enum AfterLoss<W> {
    /// Degraded but above the floor; continue on the reduced group.
    Continue(WorkerGroup<W>),
    /// Below the floor; the pipeline halts.
    Halt(GroupTermination),
    /// The consumer dropped the stream; exit without a terminal event.
    Detached,
}

async fn drop_workers<W: RolloutWorker>(
    ctx: &PipelineContext,
    group: &WorkerGroup<W>,
    lost: Vec<usize>,
) -> AfterLoss<W> {
    let reduced = group.without(&lost);
    if reduced.len() < ctx.config.min_group_size {
        return AfterLoss::Halt(GroupTermination::Failed { lost_workers: lost });
    }
    ctx.observer.group_degraded(group.id(), &lost, reduced.len());
    let event = PlanEvent::GroupDegraded {
        group: group.id(),
        lost_workers: lost,
    };
    if ctx.events.send(event).await.is_err() {
        return AfterLoss::Detached;
    }
    AfterLoss::Continue(reduced)
}

async fn finish_pipeline(ctx: &PipelineContext, group: GroupId, reason: GroupTermination) {
    ctx.observer.group_terminated(group, &reason);
    let _ = ctx
        .events
        .send(PlanEvent::GroupTerminated { group, reason })
        .await;
}

/// The bulk-sync cycle: collect a round from every worker, accumulate,
/// train, report; retry failed rounds and degrade the group when a worker
/// keeps failing.
async fn run_sync_pipeline<W: RolloutWorker>(mut group: WorkerGroup<W>, ctx: PipelineContext) {
    let gid = group.id();
    let cfg = ctx.config.clone();
    let mut accumulator = BatchAccumulator::new(cfg.count_policy, cfg.min_batch_size);
    let executor = TrainStepExecutor::new(cfg.lanes, cfg.sgd_passes);
    let mut aggregator = MetricsAggregator::new(gid);

    let reason: GroupTermination = 'run: loop {
        // -- collecting --
        let mut collector = RolloutCollector::new(group.clone(), cfg.sample_timeout);
        let mut attempt: u32 = 0;
        let fragments = loop {
            let round = tokio::select! {
                _ = ctx.token.cancelled() => break 'run GroupTermination::ShutDown,
                round = collector.collect_round() => round,
            };
            match round {
                Ok(fragments) => break fragments,
                Err(failure) => {
                    attempt += 1;
                    ctx.observer.round_failed(gid, &failure.failures, attempt);
                    if attempt <= cfg.max_round_retries {
                        continue;
                    }
                    match drop_workers(&ctx, &group, failure.worker_ids()).await {
                        AfterLoss::Continue(reduced) => {
                            group = reduced;
                            collector = RolloutCollector::new(group.clone(), cfg.sample_timeout);
                            attempt = 0;
                        }
                        AfterLoss::Halt(reason) => break 'run reason,
                        AfterLoss::Detached => return,
                    }
                }
            }
        };
        let steps: usize = fragments.iter().map(RolloutFragment::steps).sum();
        aggregator.record_sampled(steps);
        ctx.observer.round_collected(gid, fragments.len(), steps);

        // -- accumulating: one round can complete zero or more batches --
        let mut batches = Vec::new();
        for fragment in fragments {
            if let Some(batch) = accumulator.accept(fragment) {
                batches.push(batch);
            }
        }

        // -- training + reporting --
        for batch in batches {
            ctx.observer.batch_emitted(gid, batch.steps(), batch.episodes());
            let metrics = loop {
                let step = tokio::select! {
                    _ = ctx.token.cancelled() => break 'run GroupTermination::ShutDown,
                    step = executor.run(&batch, &group) => step,
                };
                match step {
                    Ok(metrics) => break metrics,
                    Err(StepError::Diverged { loss }) => {
                        break 'run GroupTermination::Diverged { loss };
                    }
                    Err(StepError::Worker(failure)) => {
                        // The emitted batch is never split; re-dispatch it
                        // unchanged to the reduced group.
                        match drop_workers(&ctx, &group, vec![failure.worker_id]).await {
                            AfterLoss::Continue(reduced) => group = reduced,
                            AfterLoss::Halt(reason) => break 'run reason,
                            AfterLoss::Detached => return,
                        }
                    }
                    Err(StepError::MissingOrigin { worker_id }) => {
                        break 'run GroupTermination::Failed {
                            lost_workers: vec![worker_id],
                        };
                    }
                }
            };
            let report = aggregator.wrap(metrics);
            ctx.observer
                .step_completed(gid, report.iteration, report.metrics.loss);
            if ctx.events.send(PlanEvent::Metrics(report)).await.is_err() {
                return;
            }
        }
    };

    finish_pipeline(&ctx, gid, reason).await;
}

/// The async-gradient cycle: consume gradients in arrival order, apply each
/// through the group lead, refresh only the originating worker.
async fn run_async_pipeline<W: RolloutWorker>(mut group: WorkerGroup<W>, ctx: PipelineContext) {
    let gid = group.id();
    let cfg = ctx.config.clone();
    let mut feed = ArrivalFeed::gradients(&group);
    let applier = GradientApplier;
    let mut aggregator = MetricsAggregator::new(gid);
    let mut strikes: HashMap<usize, u32> = HashMap::new();

    let reason: GroupTermination = 'run: loop {
        let arrival = tokio::select! {
            _ = ctx.token.cancelled() => break 'run GroupTermination::ShutDown,
            arrival = feed.next() => arrival,
        };
        let update = match arrival {
            // Every worker has been retired; nothing can arrive anymore.
            None => {
                break 'run GroupTermination::Failed {
                    lost_workers: group.worker_ids(),
                };
            }
            Some(Err(failure)) => {
                let worker_id = failure.worker_id;
                let strike = strikes.entry(worker_id).or_insert(0);
                *strike += 1;
                ctx.observer.round_failed(gid, &[failure], *strike);
                if *strike <= cfg.max_round_retries {
                    feed.rearm(worker_id);
                } else {
                    feed.retire(worker_id);
                    match drop_workers(&ctx, &group, vec![worker_id]).await {
                        AfterLoss::Continue(reduced) => group = reduced,
                        AfterLoss::Halt(reason) => break 'run reason,
                        AfterLoss::Detached => return,
                    }
                }
                continue;
            }
            Some(Ok(update)) => update,
        };

        strikes.remove(&update.worker_id);
        aggregator.record_sampled(update.samples);
        let step = tokio::select! {
            _ = ctx.token.cancelled() => break 'run GroupTermination::ShutDown,
            step = applier.apply(&update, &group) => step,
        };
        match step {
            Ok(metrics) => {
                let report = aggregator.wrap(metrics);
                ctx.observer
                    .step_completed(gid, report.iteration, report.metrics.loss);
                if ctx.events.send(PlanEvent::Metrics(report)).await.is_err() {
                    return;
                }
            }
            Err(StepError::Diverged { loss }) => break 'run GroupTermination::Diverged { loss },
            Err(StepError::Worker(failure)) => {
                // The lead holds the canonical policy; losing it ends the
                // group. Losing the origin only degrades it.
                if failure.worker_id == group.lead().index() {
                    break 'run GroupTermination::Failed {
                        lost_workers: vec![failure.worker_id],
                    };
                }
                feed.retire(failure.worker_id);
                match drop_workers(&ctx, &group, vec![failure.worker_id]).await {
                    AfterLoss::Continue(reduced) => group = reduced,
                    AfterLoss::Halt(reason) => break 'run reason,
                    AfterLoss::Detached => return,
                }
            }
            // The origin was degraded away while its gradient was in
            // flight; the stale update is dropped.
            Err(StepError::MissingOrigin { .. }) => continue,
        }
    };

    finish_pipeline(&ctx, gid, reason).await;
}
