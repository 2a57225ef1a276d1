//! Execution-plan orchestration for distributed reinforcement-learning
//! training.
//!
//! A fleet of remote rollout workers is partitioned into disjoint groups;
//! each group runs its own collect -> accumulate -> train -> report
//! pipeline, and the plan exposes the union of all per-group metrics
//! streams as a single lazy sequence of tagged events.

pub mod accumulator;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod observer;
pub mod plan;
pub mod rollout;
pub mod sim;
pub mod worker;

pub use accumulator::BatchAccumulator;
pub use collector::{ArrivalFeed, RolloutCollector};
pub use config::{CountPolicy, PartitionRange, PlanConfig, SyncMode};
pub use error::{
    ConfigError, FailureCause, GroupTermination, StepError, WorkerError, WorkerFailure,
};
pub use executor::{GradientApplier, TrainStepExecutor};
pub use metrics::{MetricsAggregator, MetricsReport, TrainMetrics};
pub use observer::{LogObserver, NullObserver, PlanObserver};
pub use plan::{ExecutionPlan, PlanEvent};
pub use rollout::{GradientUpdate, RolloutBatch, RolloutFragment, Transition, WeightBlob};
pub use worker::{GroupId, RolloutWorker, WorkerGroup, WorkerHandle, WorkerPool};
