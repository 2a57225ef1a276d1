//! Failure taxonomy for the execution plan.
//!
//! Failures are scoped to the smallest unit they originate in: a bad config
//! is fatal at construction, a single worker's failure is retried and then
//! degrades its group, a diverged loss terminates its group's pipeline only.

use std::{error::Error, fmt};

/// Configuration problems, caught before any pipeline is spawned.
/// Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No partition ranges were given; a plan needs at least one group.
    NoPartitions,
    /// A `[start, end)` range with `start >= end`.
    EmptyPartition { index: usize },
    /// A range that starts before the previous one ends, or ranges out of
    /// ascending order.
    OverlappingPartition { index: usize },
    /// A range reaching past the pool.
    OutOfBounds {
        index: usize,
        end: usize,
        pool_size: usize,
    },
    /// A batch threshold of zero would emit on every fragment.
    ZeroBatchSize,
    /// The degradation floor must keep at least one worker alive.
    ZeroGroupFloor,
    /// A partition smaller than the degradation floor could never run.
    GroupBelowFloor { index: usize, floor: usize },
    /// The config document could not be parsed.
    Malformed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPartitions => write!(f, "no partition ranges configured"),
            Self::EmptyPartition { index } => {
                write!(f, "partition range {index} is empty")
            }
            Self::OverlappingPartition { index } => {
                write!(f, "partition range {index} overlaps the previous range")
            }
            Self::OutOfBounds {
                index,
                end,
                pool_size,
            } => write!(
                f,
                "partition range {index} ends at {end} but the pool has {pool_size} workers"
            ),
            Self::ZeroBatchSize => write!(f, "minimum batch size must be positive"),
            Self::ZeroGroupFloor => write!(f, "minimum group size must be positive"),
            Self::GroupBelowFloor { index, floor } => {
                write!(
                    f,
                    "partition range {index} is smaller than the group floor {floor}"
                )
            }
            Self::Malformed(msg) => write!(f, "malformed config: {msg}"),
        }
    }
}

impl Error for ConfigError {}

/// An error reported by the remote-call substrate for a single capability
/// call. The orchestrator treats the message as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    message: String,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for WorkerError {}

/// Why a single worker's call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The call did not complete within the configured deadline.
    TimedOut,
    /// The substrate reported a failure.
    Remote(WorkerError),
}

/// A single worker's call failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub cause: FailureCause,
}

impl WorkerFailure {
    pub fn timed_out(worker_id: usize) -> Self {
        Self {
            worker_id,
            cause: FailureCause::TimedOut,
        }
    }

    pub fn remote(worker_id: usize, error: WorkerError) -> Self {
        Self {
            worker_id,
            cause: FailureCause::Remote(error),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            FailureCause::TimedOut => write!(f, "worker {} timed out", self.worker_id),
            FailureCause::Remote(e) => write!(f, "worker {} failed: {e}", self.worker_id),
        }
    }
}

impl Error for WorkerFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            FailureCause::Remote(e) => Some(e),
            FailureCause::TimedOut => None,
        }
    }
}

/// A whole bulk-sync collection round failed: one failure per worker that
/// did not produce a fragment, in worker-index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundFailure {
    pub failures: Vec<WorkerFailure>,
}

impl RoundFailure {
    /// Ids of the workers that failed the round, in index order.
    pub fn worker_ids(&self) -> Vec<usize> {
        self.failures.iter().map(|w| w.worker_id).collect()
    }
}

impl fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection round failed for workers {:?}", self.worker_ids())
    }
}

impl Error for RoundFailure {}

/// Failure of one training step (synchronized pass or gradient application).
#[derive(Debug, Clone, PartialEq)]
pub enum StepError {
    /// The merged loss came back non-finite. Fatal for the owning group,
    /// never retried.
    Diverged { loss: f64 },
    /// A lane or broadcast target failed mid-step.
    Worker(WorkerFailure),
    /// An async-gradient update referenced a worker no longer in the group.
    MissingOrigin { worker_id: usize },
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diverged { loss } => write!(f, "training diverged: loss = {loss}"),
            Self::Worker(failure) => write!(f, "train step failed: {failure}"),
            Self::MissingOrigin { worker_id } => {
                write!(f, "gradient origin worker {worker_id} is not in the group")
            }
        }
    }
}

impl Error for StepError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Worker(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<WorkerFailure> for StepError {
    fn from(value: WorkerFailure) -> Self {
        Self::Worker(value)
    }
}

/// Why a group's pipeline stopped. Surfaced exactly once through the
/// metrics stream as that group's terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupTermination {
    /// Non-finite loss.
    Diverged { loss: f64 },
    /// Too few healthy workers left to continue.
    Failed { lost_workers: Vec<usize> },
    /// The pipeline was torn down by the caller.
    ShutDown,
}

impl fmt::Display for GroupTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diverged { loss } => write!(f, "diverged with loss {loss}"),
            Self::Failed { lost_workers } => {
                write!(f, "failed after losing workers {lost_workers:?}")
            }
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}
