//! Injected observability sink.
//!
//! The orchestrator reports lifecycle events through this capability
//! instead of calling a process-global logger; callers that want the usual
//! `RUST_LOG` behavior inject [`LogObserver`].

use crate::{
    error::{GroupTermination, WorkerFailure},
    worker::GroupId,
};

/// Receives pipeline lifecycle events. All methods default to no-ops so
/// implementations only override what they care about.
pub trait PlanObserver: Send + Sync {
    /// A bulk-sync round completed.
    fn round_collected(&self, group: GroupId, fragments: usize, steps: usize) {
        let _ = (group, fragments, steps);
    }

    /// A collection round failed and will be retried or escalated.
    fn round_failed(&self, group: GroupId, failures: &[WorkerFailure], attempt: u32) {
        let _ = (group, failures, attempt);
    }

    /// The accumulator emitted a training batch.
    fn batch_emitted(&self, group: GroupId, steps: usize, episodes: usize) {
        let _ = (group, steps, episodes);
    }

    /// A training step finished and its report was published.
    fn step_completed(&self, group: GroupId, iteration: u64, loss: f64) {
        let _ = (group, iteration, loss);
    }

    /// The group dropped workers but continues with the remainder.
    fn group_degraded(&self, group: GroupId, lost: &[usize], remaining: usize) {
        let _ = (group, lost, remaining);
    }

    /// The group's pipeline stopped.
    fn group_terminated(&self, group: GroupId, reason: &GroupTermination) {
        let _ = (group, reason);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl PlanObserver for NullObserver {}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl PlanObserver for LogObserver {
    fn round_collected(&self, group: GroupId, fragments: usize, steps: usize) {
        log::debug!("{group}: collected {fragments} fragment(s), {steps} step(s)");
    }

    fn round_failed(&self, group: GroupId, failures: &[WorkerFailure], attempt: u32) {
        log::warn!(
            "{group}: round attempt {attempt} failed for workers {:?}",
            failures.iter().map(|f| f.worker_id).collect::<Vec<_>>()
        );
    }

    fn batch_emitted(&self, group: GroupId, steps: usize, episodes: usize) {
        log::debug!("{group}: batch ready ({steps} steps, {episodes} episodes)");
    }

    fn step_completed(&self, group: GroupId, iteration: u64, loss: f64) {
        log::info!("{group}: iteration {iteration} done, loss {loss:.4}");
    }

    fn group_degraded(&self, group: GroupId, lost: &[usize], remaining: usize) {
        log::warn!("{group}: degraded, lost {lost:?}, {remaining} worker(s) remain");
    }

    fn group_terminated(&self, group: GroupId, reason: &GroupTermination) {
        log::info!("{group}: terminated: {reason}");
    }
}
