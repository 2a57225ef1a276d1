//! Demo driver: runs an execution plan over a simulated in-process fleet
//! and prints the union metrics stream as JSON lines.
//!
//! Usage: `rollout-orchestration [config.json] [reports]`

use std::{num::NonZeroUsize, sync::Arc};

use anyhow::{Context, Result};

use rollout_orchestration::{
    CountPolicy, ExecutionPlan, LogObserver, PartitionRange, PlanConfig, PlanEvent, SyncMode,
    WorkerPool, sim::SimWorker,
};

fn default_config() -> PlanConfig {
    PlanConfig {
        mode: SyncMode::BulkSync,
        count_policy: CountPolicy::Steps,
        min_batch_size: 64,
        partitions: vec![PartitionRange::new(0, 6), PartitionRange::new(6, 11)],
        lanes_per_group: NonZeroUsize::new(2).expect("nonzero"),
        max_round_retries: 2,
        sample_timeout_ms: 5_000,
        min_group_size: 1,
        sgd_passes: NonZeroUsize::MIN,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            PlanConfig::from_json(&text)?
        }
        None => default_config(),
    };
    let reports: usize = match args.next() {
        Some(n) => n.parse().context("report count must be a number")?,
        None => 20,
    };

    let fleet_size = config
        .partitions
        .iter()
        .map(|range| range.end)
        .max()
        .unwrap_or(0);
    log::info!(
        "starting plan: {} worker(s), {} group(s), mode {:?}",
        fleet_size,
        config.partitions.len(),
        config.mode
    );

    let pool = WorkerPool::new(
        (0..fleet_size)
            .map(|id| SimWorker::healthy(id, 16))
            .collect(),
    );
    let mut plan = ExecutionPlan::build(&pool, &config, Arc::new(LogObserver))?;

    let mut remaining = reports;
    while remaining > 0 {
        match plan.next_event().await {
            Some(PlanEvent::Metrics(report)) => {
                println!("{}", serde_json::to_string(&report)?);
                remaining -= 1;
            }
            Some(PlanEvent::GroupDegraded {
                group,
                lost_workers,
            }) => {
                log::warn!("{group} degraded, lost workers {lost_workers:?}");
            }
            Some(PlanEvent::GroupTerminated { group, reason }) => {
                log::warn!("{group} terminated: {reason}");
            }
            None => break,
        }
    }

    plan.join().await;
    Ok(())
}
