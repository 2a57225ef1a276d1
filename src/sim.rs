//! In-process simulated workers.
//!
//! Used by the demo binary to exercise a full plan without a real remote
//! fleet, and by the test suite as scripted fixtures. The "policy" is a
//! small weight vector; losses shrink with every training call so runs
//! look like convergence in the logs.

use std::{
    sync::Mutex,
    time::Duration,
};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    error::WorkerError,
    metrics::TrainMetrics,
    rollout::{GradientUpdate, RolloutBatch, RolloutFragment, Transition, WeightBlob},
    worker::RolloutWorker,
};

const OBS_DIM: usize = 4;

struct SimState {
    rng: StdRng,
    weights: WeightBlob,
    train_calls: usize,
    fail_collects_left: usize,
}

/// A worker simulated in-process.
///
/// `id` must match the worker's index in the pool it is registered with,
/// since produced fragments and gradients carry it as the producer id.
pub struct SimWorker {
    id: usize,
    fragment_len: usize,
    sample_delay: Duration,
    diverging: bool,
    state: Mutex<SimState>,
}

impl SimWorker {
    fn new(id: usize, fragment_len: usize, diverging: bool, fail_collects: usize) -> Self {
        Self {
            id,
            fragment_len,
            sample_delay: Duration::ZERO,
            diverging,
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(id as u64),
                weights: WeightBlob::new(0, vec![0.0; OBS_DIM]),
                train_calls: 0,
                fail_collects_left: fail_collects,
            }),
        }
    }

    /// A worker that always succeeds.
    pub fn healthy(id: usize, fragment_len: usize) -> Self {
        Self::new(id, fragment_len, false, 0)
    }

    /// A worker whose first `failures` collection calls (`sample` or
    /// `compute_gradients`) fail.
    pub fn failing(id: usize, fragment_len: usize, failures: usize) -> Self {
        Self::new(id, fragment_len, false, failures)
    }

    /// A worker whose losses come back non-finite.
    pub fn diverging(id: usize, fragment_len: usize) -> Self {
        Self::new(id, fragment_len, true, 0)
    }

    /// Adds a fixed latency to every `sample()` call.
    pub fn with_sample_delay(mut self, delay: Duration) -> Self {
        self.sample_delay = delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim worker state poisoned")
    }

    fn loss(&self, train_calls: usize) -> f64 {
        if self.diverging {
            f64::NAN
        } else {
            1.0 / (1.0 + train_calls as f64)
        }
    }
}

impl RolloutWorker for SimWorker {
    async fn sample(&self) -> Result<RolloutFragment, WorkerError> {
        if !self.sample_delay.is_zero() {
            tokio::time::sleep(self.sample_delay).await;
        }
        let mut state = self.lock();
        if state.fail_collects_left > 0 {
            state.fail_collects_left -= 1;
            return Err(WorkerError::new(format!(
                "simulated sample failure on worker {}",
                self.id
            )));
        }
        let mut transitions = Vec::with_capacity(self.fragment_len);
        for step in 0..self.fragment_len {
            let state_vec: Vec<f32> = (0..OBS_DIM).map(|_| state.rng.random_range(-1.0..1.0)).collect();
            let next: Vec<f32> = (0..OBS_DIM).map(|_| state.rng.random_range(-1.0..1.0)).collect();
            let action = vec![state.rng.random_range(0.0..1.0)];
            let reward = state.rng.random_range(0.0..1.0);
            let mut transition = Transition::new(state_vec, action, reward, next);
            transition.done = step + 1 == self.fragment_len;
            transitions.push(transition);
        }
        Ok(RolloutFragment::new(self.id, transitions))
    }

    async fn compute_gradients(&self) -> Result<GradientUpdate, WorkerError> {
        if !self.sample_delay.is_zero() {
            tokio::time::sleep(self.sample_delay).await;
        }
        let mut state = self.lock();
        if state.fail_collects_left > 0 {
            state.fail_collects_left -= 1;
            return Err(WorkerError::new(format!(
                "simulated gradient failure on worker {}",
                self.id
            )));
        }
        let gradient: Vec<f32> = (0..OBS_DIM).map(|_| state.rng.random_range(-0.1..0.1)).collect();
        let version = state.weights.version;
        let loss = self.loss(state.train_calls);
        state.train_calls += 1;
        Ok(GradientUpdate {
            worker_id: self.id,
            gradient: WeightBlob::new(version, gradient),
            samples: self.fragment_len,
            loss,
        })
    }

    async fn train_step(&self, batch: &RolloutBatch) -> Result<TrainMetrics, WorkerError> {
        let mut state = self.lock();
        let loss = self.loss(state.train_calls);
        state.train_calls += 1;
        state.weights.version += 1;
        let grad_norm = state.rng.random_range(0.0..1.0);
        Ok(TrainMetrics::new(loss, batch.steps()).with_grad_norm(grad_norm))
    }

    async fn apply_gradients(&self, update: &GradientUpdate) -> Result<(), WorkerError> {
        let mut state = self.lock();
        for (weight, delta) in state.weights.payload.iter_mut().zip(&update.gradient.payload) {
            *weight -= delta;
        }
        state.weights.version += 1;
        Ok(())
    }

    async fn get_weights(&self) -> Result<WeightBlob, WorkerError> {
        Ok(self.lock().weights.clone())
    }

    async fn set_weights(&self, blob: &WeightBlob) -> Result<(), WorkerError> {
        self.lock().weights = blob.clone();
        Ok(())
    }
}
