use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::control::ControlSequence;
use crate::error::{OptimizerError, RolloutFailure, SimulationError};
use crate::objective::Objective;
use crate::physics::RobotIndex;
use crate::sim::{Simulation, SimulationFactory};
use crate::value::ValueFunction;

/// Cooperative cancellation flag shared between the pool and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutSettings {
    pub robot: RobotIndex,
    pub horizon: usize,
    /// Physics steps each control is held for.
    pub interval: usize,
    /// Applied once per decision step.
    pub discount: f32,
}

/// Score of one successfully simulated candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutScore {
    /// Discounted rewards plus discounted terminal value.
    pub total: f32,
    /// Undiscounted reward of each decision step, summed over its physics steps.
    pub rewards: Vec<f32>,
    pub terminal_value: f32,
}

pub type RolloutOutcome = Result<RolloutScore, RolloutFailure>;

struct Worker<S> {
    id: usize,
    sim: S,
}

/// Fixed set of simulation clones scored in parallel on a dedicated rayon pool.
pub struct RolloutPool<S: Simulation> {
    workers: Vec<Worker<S>>,
    pool: rayon::ThreadPool,
    cancel: CancelHandle,
}

impl<S: Simulation> RolloutPool<S> {
    pub fn new<F>(factory: &F, worker_count: usize) -> Result<Self, OptimizerError>
    where
        F: SimulationFactory<Sim = S>,
    {
        let workers = (0..worker_count)
            .map(|id| factory.create().map(|sim| Worker { id, sim }))
            .collect::<Result<Vec<_>, _>>()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("rollout-{i}"))
            .build()
            .map_err(|e| OptimizerError::ThreadPool(e.to_string()))?;

        Ok(Self {
            workers,
            pool,
            cancel: CancelHandle::default(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Score every candidate from `start`. Blocks until all rollouts finish.
    ///
    /// Candidate `i` runs on worker `i % worker_count`, and outcomes come back
    /// in candidate order, so results do not depend on thread scheduling.
    pub fn evaluate_batch(
        &mut self,
        start: &S::Snapshot,
        candidates: &[ControlSequence],
        settings: &RolloutSettings,
        objective: &dyn Objective,
        value_fn: &dyn ValueFunction,
    ) -> Vec<RolloutOutcome> {
        let started = Instant::now();
        let sample_count = candidates.len();
        let stride = self.workers.len();
        let cancel = &self.cancel;
        let workers = &mut self.workers;

        let per_worker: Vec<Vec<(usize, RolloutOutcome)>> = self.pool.install(|| {
            workers
                .par_iter_mut()
                .map(|worker| {
                    (worker.id..sample_count)
                        .step_by(stride)
                        .map(|i| {
                            let outcome = rollout(
                                &mut worker.sim,
                                start,
                                &candidates[i],
                                settings,
                                objective,
                                value_fn,
                                cancel,
                            )
                            .map_err(|error| RolloutFailure {
                                sample: i,
                                worker: worker.id,
                                error,
                            });
                            (i, outcome)
                        })
                        .collect()
                })
                .collect()
        });

        let mut outcomes: Vec<(usize, RolloutOutcome)> = per_worker.into_iter().flatten().collect();
        outcomes.sort_by_key(|(i, _)| *i);

        let failed = outcomes.iter().filter(|(_, o)| o.is_err()).count();
        let steps = (sample_count * settings.horizon * settings.interval) as f64;
        debug!(
            samples = sample_count,
            failed,
            steps_per_sec = steps / started.elapsed().as_secs_f64().max(1e-9),
            "rollout batch finished"
        );

        outcomes.into_iter().map(|(_, o)| o).collect()
    }
}

impl<S: Simulation> Drop for RolloutPool<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Simulate one candidate for exactly `horizon * interval` physics steps.
pub fn rollout<S: Simulation>(
    sim: &mut S,
    start: &S::Snapshot,
    candidate: &ControlSequence,
    settings: &RolloutSettings,
    objective: &dyn Objective,
    value_fn: &dyn ValueFunction,
    cancel: &CancelHandle,
) -> Result<RolloutScore, SimulationError> {
    sim.restore(start);

    let mut total = 0.0f32;
    let mut discount = 1.0f32;
    let mut rewards = Vec::with_capacity(settings.horizon);

    for j in 0..settings.horizon {
        sim.set_joint_target_positions(settings.robot, candidate.step(j))?;
        let mut reward = 0.0f32;
        for _ in 0..settings.interval {
            if cancel.is_cancelled() {
                return Err(SimulationError::Cancelled);
            }
            sim.step()?;
            let r = objective.evaluate(&*sim, settings.robot);
            if !r.is_finite() {
                return Err(SimulationError::NonFiniteReward(r));
            }
            reward += r;
        }
        rewards.push(reward);
        total += discount * reward;
        discount *= settings.discount;
    }

    let terminal_value = value_fn.estimate(&*sim);
    if !terminal_value.is_finite() {
        return Err(SimulationError::NonFiniteReward(terminal_value));
    }
    total += discount * terminal_value;
    if !total.is_finite() {
        return Err(SimulationError::NonFiniteReward(total));
    }

    Ok(RolloutScore {
        total,
        rewards,
        terminal_value,
    })
}
