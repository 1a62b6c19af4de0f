use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::control::{AdvanceFill, ControlSequence};
use crate::error::{ConfigError, EstimatorError, OptimizerError, RolloutFailure, SimulationError};
use crate::objective::Objective;
use crate::physics::RobotIndex;
use crate::rollout::{CancelHandle, RolloutPool, RolloutSettings};
use crate::sim::{Simulation, SimulationFactory};
use crate::value::{TrainReport, ValueEstimator};

/// Optimizer settings. Defaults follow the reference snake experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Inverse temperature of the exponential sample weighting.
    pub kappa: f32,
    pub discount_factor: f32,
    pub dof_count: usize,
    pub interval: usize,
    pub horizon: usize,
    pub sample_count: usize,
    pub thread_count: usize,
    pub seed: u64,
    pub noise_std: f32,
    pub control_limit: Option<f32>,
    pub advance_fill: AdvanceFill,
    /// Keep sample 0 unperturbed so the current nominal is always scored.
    pub include_nominal: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kappa: 100.0,
            discount_factor: 0.99,
            dof_count: 4,
            interval: 4,
            horizon: 64,
            sample_count: 128,
            thread_count: 16,
            seed: 0,
            noise_std: 0.5,
            control_limit: None,
            advance_fill: AdvanceFill::Last,
            include_nominal: true,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.kappa.is_finite() && self.kappa > 0.0) {
            return Err(ConfigError::InvalidKappa(self.kappa));
        }
        if !(self.discount_factor > 0.0 && self.discount_factor <= 1.0) {
            return Err(ConfigError::InvalidDiscount(self.discount_factor));
        }
        if self.dof_count == 0 {
            return Err(ConfigError::InvalidDofCount(self.dof_count));
        }
        if self.interval == 0 {
            return Err(ConfigError::InvalidInterval(self.interval));
        }
        if self.horizon == 0 {
            return Err(ConfigError::InvalidHorizon(self.horizon));
        }
        if self.sample_count == 0 {
            return Err(ConfigError::InvalidSampleCount(self.sample_count));
        }
        if self.thread_count == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.thread_count));
        }
        if !(self.noise_std.is_finite() && self.noise_std >= 0.0) {
            return Err(ConfigError::InvalidNoise(self.noise_std));
        }
        if let Some(limit) = self.control_limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(ConfigError::InvalidControlLimit(limit));
            }
        }
        Ok(())
    }
}

/// Summary of one `update()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    pub samples: usize,
    pub failures: Vec<RolloutFailure>,
    pub best_return: f32,
    pub mean_return: f32,
    /// `(Σw)² / Σw²` over the successful samples.
    pub effective_sample_size: f32,
}

impl UpdateReport {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Sampling-based receding horizon optimizer over joint position targets.
///
/// Holds a nominal control sequence. Each `update()` perturbs it, scores the
/// perturbations on worker simulations and replaces it with their
/// exponentially weighted average. `advance()` moves the window forward
/// without stepping anything; the committed controls are replayed on an
/// internal reference simulation at the next update.
pub struct MppiOptimizer<S: Simulation, E: ValueEstimator> {
    config: OptimizerConfig,
    robot: RobotIndex,
    objective: Arc<dyn Objective>,
    estimator: E,
    reference: S,
    start: Arc<S::Snapshot>,
    committed: Vec<Vec<f32>>,
    pool: RolloutPool<S>,
    nominal: ControlSequence,
    noise: Normal<f32>,
    rng: ChaCha8Rng,
    step_count: usize,
    update_count: usize,
}

impl<S: Simulation, E: ValueEstimator> MppiOptimizer<S, E> {
    pub fn new<F>(
        config: OptimizerConfig,
        factory: &F,
        objective: Arc<dyn Objective>,
        estimator: E,
        robot: RobotIndex,
    ) -> Result<Self, OptimizerError>
    where
        F: SimulationFactory<Sim = S>,
    {
        config.validate()?;
        let noise = Normal::new(0.0, config.noise_std)
            .map_err(|_| ConfigError::InvalidNoise(config.noise_std))?;

        let reference = factory.create()?;
        let actual = reference
            .robot_dof_count(robot)
            .ok_or(SimulationError::UnknownRobot(robot))?;
        if actual != config.dof_count {
            return Err(ConfigError::DofMismatch {
                robot,
                expected: config.dof_count,
                actual,
            }
            .into());
        }

        let start = Arc::new(reference.snapshot());
        let pool = RolloutPool::new(factory, config.thread_count)?;
        let nominal = ControlSequence::zeros(config.dof_count, config.horizon);
        let rng = Self::stream(config.seed, 0);

        Ok(Self {
            config,
            robot,
            objective,
            estimator,
            reference,
            start,
            committed: Vec::new(),
            pool,
            nominal,
            noise,
            rng,
            step_count: 0,
            update_count: 0,
        })
    }

    fn stream(seed: u64, step: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(step as u64);
        rng
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn robot(&self) -> RobotIndex {
        self.robot
    }

    /// Nominal controls, `horizon` steps of `dof_count` joint targets.
    pub fn input_sequence(&self) -> &ControlSequence {
        &self.nominal
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn update_count(&self) -> usize {
        self.update_count
    }

    pub fn value_estimator(&self) -> &E {
        &self.estimator
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.pool.cancel_handle()
    }

    /// Replay committed controls so the rollout start matches the caller's world.
    fn sync_start(&mut self) -> Result<(), OptimizerError> {
        if self.committed.is_empty() {
            return Ok(());
        }
        // committed controls and start stay untouched until the replay succeeds
        self.reference.restore(&self.start);
        for control in &self.committed {
            self.reference.set_joint_target_positions(self.robot, control)?;
            for _ in 0..self.config.interval {
                self.reference.step()?;
            }
        }
        self.start = Arc::new(self.reference.snapshot());
        self.committed.clear();
        Ok(())
    }

    fn sample_candidates(&mut self) -> Vec<ControlSequence> {
        (0..self.config.sample_count)
            .map(|i| {
                let mut candidate = self.nominal.clone();
                if !(self.config.include_nominal && i == 0) {
                    for v in candidate.as_mut_slice() {
                        *v += self.noise.sample(&mut self.rng);
                    }
                }
                if let Some(limit) = self.config.control_limit {
                    candidate.clamp(limit);
                }
                candidate
            })
            .collect()
    }

    /// Run one sampling round and refine the nominal sequence.
    ///
    /// Failed samples are excluded from the average and listed in the report.
    /// If every sample fails the nominal sequence is left as it was.
    pub fn update(&mut self) -> Result<UpdateReport, OptimizerError> {
        let cancel = self.pool.cancel_handle();
        if cancel.is_cancelled() {
            return Err(OptimizerError::Cancelled);
        }
        self.sync_start()?;

        let value_fn = self.estimator.snapshot();
        let candidates = self.sample_candidates();
        let settings = RolloutSettings {
            robot: self.robot,
            horizon: self.config.horizon,
            interval: self.config.interval,
            discount: self.config.discount_factor,
        };
        let outcomes = self.pool.evaluate_batch(
            &self.start,
            &candidates,
            &settings,
            self.objective.as_ref(),
            value_fn.as_ref(),
        );
        if cancel.is_cancelled() {
            return Err(OptimizerError::Cancelled);
        }

        let mut scored = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (candidate, outcome) in candidates.iter().zip(outcomes) {
            match outcome {
                Ok(score) => scored.push((candidate, score.total)),
                Err(failure) => failures.push(failure),
            }
        }

        let samples = candidates.len();
        if scored.is_empty() {
            warn!(samples, update = self.update_count, "all rollouts failed, nominal kept");
            return Err(OptimizerError::AllSamplesFailed { samples, failures });
        }

        let best_return = scored.iter().map(|(_, r)| *r).fold(f32::NEG_INFINITY, f32::max);
        let mean_return = scored.iter().map(|(_, r)| *r).sum::<f32>() / scored.len() as f32;

        let mut next = ControlSequence::zeros(self.config.dof_count, self.config.horizon);
        let mut weight_sum = 0.0f32;
        let mut weight_sq_sum = 0.0f32;
        for (candidate, ret) in &scored {
            // best sample has weight 1, so the sum never underflows to zero
            let w = (self.config.kappa * (ret - best_return)).exp();
            weight_sum += w;
            weight_sq_sum += w * w;
            for (acc, v) in next.as_mut_slice().iter_mut().zip(candidate.as_slice()) {
                *acc += w * v;
            }
        }
        for v in next.as_mut_slice() {
            *v /= weight_sum;
        }
        self.nominal = next;
        self.update_count += 1;

        let report = UpdateReport {
            samples,
            failures,
            best_return,
            mean_return,
            effective_sample_size: weight_sum * weight_sum / weight_sq_sum,
        };
        if report.is_degraded() {
            warn!(
                failed = report.failures.len(),
                samples,
                first = %report.failures[0],
                "update degraded by failed rollouts"
            );
        }
        debug!(
            update = self.update_count,
            best = report.best_return,
            mean = report.mean_return,
            ess = report.effective_sample_size,
            "update finished"
        );
        Ok(report)
    }

    /// Commit the first `steps` controls and slide the horizon forward.
    pub fn advance(&mut self, steps: usize) -> Result<(), OptimizerError> {
        if steps > self.config.horizon {
            return Err(OptimizerError::InvalidAdvance {
                steps,
                horizon: self.config.horizon,
            });
        }
        if steps == 0 {
            return Ok(());
        }
        let dropped = self.nominal.shift(steps, self.config.advance_fill);
        self.committed.extend(dropped);
        self.step_count += steps;
        self.rng = Self::stream(self.config.seed, self.step_count);
        Ok(())
    }

    /// Train the value estimator. Takes `&mut self`, so it never overlaps an update.
    pub fn train_value_estimator(
        &mut self,
        observations: &[f32],
        returns: &[f32],
    ) -> Result<TrainReport, EstimatorError> {
        self.estimator.train(observations, returns).inspect_err(|e| {
            warn!(error = %e, "value estimator training skipped");
        })
    }
}
