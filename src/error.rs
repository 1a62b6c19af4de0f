//! Error types for simulation, rollout and optimization.

use thiserror::Error;

use crate::physics::RobotIndex;

/// Invalid settings, rejected before anything is built.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("horizon must be at least 1, got {0}")]
    InvalidHorizon(usize),

    #[error("interval must be at least 1, got {0}")]
    InvalidInterval(usize),

    #[error("dof count must be at least 1, got {0}")]
    InvalidDofCount(usize),

    #[error("sample count must be at least 1, got {0}")]
    InvalidSampleCount(usize),

    #[error("worker count must be at least 1, got {0}")]
    InvalidWorkerCount(usize),

    #[error("discount factor must lie in (0, 1], got {0}")]
    InvalidDiscount(f32),

    #[error("kappa must be finite and positive, got {0}")]
    InvalidKappa(f32),

    #[error("noise standard deviation must be finite and non-negative, got {0}")]
    InvalidNoise(f32),

    #[error("control limit must be finite and positive, got {0}")]
    InvalidControlLimit(f32),

    #[error("time step must be finite and positive, got {0}")]
    InvalidTimeStep(f32),

    #[error("gravity must be finite")]
    InvalidGravity,

    #[error("invalid value estimator setting: {0}")]
    InvalidEstimator(String),

    #[error("simulation reports {actual} dofs for robot {robot:?}, optimizer configured for {expected}")]
    DofMismatch {
        robot: RobotIndex,
        expected: usize,
        actual: usize,
    },
}

/// Failures raised by a simulation handle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("simulation diverged at t = {time:.4}s")]
    Diverged { time: f32 },

    #[error("unknown robot {0:?}")]
    UnknownRobot(RobotIndex),

    #[error("expected {expected} joint targets, got {actual}")]
    TargetCountMismatch { expected: usize, actual: usize },

    #[error("invalid robot description: {0}")]
    InvalidRobot(String),

    #[error("non-finite objective value {0}")]
    NonFiniteReward(f32),

    #[error("rollout cancelled")]
    Cancelled,

    #[error("simulation fault: {0}")]
    Fault(String),
}

/// One candidate that could not be scored. The batch carries on without it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sample {sample} failed on worker {worker}: {error}")]
pub struct RolloutFailure {
    pub sample: usize,
    pub worker: usize,
    pub error: SimulationError,
}

/// Value estimator training or persistence failures. Never fatal to the optimizer.
#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("observation batch has {observations} floats, expected {expected} ({rows} rows)")]
    ShapeMismatch {
        observations: usize,
        expected: usize,
        rows: usize,
    },

    #[error("empty training batch")]
    EmptyBatch,

    #[error("training produced a non-finite loss ({0}); parameters kept")]
    NonFiniteLoss(f32),

    #[error("checkpoint has {actual} bytes, expected {expected}")]
    CheckpointSize { actual: usize, expected: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the optimizer.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error("failed to build worker thread pool: {0}")]
    ThreadPool(String),

    #[error("cannot advance by {steps} steps with a horizon of {horizon}")]
    InvalidAdvance { steps: usize, horizon: usize },

    #[error("all {samples} rollouts failed; nominal sequence left unchanged")]
    AllSamplesFailed {
        samples: usize,
        failures: Vec<RolloutFailure>,
    },

    #[error("optimizer was cancelled")]
    Cancelled,

    #[error(transparent)]
    Estimator(#[from] EstimatorError),
}
