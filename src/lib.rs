pub mod config;
pub mod control;
pub mod error;
pub mod objective;
pub mod observation;
pub mod optimizer;
pub mod physics;
pub mod robot;
pub mod rollout;
pub mod sim;
pub mod value;

// Re-export public items
pub use config::{ConfigLoadError, ExperimentConfig};
pub use control::{AdvanceFill, ControlSequence};
pub use error::{
    ConfigError, EstimatorError, OptimizerError, RolloutFailure, SimulationError,
};
pub use objective::{Objective, SumOfSquaresObjective};
pub use observation::{
    flatten_sense, AngleSense, BaseSense, JointSense, ObservationExtractor, RobotSense,
    VelocitySense, BASE_SENSE_SIZE,
};
pub use optimizer::{MppiOptimizer, OptimizerConfig, UpdateReport};
pub use physics::{
    Aabb2, BodyState, JointState, PropIndex, RobotIndex, SimulationConfig, DEFAULT_GRAVITY,
    DEFAULT_TIME_STEP,
};
pub use robot::{JointType, Link, MotorParams, Prop, Robot};
pub use rollout::{CancelHandle, RolloutOutcome, RolloutPool, RolloutScore, RolloutSettings};
pub use sim::{
    RapierSimulation, RapierSimulationFactory, RobotState, Simulation, SimulationFactory,
    WorldSnapshot,
};
pub use value::{
    discounted_returns, FcValueEstimator, NullValueEstimator, TrainReport, ValueEstimator,
    ValueEstimatorConfig, ValueFunction, ValueSnapshot,
};
