use rapier2d::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// Simulation constants
pub const DEFAULT_TIME_STEP: Real = 1.0 / 240.0;
pub const DEFAULT_GRAVITY: [Real; 2] = [0.0, -9.81];

// Collision groups
pub const GROUP_WORLD: u32 = 0b0001;
pub const GROUP_ROBOT: u32 = 0b0010;

// Anything beyond these is treated as numerical divergence
pub const MAX_ABS_COORDINATE: Real = 1.0e4;
pub const MAX_ABS_VELOCITY: Real = 1.0e3;

/// Index of a robot inside one simulation, in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RobotIndex(pub usize);

/// Index of a prop inside one simulation, in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropIndex(pub usize);

/// Kinematic state of a single rigid body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
    pub rotation: f32,
    pub angular_velocity: f32,
}

/// State of one actuated joint, measured relative to its rest rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointState {
    pub angle: f32,
    pub angular_velocity: f32,
    /// Torque applied by the joint motor during the last step.
    pub torque: f32,
}

/// Axis-aligned bounding box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb2 {
    pub lower: [f32; 2],
    pub upper: [f32; 2],
}

impl Aabb2 {
    pub fn merged(&self, other: &Aabb2) -> Aabb2 {
        Aabb2 {
            lower: [
                self.lower[0].min(other.lower[0]),
                self.lower[1].min(other.lower[1]),
            ],
            upper: [
                self.upper[0].max(other.upper[0]),
                self.upper[1].max(other.upper[1]),
            ],
        }
    }

    pub fn extents(&self) -> [f32; 2] {
        [self.upper[0] - self.lower[0], self.upper[1] - self.lower[1]]
    }
}

/// World-level physics settings shared by every simulation a factory builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub time_step: Real,
    pub gravity: [Real; 2],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_step: DEFAULT_TIME_STEP,
            gravity: DEFAULT_GRAVITY,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(ConfigError::InvalidTimeStep(self.time_step));
        }
        if !self.gravity.iter().all(|g| g.is_finite()) {
            return Err(ConfigError::InvalidGravity);
        }
        Ok(())
    }
}
