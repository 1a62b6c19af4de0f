use serde::{Deserialize, Serialize};

use crate::physics::RobotIndex;
use crate::sim::RobotState;

/// Per-step reward of a simulation state. Higher is better.
pub trait Objective: Send + Sync {
    fn evaluate(&self, sim: &dyn RobotState, robot: RobotIndex) -> f32;
}

impl<F> Objective for F
where
    F: Fn(&dyn RobotState, RobotIndex) -> f32 + Send + Sync,
{
    fn evaluate(&self, sim: &dyn RobotState, robot: RobotIndex) -> f32 {
        self(sim, robot)
    }
}

/// Negative weighted squared deviation of the base velocity from a reference,
/// minus a penalty on mechanical joint power.
///
/// Base velocity is ordered `[angular, x, y]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SumOfSquaresObjective {
    pub base_vel_ref: [f32; 3],
    pub base_vel_weight: [f32; 3],
    pub power_weight: f32,
}

impl Default for SumOfSquaresObjective {
    fn default() -> Self {
        Self {
            base_vel_ref: [0.0, 1.0, 0.0],
            base_vel_weight: [1.0; 3],
            power_weight: 1.0e-4,
        }
    }
}

impl SumOfSquaresObjective {
    fn joint_power(sim: &dyn RobotState, robot: RobotIndex) -> f32 {
        let dof = sim.robot_dof_count(robot).unwrap_or(0);
        (0..dof)
            .filter_map(|j| sim.joint_state(robot, j))
            .map(|joint| (joint.torque * joint.angular_velocity).abs())
            .sum()
    }
}

impl Objective for SumOfSquaresObjective {
    fn evaluate(&self, sim: &dyn RobotState, robot: RobotIndex) -> f32 {
        let Some(base) = sim.base_state(robot) else {
            return 0.0;
        };
        let vel = [base.angular_velocity, base.velocity[0], base.velocity[1]];
        let deviation: f32 = vel
            .iter()
            .zip(&self.base_vel_ref)
            .zip(&self.base_vel_weight)
            .map(|((v, r), w)| w * (v - r) * (v - r))
            .sum();

        let power = if self.power_weight != 0.0 {
            self.power_weight * Self::joint_power(sim, robot)
        } else {
            0.0
        };
        -(deviation + power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{Aabb2, BodyState, JointState};
    use approx::assert_relative_eq;

    struct Moving {
        velocity: [f32; 2],
        angular_velocity: f32,
    }

    impl RobotState for Moving {
        fn robot_count(&self) -> usize {
            1
        }
        fn robot_dof_count(&self, _robot: RobotIndex) -> Option<usize> {
            Some(1)
        }
        fn base_state(&self, _robot: RobotIndex) -> Option<BodyState> {
            Some(BodyState {
                position: [0.0, 0.0],
                velocity: self.velocity,
                rotation: 0.0,
                angular_velocity: self.angular_velocity,
            })
        }
        fn joint_state(&self, _robot: RobotIndex, _joint: usize) -> Option<JointState> {
            Some(JointState {
                angle: 0.0,
                angular_velocity: 2.0,
                torque: -3.0,
            })
        }
        fn robot_world_aabb(&self, _robot: RobotIndex) -> Option<Aabb2> {
            None
        }
        fn time(&self) -> f32 {
            0.0
        }
    }

    #[test]
    fn matching_reference_costs_only_power() {
        let objective = SumOfSquaresObjective::default();
        let sim = Moving {
            velocity: [1.0, 0.0],
            angular_velocity: 0.0,
        };
        assert_relative_eq!(objective.evaluate(&sim, RobotIndex(0)), -6.0e-4);
    }

    #[test]
    fn deviation_is_weighted_and_squared() {
        let objective = SumOfSquaresObjective {
            base_vel_ref: [0.0, 1.0, 0.0],
            base_vel_weight: [2.0, 1.0, 0.5],
            power_weight: 0.0,
        };
        let sim = Moving {
            velocity: [3.0, 2.0],
            angular_velocity: 1.0,
        };
        // 2*1 + 1*4 + 0.5*4
        assert_relative_eq!(objective.evaluate(&sim, RobotIndex(0)), -8.0);
    }

    #[test]
    fn closures_are_objectives() {
        let objective = |sim: &dyn RobotState, robot: RobotIndex| {
            sim.base_state(robot).map(|b| b.velocity[0]).unwrap_or(0.0)
        };
        let sim = Moving {
            velocity: [0.75, 0.0],
            angular_velocity: 0.0,
        };
        assert_relative_eq!(Objective::evaluate(&objective, &sim, RobotIndex(0)), 0.75);
    }
}
