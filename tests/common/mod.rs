#![allow(dead_code)]

use planar_mppi::{
    Aabb2, BodyState, JointState, RobotIndex, RobotState, Simulation, SimulationError,
    SimulationFactory,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const TOY_TIME_STEP: f32 = 0.1;

/// A first-order toy world: joints track their targets, the base moves with
/// the mean joint angle.
#[derive(Debug, Clone, PartialEq)]
pub struct ToyState {
    pub x: f32,
    pub v: f32,
    pub q: Vec<f32>,
    pub targets: Vec<f32>,
    pub time: f32,
}

pub struct ToySim {
    state: ToyState,
    saved: Option<ToyState>,
    fail_above: f32,
    fail_at_step: Option<usize>,
    steps: Arc<AtomicUsize>,
}

impl RobotState for ToySim {
    fn robot_count(&self) -> usize {
        1
    }

    fn robot_dof_count(&self, robot: RobotIndex) -> Option<usize> {
        (robot.0 == 0).then_some(self.state.q.len())
    }

    fn base_state(&self, robot: RobotIndex) -> Option<BodyState> {
        (robot.0 == 0).then_some(BodyState {
            position: [self.state.x, 0.0],
            velocity: [self.state.v, 0.0],
            rotation: 0.0,
            angular_velocity: 0.0,
        })
    }

    fn joint_state(&self, robot: RobotIndex, joint: usize) -> Option<JointState> {
        if robot.0 != 0 {
            return None;
        }
        self.state.q.get(joint).map(|&angle| JointState {
            angle,
            angular_velocity: 0.0,
            torque: 0.0,
        })
    }

    fn robot_world_aabb(&self, robot: RobotIndex) -> Option<Aabb2> {
        (robot.0 == 0).then_some(Aabb2 {
            lower: [self.state.x - 0.5, -0.5],
            upper: [self.state.x + 0.5, 0.5],
        })
    }

    fn time(&self) -> f32 {
        self.state.time
    }
}

impl Simulation for ToySim {
    type Snapshot = ToyState;

    fn step(&mut self) -> Result<(), SimulationError> {
        let n = self.steps.fetch_add(1, Ordering::Relaxed);
        if self.fail_at_step == Some(n) {
            return Err(SimulationError::Fault(format!("injected fault at step {n}")));
        }
        if self.state.targets.iter().any(|t| t.abs() > self.fail_above) {
            return Err(SimulationError::Diverged { time: self.state.time });
        }
        let state = &mut self.state;
        for (q, t) in state.q.iter_mut().zip(&state.targets) {
            *q += 0.5 * (t - *q);
        }
        state.v = state.q.iter().sum::<f32>() / state.q.len() as f32;
        state.x += state.v * TOY_TIME_STEP;
        state.time += TOY_TIME_STEP;
        Ok(())
    }

    fn set_joint_target_positions(
        &mut self,
        robot: RobotIndex,
        targets: &[f32],
    ) -> Result<(), SimulationError> {
        if robot.0 != 0 {
            return Err(SimulationError::UnknownRobot(robot));
        }
        if targets.len() != self.state.targets.len() {
            return Err(SimulationError::TargetCountMismatch {
                expected: self.state.targets.len(),
                actual: targets.len(),
            });
        }
        self.state.targets.copy_from_slice(targets);
        Ok(())
    }

    fn snapshot(&self) -> ToyState {
        self.state.clone()
    }

    fn restore(&mut self, snapshot: &ToyState) {
        self.state = snapshot.clone();
    }

    fn save_state(&mut self) {
        self.saved = Some(self.state.clone());
    }

    fn restore_state(&mut self) {
        if let Some(saved) = self.saved.clone() {
            self.state = saved;
        }
    }
}

/// Builds toy worlds. Steps fail while any joint target exceeds `fail_above`,
/// and the `fail_at_step`-th step counted across all worlds fails once.
pub struct ToyFactory {
    pub dof: usize,
    pub fail_above: f32,
    pub fail_at_step: Option<usize>,
    pub steps: Arc<AtomicUsize>,
}

impl ToyFactory {
    pub fn new(dof: usize) -> Self {
        Self {
            dof,
            fail_above: f32::INFINITY,
            fail_at_step: None,
            steps: Arc::default(),
        }
    }

    pub fn failing_above(mut self, threshold: f32) -> Self {
        self.fail_above = threshold;
        self
    }

    pub fn failing_once_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.load(Ordering::Relaxed)
    }
}

impl SimulationFactory for ToyFactory {
    type Sim = ToySim;

    fn create(&self) -> Result<ToySim, SimulationError> {
        Ok(ToySim {
            state: ToyState {
                x: 0.0,
                v: 0.0,
                q: vec![0.0; self.dof],
                targets: vec![0.0; self.dof],
                time: 0.0,
            },
            saved: None,
            fail_above: self.fail_above,
            fail_at_step: self.fail_at_step,
            steps: self.steps.clone(),
        })
    }
}

/// Reward for forward base velocity.
pub fn forward_velocity(sim: &dyn RobotState, robot: RobotIndex) -> f32 {
    sim.base_state(robot).map(|b| b.velocity[0]).unwrap_or(0.0)
}
