use rapier2d::{geometry::DefaultBroadPhase, prelude::*};
use std::sync::Arc;

use crate::error::SimulationError;
use crate::physics::{
    Aabb2, BodyState, JointState, PropIndex, RobotIndex, SimulationConfig, GROUP_ROBOT,
    GROUP_WORLD, MAX_ABS_COORDINATE, MAX_ABS_VELOCITY,
};
use crate::robot::{Prop, Robot, RobotInstance};

/// Read-only queries over a simulated world. Object safe, so objectives and
/// observation extractors can work against any simulation.
pub trait RobotState {
    fn robot_count(&self) -> usize;

    fn robot_dof_count(&self, robot: RobotIndex) -> Option<usize>;

    /// State of the robot's root link.
    fn base_state(&self, robot: RobotIndex) -> Option<BodyState>;

    fn joint_state(&self, robot: RobotIndex, joint: usize) -> Option<JointState>;

    fn robot_world_aabb(&self, robot: RobotIndex) -> Option<Aabb2>;

    /// Simulated seconds since construction.
    fn time(&self) -> f32;
}

/// A steppable world with exact save/restore.
pub trait Simulation: RobotState + Send {
    type Snapshot: Clone + Send + Sync;

    fn step(&mut self) -> Result<(), SimulationError>;

    fn set_joint_target_positions(
        &mut self,
        robot: RobotIndex,
        targets: &[f32],
    ) -> Result<(), SimulationError>;

    /// Capture the complete world state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Overwrite the world state. The snapshot must come from a simulation
    /// built the same way as this one.
    fn restore(&mut self, snapshot: &Self::Snapshot);

    /// Store a snapshot in the handle's own slot.
    fn save_state(&mut self);

    /// Return to the state captured by the last `save_state`. No-op if nothing
    /// was saved.
    fn restore_state(&mut self);
}

/// Map an angle into (-π, π].
fn wrap_angle(angle: Real) -> Real {
    let wrapped = angle.rem_euclid(std::f32::consts::TAU);
    if wrapped > std::f32::consts::PI {
        wrapped - std::f32::consts::TAU
    } else {
        wrapped
    }
}

/// Builds identical simulations, one per rollout worker.
pub trait SimulationFactory: Send + Sync {
    type Sim: Simulation;

    fn create(&self) -> Result<Self::Sim, SimulationError>;
}

#[derive(Clone)]
struct WorldState {
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    time: Real,
}

/// Full copy of a `RapierSimulation` world, including solver caches, so that
/// stepping after a restore reproduces the original run bit for bit.
#[derive(Clone)]
pub struct WorldSnapshot {
    state: Arc<WorldState>,
}

impl WorldSnapshot {
    pub fn time(&self) -> f32 {
        self.state.time
    }
}

pub struct RapierSimulation {
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    world: WorldState,
    robots: Vec<RobotInstance>,
    descriptions: Vec<Robot>,
    props: Vec<ColliderHandle>,
    saved: Option<WorldSnapshot>,
}

impl RapierSimulation {
    pub fn new(config: &SimulationConfig) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.time_step;

        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![config.gravity[0], config.gravity[1]],
            integration_parameters,
            world: WorldState {
                island_manager: IslandManager::new(),
                broad_phase: DefaultBroadPhase::new(),
                narrow_phase: NarrowPhase::new(),
                rigid_body_set: RigidBodySet::new(),
                collider_set: ColliderSet::new(),
                impulse_joint_set: ImpulseJointSet::new(),
                multibody_joint_set: MultibodyJointSet::new(),
                ccd_solver: CCDSolver::new(),
                time: 0.0,
            },
            robots: Vec::new(),
            descriptions: Vec::new(),
            props: Vec::new(),
            saved: None,
        }
    }

    pub fn time_step(&self) -> Real {
        self.integration_parameters.dt
    }

    pub fn add_prop(&mut self, prop: &Prop, position: [Real; 2], angle: Real) -> PropIndex {
        let builder = if prop.density > 0.0 {
            RigidBodyBuilder::dynamic()
        } else {
            RigidBodyBuilder::fixed()
        };
        let body = builder
            .translation(vector![position[0], position[1]])
            .rotation(angle)
            .build();
        let body_handle = self.world.rigid_body_set.insert(body);
        let collider = ColliderBuilder::cuboid(prop.half_extents[0], prop.half_extents[1])
            .density(prop.density.max(0.0))
            .friction(prop.friction)
            .restitution(0.0)
            .collision_groups(InteractionGroups::new(
                Group::from_bits_truncate(GROUP_WORLD),
                Group::from_bits_truncate(GROUP_ROBOT | GROUP_WORLD),
            ))
            .build();
        let handle = self.world.collider_set.insert_with_parent(
            collider,
            body_handle,
            &mut self.world.rigid_body_set,
        );
        self.props.push(handle);
        PropIndex(self.props.len() - 1)
    }

    pub fn add_robot(
        &mut self,
        robot: &Robot,
        position: [Real; 2],
        angle: Real,
    ) -> Result<RobotIndex, SimulationError> {
        robot.validate()?;
        let instance = RobotInstance::spawn(
            robot,
            vector![position[0], position[1]],
            angle,
            &mut self.world.rigid_body_set,
            &mut self.world.collider_set,
            &mut self.world.impulse_joint_set,
        );
        self.robots.push(instance);
        self.descriptions.push(robot.clone());
        Ok(RobotIndex(self.robots.len() - 1))
    }

    /// Index of the first robot spawned from a description equal to `robot`.
    pub fn find_robot_index(&self, robot: &Robot) -> Option<RobotIndex> {
        self.descriptions
            .iter()
            .position(|description| description == robot)
            .map(RobotIndex)
    }

    /// Vertical offset that puts the lowest point of `robot` at y = 0 when
    /// spawned at the origin.
    pub fn ground_offset(robot: &Robot, config: &SimulationConfig) -> Result<Real, SimulationError> {
        let mut probe = RapierSimulation::new(config);
        let idx = probe.add_robot(robot, [0.0, 0.0], 0.0)?;
        let aabb = probe
            .robot_world_aabb(idx)
            .ok_or(SimulationError::UnknownRobot(idx))?;
        Ok(-aabb.lower[1])
    }

    /// World-space state of every link of a robot, root first.
    pub fn link_states(&self, robot: RobotIndex) -> Option<Vec<BodyState>> {
        let instance = self.robots.get(robot.0)?;
        instance
            .links
            .iter()
            .map(|handle| self.body_state(*handle))
            .collect()
    }

    fn body_state(&self, handle: RigidBodyHandle) -> Option<BodyState> {
        self.world.rigid_body_set.get(handle).map(|body| BodyState {
            position: [body.translation().x, body.translation().y],
            velocity: [body.linvel().x, body.linvel().y],
            rotation: body.rotation().angle(),
            angular_velocity: body.angvel(),
        })
    }

    fn check_divergence(&self) -> Result<(), SimulationError> {
        let diverged = self.world.rigid_body_set.iter().any(|(_, body)| {
            let t = body.translation();
            let v = body.linvel();
            let finite = t.x.is_finite()
                && t.y.is_finite()
                && v.x.is_finite()
                && v.y.is_finite()
                && body.angvel().is_finite();
            !finite
                || t.x.abs() > MAX_ABS_COORDINATE
                || t.y.abs() > MAX_ABS_COORDINATE
                || v.norm() > MAX_ABS_VELOCITY
        });
        if diverged {
            Err(SimulationError::Diverged {
                time: self.world.time,
            })
        } else {
            Ok(())
        }
    }
}

impl RobotState for RapierSimulation {
    fn robot_count(&self) -> usize {
        self.robots.len()
    }

    fn robot_dof_count(&self, robot: RobotIndex) -> Option<usize> {
        self.robots.get(robot.0).map(RobotInstance::dof_count)
    }

    fn base_state(&self, robot: RobotIndex) -> Option<BodyState> {
        let root = *self.robots.get(robot.0)?.links.first()?;
        self.body_state(root)
    }

    fn joint_state(&self, robot: RobotIndex, joint: usize) -> Option<JointState> {
        let joint = self.robots.get(robot.0)?.joints.get(joint)?;
        let parent = self.world.rigid_body_set.get(joint.parent)?;
        let child = self.world.rigid_body_set.get(joint.child)?;
        let relative = (parent.rotation().inverse() * child.rotation()).angle();
        let angle = wrap_angle(relative - joint.rest_angle);
        let angular_velocity = child.angvel() - parent.angvel();

        let torque = self
            .world
            .impulse_joint_set
            .get(joint.handle)
            .and_then(|j| j.data.motor(JointAxis::AngX))
            .map(|motor| motor.impulse / self.integration_parameters.dt)
            .unwrap_or(0.0);

        Some(JointState {
            angle,
            angular_velocity,
            torque,
        })
    }

    fn robot_world_aabb(&self, robot: RobotIndex) -> Option<Aabb2> {
        let instance = self.robots.get(robot.0)?;
        instance
            .colliders
            .iter()
            .filter_map(|handle| self.world.collider_set.get(*handle))
            .map(|collider| {
                let aabb = collider.compute_aabb();
                Aabb2 {
                    lower: [aabb.mins.x, aabb.mins.y],
                    upper: [aabb.maxs.x, aabb.maxs.y],
                }
            })
            .reduce(|a, b| a.merged(&b))
    }

    fn time(&self) -> f32 {
        self.world.time
    }
}

impl Simulation for RapierSimulation {
    type Snapshot = WorldSnapshot;

    fn step(&mut self) -> Result<(), SimulationError> {
        let physics_hooks = ();
        let event_handler = ();
        let world = &mut self.world;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut world.island_manager,
            &mut world.broad_phase,
            &mut world.narrow_phase,
            &mut world.rigid_body_set,
            &mut world.collider_set,
            &mut world.impulse_joint_set,
            &mut world.multibody_joint_set,
            &mut world.ccd_solver,
            None,
            &physics_hooks,
            &event_handler,
        );
        world.time += self.integration_parameters.dt;
        self.check_divergence()
    }

    fn set_joint_target_positions(
        &mut self,
        robot: RobotIndex,
        targets: &[f32],
    ) -> Result<(), SimulationError> {
        let instance = self
            .robots
            .get(robot.0)
            .ok_or(SimulationError::UnknownRobot(robot))?;
        if targets.len() != instance.joints.len() {
            return Err(SimulationError::TargetCountMismatch {
                expected: instance.joints.len(),
                actual: targets.len(),
            });
        }

        for (joint, &target) in instance.joints.iter().zip(targets) {
            if let Some(j) = self.world.impulse_joint_set.get_mut(joint.handle, true) {
                let (stiffness, damping) = j
                    .data
                    .motor(JointAxis::AngX)
                    .map(|motor| (motor.stiffness, motor.damping))
                    .unwrap_or((0.0, 0.0));
                j.data
                    .set_motor_position(JointAxis::AngX, target, stiffness, damping);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            state: Arc::new(self.world.clone()),
        }
    }

    fn restore(&mut self, snapshot: &WorldSnapshot) {
        self.world = (*snapshot.state).clone();
    }

    fn save_state(&mut self) {
        self.saved = Some(self.snapshot());
    }

    fn restore_state(&mut self) {
        if let Some(saved) = self.saved.clone() {
            self.restore(&saved);
        }
    }
}

/// Builds a world containing a set of props and one robot, the same way every time.
#[derive(Debug, Clone)]
pub struct RapierSimulationFactory {
    config: SimulationConfig,
    robot: Arc<Robot>,
    robot_position: [Real; 2],
    props: Vec<(Prop, [Real; 2])>,
}

impl RapierSimulationFactory {
    pub fn new(config: SimulationConfig, robot: Arc<Robot>, robot_position: [Real; 2]) -> Self {
        Self {
            config,
            robot,
            robot_position,
            props: Vec::new(),
        }
    }

    pub fn with_prop(mut self, prop: Prop, position: [Real; 2]) -> Self {
        self.props.push((prop, position));
        self
    }

    pub fn robot(&self) -> &Robot {
        &self.robot
    }
}

impl SimulationFactory for RapierSimulationFactory {
    type Sim = RapierSimulation;

    fn create(&self) -> Result<RapierSimulation, SimulationError> {
        let mut sim = RapierSimulation::new(&self.config);
        for (prop, position) in &self.props {
            sim.add_prop(prop, *position, 0.0);
        }
        sim.add_robot(&self.robot, self.robot_position, 0.0)?;
        Ok(sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snake_on_floor() -> (RapierSimulation, RobotIndex) {
        let config = SimulationConfig::default();
        let robot = Robot::snake(5);
        let y = RapierSimulation::ground_offset(&robot, &config).unwrap();
        let mut sim = RapierSimulation::new(&config);
        sim.add_prop(&Prop::floor(), [0.0, -1.0], 0.0);
        let idx = sim.add_robot(&robot, [0.0, y], 0.0).unwrap();
        (sim, idx)
    }

    #[test]
    fn ground_offset_lifts_robot_to_zero() {
        let config = SimulationConfig::default();
        let robot = Robot::snake(3);
        let offset = RapierSimulation::ground_offset(&robot, &config).unwrap();
        assert!((offset - robot.link_radius).abs() < 1e-5);
    }

    #[test]
    fn joint_angle_is_continuous_across_pi() {
        let mut robot = Robot::snake(2);
        robot.links[1].joint_rot = 0.1;
        let mut sim = RapierSimulation::new(&SimulationConfig::default());
        let idx = sim
            .add_robot(&robot, [0.0, 0.0], std::f32::consts::PI - 0.05)
            .unwrap();
        let joint = sim.joint_state(idx, 0).unwrap();
        assert!(joint.angle.abs() < 1e-4, "rest pose angle {}", joint.angle);
    }

    #[test]
    fn wrap_angle_range() {
        use std::f32::consts::PI;
        assert!((wrap_angle(2.0 * PI - 0.1) + 0.1).abs() < 1e-5);
        assert!((wrap_angle(-2.0 * PI + 0.1) - 0.1).abs() < 1e-5);
        assert!((wrap_angle(PI) - PI).abs() < 1e-6);
        assert!((wrap_angle(0.3) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn dof_count_matches_description() {
        let (sim, idx) = snake_on_floor();
        assert_eq!(sim.find_robot_index(&Robot::snake(5)), Some(idx));
        assert_eq!(sim.find_robot_index(&Robot::snake(2)), None);
        assert_eq!(sim.robot_count(), 1);
        assert_eq!(sim.robot_dof_count(idx), Some(4));
        assert_eq!(sim.robot_dof_count(RobotIndex(3)), None);
    }

    #[test]
    fn wrong_target_count_is_rejected() {
        let (mut sim, idx) = snake_on_floor();
        let err = sim.set_joint_target_positions(idx, &[0.0; 2]).unwrap_err();
        assert_eq!(
            err,
            SimulationError::TargetCountMismatch {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn stepping_advances_time() {
        let (mut sim, idx) = snake_on_floor();
        sim.set_joint_target_positions(idx, &[0.3, -0.3, 0.3, -0.3]).unwrap();
        for _ in 0..10 {
            sim.step().unwrap();
        }
        assert!((sim.time() - 10.0 * sim.time_step()).abs() < 1e-6);
    }

    #[test]
    fn restore_state_is_exact() {
        let (mut sim, idx) = snake_on_floor();
        sim.save_state();
        let before_aabb = sim.robot_world_aabb(idx).unwrap();
        let before_links = sim.link_states(idx).unwrap();

        sim.set_joint_target_positions(idx, &[1.0, -1.0, 1.0, -1.0]).unwrap();
        for _ in 0..60 {
            sim.step().unwrap();
        }
        assert_ne!(sim.link_states(idx).unwrap(), before_links);

        sim.restore_state();
        assert_eq!(sim.robot_world_aabb(idx).unwrap(), before_aabb);
        assert_eq!(sim.link_states(idx).unwrap(), before_links);
        assert_eq!(sim.time(), 0.0);
    }

    #[test]
    fn replay_after_restore_is_bit_identical() {
        let (mut sim, idx) = snake_on_floor();
        let start = sim.snapshot();
        let targets = [0.5, -0.2, 0.1, 0.4];

        let run = |sim: &mut RapierSimulation| {
            sim.set_joint_target_positions(idx, &targets).unwrap();
            for _ in 0..40 {
                sim.step().unwrap();
            }
            sim.link_states(idx).unwrap()
        };

        let first = run(&mut sim);
        sim.restore(&start);
        let second = run(&mut sim);
        assert_eq!(first, second);
    }
}
