use rapier2d::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SimulationError;
use crate::physics::{GROUP_ROBOT, GROUP_WORLD};

// Robot defaults
pub const LINK_DENSITY: Real = 10.0;
pub const LINK_RADIUS: Real = 0.05;
pub const LINK_FRICTION: Real = 0.9;
pub const LINK_LENGTH: Real = 0.5;
pub const LINK_LINEAR_DAMPING: Real = 0.05;
pub const LINK_ANGULAR_DAMPING: Real = 0.05;

// Joint motor defaults
pub const JOINT_STIFFNESS: Real = 20.0;
pub const JOINT_DAMPING: Real = 2.0;
pub const JOINT_MAX_FORCE: Real = 50.0;
pub const JOINT_LIMIT: Real = std::f32::consts::PI * 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JointType {
    /// Unconstrained. Only valid for the root link.
    Free,
    /// Actuated revolute joint, one degree of freedom.
    Hinge,
    /// Rigid attachment to the parent.
    Fixed,
}

/// One capsule-shaped link. The link frame starts at the joint and runs along +x.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub parent: Option<usize>,
    pub joint_type: JointType,
    /// Attachment point as a fraction of the parent's length, 0 = start, 1 = tip.
    pub joint_pos: Real,
    /// Rest rotation relative to the parent, in radians.
    pub joint_rot: Real,
    pub length: Real,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorParams {
    pub stiffness: Real,
    pub damping: Real,
    pub max_force: Real,
    pub limit: Real,
}

impl Default for MotorParams {
    fn default() -> Self {
        Self {
            stiffness: JOINT_STIFFNESS,
            damping: JOINT_DAMPING,
            max_force: JOINT_MAX_FORCE,
            limit: JOINT_LIMIT,
        }
    }
}

/// A planar articulated robot: a tree of links rooted at `links[0]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub link_density: Real,
    pub link_radius: Real,
    pub friction: Real,
    pub motor: MotorParams,
    pub links: Vec<Link>,
}

impl Robot {
    pub fn new(link_density: Real, link_radius: Real, friction: Real) -> Self {
        Self {
            link_density,
            link_radius,
            friction,
            motor: MotorParams::default(),
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// A straight chain of `link_count` links, a free root followed by hinges.
    pub fn snake(link_count: usize) -> Self {
        (0..link_count).fold(
            Self::new(LINK_DENSITY, LINK_RADIUS, LINK_FRICTION),
            |robot, i| {
                robot.with_link(Link {
                    parent: i.checked_sub(1),
                    joint_type: if i == 0 { JointType::Free } else { JointType::Hinge },
                    joint_pos: 1.0,
                    joint_rot: 0.0,
                    length: LINK_LENGTH,
                })
            },
        )
    }

    /// Number of actuated joints, which is also the control width.
    pub fn dof_count(&self) -> usize {
        self.links
            .iter()
            .filter(|link| link.joint_type == JointType::Hinge)
            .count()
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        let invalid = |msg: String| Err(SimulationError::InvalidRobot(msg));

        if self.links.is_empty() {
            return invalid("robot has no links".into());
        }
        if !(self.link_density > 0.0 && self.link_radius > 0.0) {
            return invalid("link density and radius must be positive".into());
        }
        for (i, link) in self.links.iter().enumerate() {
            match (i, link.parent) {
                (0, None) => {}
                (0, Some(_)) => return invalid("root link cannot have a parent".into()),
                (_, None) => return invalid(format!("link {i} has no parent")),
                (_, Some(p)) if p >= i => {
                    return invalid(format!("link {i} references later link {p}"))
                }
                _ => {}
            }
            if i == 0 && link.joint_type != JointType::Free {
                return invalid("root link must be free".into());
            }
            if i > 0 && link.joint_type == JointType::Free {
                return invalid(format!("link {i}: only the root may be free"));
            }
            if !(link.length.is_finite() && link.length > 0.0) {
                return invalid(format!("link {i} has invalid length {}", link.length));
            }
            if !(0.0..=1.0).contains(&link.joint_pos) {
                return invalid(format!("link {i} joint_pos {} outside [0, 1]", link.joint_pos));
            }
        }
        Ok(())
    }
}

/// A box-shaped obstacle. Zero density makes it static.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prop {
    pub density: Real,
    pub friction: Real,
    pub half_extents: [Real; 2],
}

impl Prop {
    pub fn floor() -> Self {
        Self {
            density: 0.0,
            friction: 0.9,
            half_extents: [10.0, 1.0],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RobotJoint {
    pub handle: ImpulseJointHandle,
    pub parent: RigidBodyHandle,
    pub child: RigidBodyHandle,
    pub rest_angle: Real,
}

/// Handles of a robot that has been inserted into a physics world.
#[derive(Debug, Clone)]
pub(crate) struct RobotInstance {
    pub links: Vec<RigidBodyHandle>,
    pub colliders: Vec<ColliderHandle>,
    /// Hinge joints only, in link order.
    pub joints: Vec<RobotJoint>,
}

impl RobotInstance {
    pub fn spawn(
        robot: &Robot,
        origin: Vector<Real>,
        angle: Real,
        rigid_body_set: &mut RigidBodySet,
        collider_set: &mut ColliderSet,
        impulse_joint_set: &mut ImpulseJointSet,
    ) -> Self {
        let mut links = Vec::with_capacity(robot.links.len());
        let mut colliders = Vec::with_capacity(robot.links.len());
        let mut joints = Vec::new();
        // World pose of each link frame: (start point, angle)
        let mut frames: Vec<(Vector<Real>, Real)> = Vec::with_capacity(robot.links.len());

        for link in &robot.links {
            let (start, link_angle) = match link.parent {
                None => (origin, angle),
                Some(p) => {
                    let (parent_start, parent_angle) = frames[p];
                    let along = link.joint_pos * robot.links[p].length;
                    (
                        parent_start + rotate(vector![along, 0.0], parent_angle),
                        parent_angle + link.joint_rot,
                    )
                }
            };
            frames.push((start, link_angle));

            let center = start + rotate(vector![link.length / 2.0, 0.0], link_angle);
            let (handle, collider) = Self::insert_link(
                robot,
                link,
                center,
                link_angle,
                rigid_body_set,
                collider_set,
            );
            links.push(handle);
            colliders.push(collider);

            if let Some(p) = link.parent {
                let anchor_parent = point![(link.joint_pos - 0.5) * robot.links[p].length, 0.0];
                let anchor_child = point![-link.length / 2.0, 0.0];
                match link.joint_type {
                    JointType::Hinge => {
                        let joint_handle = Self::motor_joint(
                            impulse_joint_set,
                            &robot.motor,
                            links[p],
                            handle,
                            anchor_parent,
                            anchor_child,
                            link.joint_rot,
                        );
                        joints.push(RobotJoint {
                            handle: joint_handle,
                            parent: links[p],
                            child: handle,
                            rest_angle: link.joint_rot,
                        });
                    }
                    JointType::Fixed => {
                        let joint = FixedJointBuilder::new()
                            .local_frame1(Isometry::new(anchor_parent.coords, link.joint_rot))
                            .local_frame2(Isometry::new(anchor_child.coords, 0.0))
                            .build();
                        impulse_joint_set.insert(links[p], handle, joint, true);
                    }
                    JointType::Free => {}
                }
            }
        }

        Self {
            links,
            colliders,
            joints,
        }
    }

    pub fn dof_count(&self) -> usize {
        self.joints.len()
    }

    fn insert_link(
        robot: &Robot,
        link: &Link,
        center: Vector<Real>,
        angle: Real,
        rigid_body_set: &mut RigidBodySet,
        collider_set: &mut ColliderSet,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body = RigidBodyBuilder::dynamic()
            .translation(center)
            .rotation(angle)
            .linear_damping(LINK_LINEAR_DAMPING)
            .angular_damping(LINK_ANGULAR_DAMPING)
            .build();
        let handle = rigid_body_set.insert(body);
        let collider = ColliderBuilder::capsule_x(link.length / 2.0, robot.link_radius)
            .density(robot.link_density)
            .friction(robot.friction)
            .collision_groups(InteractionGroups::new(
                Group::from_bits_truncate(GROUP_ROBOT),
                Group::from_bits_truncate(GROUP_WORLD),
            ))
            .build();
        let collider_handle = collider_set.insert_with_parent(collider, handle, rigid_body_set);
        (handle, collider_handle)
    }

    fn motor_joint(
        impulse_joint_set: &mut ImpulseJointSet,
        motor: &MotorParams,
        parent: RigidBodyHandle,
        child: RigidBodyHandle,
        anchor_parent: Point<Real>,
        anchor_child: Point<Real>,
        rest_angle: Real,
    ) -> ImpulseJointHandle {
        let mut joint = RevoluteJointBuilder::new()
            .local_anchor1(anchor_parent)
            .local_anchor2(anchor_child)
            .motor_model(MotorModel::ForceBased)
            .motor(0.0, 0.0, motor.stiffness, motor.damping)
            .motor_max_force(motor.max_force)
            .limits([-motor.limit, motor.limit])
            .build();
        // Bake the rest rotation into the parent frame so a zero target holds the rest pose
        joint.data.local_frame1 = Isometry::new(anchor_parent.coords, rest_angle);
        impulse_joint_set.insert(parent, child, joint, true)
    }
}

fn rotate(v: Vector<Real>, angle: Real) -> Vector<Real> {
    let (sin, cos) = angle.sin_cos();
    vector![cos * v.x - sin * v.y, sin * v.x + cos * v.y]
}
