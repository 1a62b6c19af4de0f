use crate::physics::RobotIndex;
use crate::sim::RobotState;

#[derive(Debug, Clone, PartialEq)]
pub struct AngleSense {
    pub sin: f32,
    pub cos: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VelocitySense {
    pub x: f32,
    pub y: f32,
}

/// Hierarchical sense data for the root link
#[derive(Debug, Clone, PartialEq)]
pub struct BaseSense {
    pub absolute_angle: AngleSense,
    pub angular_velocity: f32,
    pub absolute_velocity: VelocitySense,
    pub height: f32,
}

/// Hierarchical sense data for a single joint
#[derive(Debug, Clone, PartialEq)]
pub struct JointSense {
    pub angle: f32,
    pub angular_velocity: f32,
}

/// Complete hierarchical sense data for one robot
#[derive(Debug, Clone, PartialEq)]
pub struct RobotSense {
    pub base: BaseSense,
    pub joints: Vec<JointSense>,
}

/// Values contributed by the base: sin, cos, angular velocity, vx, vy, height.
pub const BASE_SENSE_SIZE: usize = 6;

/// Turns simulation state into the fixed-size vector the value estimator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationExtractor {
    robot: RobotIndex,
    dof_count: usize,
}

impl ObservationExtractor {
    pub fn new(robot: RobotIndex, dof_count: usize) -> Self {
        Self { robot, dof_count }
    }

    /// Size the extractor for whatever robot `sim` holds at `robot`.
    pub fn for_robot(sim: &dyn RobotState, robot: RobotIndex) -> Option<Self> {
        sim.robot_dof_count(robot).map(|dof| Self::new(robot, dof))
    }

    pub fn robot(&self) -> RobotIndex {
        self.robot
    }

    pub fn dof_count(&self) -> usize {
        self.dof_count
    }

    pub fn observation_size(&self) -> usize {
        BASE_SENSE_SIZE + 2 * self.dof_count
    }

    /// Sense the robot's current state. Returns `None` if the robot is unknown.
    pub fn sense(&self, sim: &dyn RobotState) -> Option<RobotSense> {
        let base = sim.base_state(self.robot)?;
        let joints = (0..self.dof_count)
            .map(|j| {
                sim.joint_state(self.robot, j).map(|state| JointSense {
                    angle: state.angle,
                    angular_velocity: state.angular_velocity,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(RobotSense {
            base: BaseSense {
                absolute_angle: AngleSense {
                    sin: base.rotation.sin(),
                    cos: base.rotation.cos(),
                },
                angular_velocity: base.angular_velocity,
                absolute_velocity: VelocitySense {
                    x: base.velocity[0],
                    y: base.velocity[1],
                },
                height: base.position[1],
            },
            joints,
        })
    }

    /// Write the flattened observation into `out`, which must hold
    /// `observation_size()` values. Unknown robots yield zeros.
    pub fn observe_into(&self, sim: &dyn RobotState, out: &mut [f32]) {
        assert_eq!(
            out.len(),
            self.observation_size(),
            "observation buffer must have {} elements",
            self.observation_size()
        );
        match self.sense(sim) {
            Some(sense) => flatten_sense_into(&sense, out),
            None => out.fill(0.0),
        }
    }

    pub fn observe(&self, sim: &dyn RobotState) -> Vec<f32> {
        let mut out = vec![0.0; self.observation_size()];
        self.observe_into(sim, &mut out);
        out
    }
}

/// Flatten hierarchical sense data: base first, then joint angles, then joint velocities.
pub fn flatten_sense(sense: &RobotSense) -> Vec<f32> {
    let mut flat = vec![0.0; BASE_SENSE_SIZE + 2 * sense.joints.len()];
    flatten_sense_into(sense, &mut flat);
    flat
}

fn flatten_sense_into(sense: &RobotSense, out: &mut [f32]) {
    let base = &sense.base;
    out[..BASE_SENSE_SIZE].copy_from_slice(&[
        base.absolute_angle.sin,
        base.absolute_angle.cos,
        base.angular_velocity,
        base.absolute_velocity.x,
        base.absolute_velocity.y,
        base.height,
    ]);

    let dof = sense.joints.len();
    let (angles, velocities) = out[BASE_SENSE_SIZE..].split_at_mut(dof);
    for (j, joint) in sense.joints.iter().enumerate() {
        angles[j] = joint.angle;
        velocities[j] = joint.angular_velocity;
    }
}
