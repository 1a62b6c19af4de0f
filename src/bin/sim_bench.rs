use clap::Parser;
use planar_mppi::{
    Prop, RapierSimulation, Robot, RobotState, Simulation, SimulationConfig, SimulationError,
};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PRINT_INTERVAL: usize = 240;

#[derive(Parser)]
#[command(about = "Headless physics throughput of the snake robot on a floor")]
struct Args {
    #[arg(long, default_value_t = 2400)]
    steps: usize,

    #[arg(long, default_value_t = 5)]
    links: usize,

    /// Sinusoidal joint target amplitude in radians. Zero leaves the snake limp.
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,
}

fn main() -> Result<(), SimulationError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();
    let args = Args::parse();

    let config = SimulationConfig::default();
    let robot = Robot::snake(args.links);
    let y_offset = RapierSimulation::ground_offset(&robot, &config)?;

    let mut sim = RapierSimulation::new(&config);
    sim.add_prop(&Prop::floor(), [0.0, -1.0], 0.0);
    let idx = sim.add_robot(&robot, [0.0, y_offset], 0.0)?;
    let dof = robot.dof_count();
    info!(steps = args.steps, links = args.links, "running offline simulation");

    let start_time = Instant::now();
    let mut targets = vec![0.0; dof];
    for step in 0..args.steps {
        let t = sim.time();
        for (j, target) in targets.iter_mut().enumerate() {
            *target = args.amplitude * (2.0 * t + j as f32).sin();
        }
        sim.set_joint_target_positions(idx, &targets)?;
        sim.step()?;

        if step % PRINT_INTERVAL == 0 || step == args.steps - 1 {
            if let Some(base) = sim.base_state(idx) {
                info!(
                    step = step + 1,
                    x = base.position[0],
                    y = base.position[1],
                    vx = base.velocity[0],
                    vy = base.velocity[1],
                    "base"
                );
            }
        }
    }

    let duration = start_time.elapsed();
    info!(
        secs = duration.as_secs_f64(),
        steps_per_sec = args.steps as f64 / duration.as_secs_f64(),
        "simulation complete"
    );
    Ok(())
}
