use clap::Parser;
use planar_mppi::{
    discounted_returns, ExperimentConfig, FcValueEstimator, MppiOptimizer, Objective,
    ObservationExtractor, OptimizerError, Prop, RapierSimulation, RapierSimulationFactory, Robot,
    RobotIndex, RobotState, Simulation, SimulationError, SimulationFactory, ValueEstimator,
};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const PRINT_INTERVAL: usize = 25;

#[derive(Parser)]
#[command(about = "Snake locomotion with a sampling-based trajectory optimizer")]
struct Args {
    /// Experiment configuration (JSON). Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    episodes: usize,

    /// Overrides the optimizer seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Overrides the rollout worker count.
    #[arg(long)]
    threads: Option<usize>,

    /// Overrides the episode length in decision steps.
    #[arg(long)]
    episode_len: Option<usize>,

    /// Start from a saved value network instead of a fresh one.
    #[arg(long)]
    load_value: Option<PathBuf>,

    /// Where to write the value network after the last episode.
    #[arg(long)]
    save_value: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<ExperimentConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.optimizer.seed = seed;
        config.value.seed = seed;
    }
    if let Some(threads) = args.threads {
        config.optimizer.thread_count = threads;
    }
    if let Some(len) = args.episode_len {
        config.episode_len = len;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(args)?;

    let robot = Arc::new(Robot::snake(config.link_count));
    let y_offset = RapierSimulation::ground_offset(&robot, &config.simulation)?;
    let factory = RapierSimulationFactory::new(config.simulation.clone(), robot.clone(), [0.0, y_offset])
        .with_prop(Prop::floor(), [0.0, -1.0]);

    let mut main_sim = factory.create()?;
    let robot_idx = main_sim
        .find_robot_index(&robot)
        .ok_or_else(|| SimulationError::InvalidRobot("robot missing from world".into()))?;
    let extractor = ObservationExtractor::for_robot(&main_sim, robot_idx)
        .ok_or(SimulationError::UnknownRobot(robot_idx))?;
    let estimator = match &args.load_value {
        Some(path) => FcValueEstimator::load_from_file(path, extractor, config.value.clone())?,
        None => FcValueEstimator::new(extractor, config.value.clone())?,
    };
    let objective = Arc::new(config.objective.clone());
    let mut optimizer = MppiOptimizer::new(
        config.optimizer.clone(),
        &factory,
        objective.clone(),
        estimator,
        robot_idx,
    )?;
    info!(
        links = config.link_count,
        dof = extractor.dof_count(),
        horizon = config.optimizer.horizon,
        samples = config.optimizer.sample_count,
        workers = config.optimizer.thread_count,
        "optimizer ready"
    );

    let warmup_start = Instant::now();
    for _ in 0..config.warmup_updates {
        optimizer.update()?;
    }
    info!(
        updates = config.warmup_updates,
        secs = warmup_start.elapsed().as_secs_f64(),
        "warm-up finished"
    );

    let interval = config.optimizer.interval;
    for episode in 0..args.episodes {
        main_sim.save_state();
        let episode_start = Instant::now();
        let mut observations = Vec::with_capacity(config.episode_len * extractor.observation_size());
        let mut rewards = Vec::with_capacity(config.episode_len);
        let mut inputs: Vec<Vec<f32>> = Vec::with_capacity(config.episode_len);

        for step in 0..config.episode_len {
            match optimizer.update() {
                Ok(_) => {}
                // keep acting on the previous nominal sequence
                Err(OptimizerError::AllSamplesFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            let control = optimizer.input_sequence().step(0).to_vec();
            optimizer.advance(1)?;

            observations.extend(extractor.observe(&main_sim));
            main_sim.set_joint_target_positions(robot_idx, &control)?;
            let mut reward = 0.0;
            for _ in 0..interval {
                main_sim.step()?;
                reward += objective.evaluate(&main_sim, robot_idx);
            }
            rewards.push(reward);
            inputs.push(control);

            if step % PRINT_INTERVAL == 0 {
                debug!(episode, step, reward, "decision step");
            }
        }

        let total: f32 = rewards.iter().sum();
        info!(
            episode,
            total_reward = total,
            secs = episode_start.elapsed().as_secs_f64(),
            "episode finished"
        );

        let terminal = optimizer
            .value_estimator()
            .predict(&extractor.observe(&main_sim));
        let returns = discounted_returns(&rewards, config.optimizer.discount_factor, terminal);
        if let Ok(report) = optimizer.train_value_estimator(&observations, &returns) {
            info!(episode, loss = report.final_loss, epochs = report.epochs, "value estimator trained");
        }

        replay(&mut main_sim, robot_idx, &inputs, interval)?;
    }

    if let Some(path) = &args.save_value {
        optimizer.value_estimator().save_to_file(path)?;
        info!(path = %path.display(), "value network saved");
    }

    Ok(())
}

/// Replay the recorded inputs from the episode start and log the base trajectory.
fn replay(
    sim: &mut RapierSimulation,
    robot: RobotIndex,
    inputs: &[Vec<f32>],
    interval: usize,
) -> Result<(), SimulationError> {
    sim.restore_state();
    for (step, control) in inputs.iter().enumerate() {
        sim.set_joint_target_positions(robot, control)?;
        for _ in 0..interval {
            sim.step()?;
        }
        if step % PRINT_INTERVAL == 0 || step + 1 == inputs.len() {
            if let Some(base) = sim.base_state(robot) {
                info!(
                    step,
                    x = base.position[0],
                    y = base.position[1],
                    vx = base.velocity[0],
                    "replay"
                );
            }
        }
    }
    Ok(())
}
