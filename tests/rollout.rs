mod common;

use approx::assert_relative_eq;
use common::{forward_velocity, ToyFactory};
use planar_mppi::{
    ControlSequence, NullValueEstimator, ObservationExtractor, RobotIndex, RobotState,
    RolloutPool, RolloutSettings, Simulation, SimulationError, SimulationFactory, ValueEstimator,
    ValueFunction,
};

const DOF: usize = 2;

fn settings() -> RolloutSettings {
    RolloutSettings {
        robot: RobotIndex(0),
        horizon: 5,
        interval: 3,
        discount: 0.9,
    }
}

fn candidates(count: usize) -> Vec<ControlSequence> {
    (0..count)
        .map(|i| {
            let mut seq = ControlSequence::zeros(DOF, 5);
            for v in seq.as_mut_slice() {
                *v = 0.1 * i as f32;
            }
            seq
        })
        .collect()
}

fn zero_value() -> std::sync::Arc<dyn ValueFunction> {
    NullValueEstimator::new(ObservationExtractor::new(RobotIndex(0), DOF)).snapshot()
}

#[test]
fn constant_reward_is_discounted_per_decision() {
    let factory = ToyFactory::new(DOF);
    let mut pool = RolloutPool::new(&factory, 2).unwrap();
    let start = factory.create().unwrap().snapshot();
    let one = |_sim: &dyn RobotState, _robot: RobotIndex| 1.0;

    let outcomes = pool.evaluate_batch(&start, &candidates(3), &settings(), &one, zero_value().as_ref());
    let expected: f32 = (0..5).map(|j| 0.9f32.powi(j) * 3.0).sum();
    for outcome in outcomes {
        let score = outcome.unwrap();
        assert_eq!(score.rewards, vec![3.0; 5]);
        assert_relative_eq!(score.total, expected, epsilon = 1e-5);
    }
}

#[test]
fn terminal_value_is_discounted_by_full_horizon() {
    struct Constant;
    impl ValueFunction for Constant {
        fn value(&self, _observation: &[f32]) -> f32 {
            10.0
        }
        fn estimate(&self, _sim: &dyn RobotState) -> f32 {
            10.0
        }
    }

    let factory = ToyFactory::new(DOF);
    let mut pool = RolloutPool::new(&factory, 1).unwrap();
    let start = factory.create().unwrap().snapshot();
    let zero = |_sim: &dyn RobotState, _robot: RobotIndex| 0.0;

    let outcomes = pool.evaluate_batch(&start, &candidates(1), &settings(), &zero, &Constant);
    let score = outcomes[0].as_ref().unwrap();
    assert_relative_eq!(score.terminal_value, 10.0);
    assert_relative_eq!(score.total, 10.0 * 0.9f32.powi(5), epsilon = 1e-5);
}

#[test]
fn overflowing_return_is_a_failure() {
    let factory = ToyFactory::new(DOF);
    let mut pool = RolloutPool::new(&factory, 1).unwrap();
    let start = factory.create().unwrap().snapshot();
    let huge = |_sim: &dyn RobotState, _robot: RobotIndex| f32::MAX;

    let outcomes = pool.evaluate_batch(&start, &candidates(2), &settings(), &huge, zero_value().as_ref());
    for outcome in outcomes {
        let failure = outcome.unwrap_err();
        assert!(matches!(failure.error, SimulationError::NonFiniteReward(v) if v.is_infinite()));
    }
}

#[test]
fn one_failing_sample_leaves_others_untouched() {
    let factory = ToyFactory::new(DOF);
    let mut pool = RolloutPool::new(&factory, 3).unwrap();
    let start = factory.create().unwrap().snapshot();

    let healthy = candidates(6);
    let mut poisoned = healthy.clone();
    poisoned[4].step_mut(2)[1] = f32::NAN;

    let value_fn = zero_value();
    let clean = pool.evaluate_batch(&start, &healthy, &settings(), &forward_velocity, value_fn.as_ref());
    let mixed = pool.evaluate_batch(&start, &poisoned, &settings(), &forward_velocity, value_fn.as_ref());

    for (i, (a, b)) in clean.iter().zip(&mixed).enumerate() {
        if i == 4 {
            let failure = b.as_ref().unwrap_err();
            assert_eq!(failure.sample, 4);
            assert_eq!(failure.worker, 4 % 3);
            assert!(matches!(failure.error, SimulationError::NonFiniteReward(_)));
        } else {
            assert_eq!(a, b);
        }
    }
}

#[test]
fn outcomes_are_returned_in_sample_order() {
    let factory = ToyFactory::new(DOF);
    let mut pool = RolloutPool::new(&factory, 4).unwrap();
    let start = factory.create().unwrap().snapshot();

    let outcomes = pool.evaluate_batch(
        &start,
        &candidates(9),
        &settings(),
        &forward_velocity,
        zero_value().as_ref(),
    );
    let totals: Vec<f32> = outcomes.into_iter().map(|o| o.unwrap().total).collect();
    // larger constant targets move the base faster
    assert!(totals.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn cancelled_pool_fails_every_sample() {
    let factory = ToyFactory::new(DOF);
    let mut pool = RolloutPool::new(&factory, 2).unwrap();
    let start = factory.create().unwrap().snapshot();
    pool.cancel_handle().cancel();

    let outcomes = pool.evaluate_batch(
        &start,
        &candidates(4),
        &settings(),
        &forward_velocity,
        zero_value().as_ref(),
    );
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Err(f) if f.error == SimulationError::Cancelled)));
    assert_eq!(factory.step_count(), 0);
}
