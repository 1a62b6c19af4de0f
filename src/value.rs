use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module, Param};
use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{Linear, LinearConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use burn_ndarray::NdArray;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ConfigError, EstimatorError};
use crate::observation::ObservationExtractor;
use crate::sim::RobotState;

type InferenceBackend = NdArray;
type TrainBackend = Autodiff<NdArray>;

fn get_device<B: Backend>() -> B::Device {
    B::Device::default()
}

/// Read-only value function, safe to share across rollout threads.
pub trait ValueFunction: Send + Sync {
    fn value(&self, observation: &[f32]) -> f32;

    /// Observe `sim` and estimate its value.
    fn estimate(&self, sim: &dyn RobotState) -> f32;
}

/// A trainable approximation of expected future return.
pub trait ValueEstimator: Send {
    fn observation_size(&self) -> usize;

    /// Extract this estimator's observation of `sim`. Pure.
    fn observe(&self, sim: &dyn RobotState, out: &mut [f32]);

    fn predict(&self, observation: &[f32]) -> f32;

    /// Copy of the current parameters for concurrent evaluation.
    fn snapshot(&self) -> Arc<dyn ValueFunction>;

    /// Fit to `(observation, return)` pairs. `observations` is row-major,
    /// one row per entry of `returns`. On error the previous parameters stay.
    fn train(&mut self, observations: &[f32], returns: &[f32]) -> Result<TrainReport, EstimatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    pub epochs: usize,
    pub batches: usize,
    pub final_loss: f32,
}

/// Returns-to-go `G_t = r_t + γ·G_{t+1}` with `G_T = terminal_value`.
pub fn discounted_returns(rewards: &[f32], discount: f32, terminal_value: f32) -> Vec<f32> {
    let mut returns = vec![0.0; rewards.len()];
    let mut acc = terminal_value;
    for (t, r) in rewards.iter().enumerate().rev() {
        acc = r + discount * acc;
        returns[t] = acc;
    }
    returns
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueEstimatorConfig {
    pub hidden_width: usize,
    /// Number of hidden layers.
    pub depth: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for ValueEstimatorConfig {
    fn default() -> Self {
        Self {
            hidden_width: 64,
            depth: 2,
            batch_size: 64,
            epochs: 3,
            learning_rate: 1.0e-3,
            seed: 0,
        }
    }
}

impl ValueEstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidEstimator(msg.to_string()));
        if self.depth > 0 && self.hidden_width == 0 {
            return invalid("hidden_width must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be finite and positive");
        }
        Ok(())
    }

    fn layer_sizes(&self, observation_size: usize) -> Vec<(usize, usize)> {
        let mut sizes = Vec::with_capacity(self.depth + 1);
        let mut fan_in = observation_size;
        for _ in 0..self.depth {
            sizes.push((fan_in, self.hidden_width));
            fan_in = self.hidden_width;
        }
        sizes.push((fan_in, 1));
        sizes
    }
}

/// Fully connected network: `depth` ReLU layers followed by a linear scalar head.
#[derive(Module, Debug)]
pub struct ValueNet<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
}

impl<B: Backend> ValueNet<B> {
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = input;
        for layer in &self.hidden {
            x = relu(layer.forward(x));
        }
        self.output.forward(x)
    }

    fn layers(&self) -> impl Iterator<Item = &Linear<B>> {
        self.hidden.iter().chain(std::iter::once(&self.output))
    }
}

/// Plain-memory copy of one linear layer, `weights` row-major `[inputs][outputs]`.
#[derive(Debug, Clone, PartialEq)]
struct DenseLayer {
    inputs: usize,
    outputs: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl DenseLayer {
    fn from_linear<B: Backend>(layer: &Linear<B>) -> Self {
        let [inputs, outputs] = layer.weight.val().dims();
        let weights: Vec<f32> = layer.weight.val().into_data().iter::<f32>().collect();
        let bias: Vec<f32> = match &layer.bias {
            Some(bias) => bias.val().into_data().iter::<f32>().collect(),
            None => vec![0.0; outputs],
        };
        Self {
            inputs,
            outputs,
            weights,
            bias,
        }
    }

    fn forward(&self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        out.extend_from_slice(&self.bias);
        for (i, x) in input.iter().enumerate() {
            let row = &self.weights[i * self.outputs..(i + 1) * self.outputs];
            for (o, w) in out.iter_mut().zip(row) {
                *o += x * w;
            }
        }
    }

    fn is_finite(&self) -> bool {
        self.weights.iter().chain(&self.bias).all(|v| v.is_finite())
    }
}

/// Frozen copy of an `FcValueEstimator`, evaluated without any tensor backend.
#[derive(Debug, Clone)]
pub struct ValueSnapshot {
    extractor: ObservationExtractor,
    layers: Vec<DenseLayer>,
}

impl ValueSnapshot {
    fn is_finite(&self) -> bool {
        self.layers.iter().all(DenseLayer::is_finite)
    }
}

impl ValueFunction for ValueSnapshot {
    fn value(&self, observation: &[f32]) -> f32 {
        let mut current = observation.to_vec();
        let mut next = Vec::new();
        let last = self.layers.len().saturating_sub(1);
        for (l, layer) in self.layers.iter().enumerate() {
            debug_assert_eq!(current.len(), layer.inputs);
            layer.forward(&current, &mut next);
            if l < last {
                next.iter_mut().for_each(|v| *v = v.max(0.0));
            }
            std::mem::swap(&mut current, &mut next);
        }
        current.first().copied().unwrap_or(0.0)
    }

    fn estimate(&self, sim: &dyn RobotState) -> f32 {
        self.value(&self.extractor.observe(sim))
    }
}

/// Value estimator backed by a burn fully connected network.
#[derive(Debug)]
pub struct FcValueEstimator {
    extractor: ObservationExtractor,
    config: ValueEstimatorConfig,
    model: ValueNet<TrainBackend>,
    inference: ValueNet<InferenceBackend>,
    snapshot: Arc<ValueSnapshot>,
    rng: ChaCha8Rng,
    train_calls: usize,
}

impl FcValueEstimator {
    /// Build a network with Xavier-uniform weights drawn from `config.seed`.
    pub fn new(
        extractor: ObservationExtractor,
        config: ValueEstimatorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let sizes = config.layer_sizes(extractor.observation_size());
        let params: Vec<(Vec<f32>, Vec<f32>)> = sizes
            .iter()
            .map(|&(fan_in, fan_out)| {
                let a = (6.0 / (fan_in + fan_out) as f32).sqrt();
                let weights = (0..fan_in * fan_out).map(|_| rng.gen_range(-a..=a)).collect();
                (weights, vec![0.0; fan_out])
            })
            .collect();
        Ok(Self::from_params(extractor, config, &sizes, &params, rng))
    }

    fn from_params(
        extractor: ObservationExtractor,
        config: ValueEstimatorConfig,
        sizes: &[(usize, usize)],
        params: &[(Vec<f32>, Vec<f32>)],
        rng: ChaCha8Rng,
    ) -> Self {
        let device = get_device::<TrainBackend>();
        let build = |&(fan_in, fan_out): &(usize, usize), (weights, bias): &(Vec<f32>, Vec<f32>)| {
            let mut layer = LinearConfig::new(fan_in, fan_out).init(&device);
            let w = Tensor::<TrainBackend, 1>::from_floats(weights.as_slice(), &device)
                .reshape([fan_in, fan_out]);
            let b = Tensor::<TrainBackend, 1>::from_floats(bias.as_slice(), &device);
            layer.weight = Param::from_tensor(w);
            layer.bias = Some(Param::from_tensor(b));
            layer
        };
        // layer_sizes always ends with the scalar head
        let head = sizes.len() - 1;
        let model = ValueNet {
            hidden: sizes[..head]
                .iter()
                .zip(&params[..head])
                .map(|(size, param)| build(size, param))
                .collect(),
            output: build(&sizes[head], &params[head]),
        };

        let inference = model.valid();
        let snapshot = Arc::new(Self::freeze(extractor, &inference));
        Self {
            extractor,
            config,
            model,
            inference,
            snapshot,
            rng,
            train_calls: 0,
        }
    }

    fn freeze(extractor: ObservationExtractor, model: &ValueNet<InferenceBackend>) -> ValueSnapshot {
        ValueSnapshot {
            extractor,
            layers: model.layers().map(DenseLayer::from_linear).collect(),
        }
    }

    pub fn config(&self) -> &ValueEstimatorConfig {
        &self.config
    }

    pub fn extractor(&self) -> ObservationExtractor {
        self.extractor
    }

    pub fn train_calls(&self) -> usize {
        self.train_calls
    }

    /// Total number of weights and biases.
    pub fn weight_count(&self) -> usize {
        self.config
            .layer_sizes(self.extractor.observation_size())
            .iter()
            .map(|(i, o)| i * o + o)
            .sum()
    }

    /// Save all network parameters to a binary file.
    /// Layout (little-endian f32): for each layer in order, weights then biases.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), EstimatorError> {
        let mut file = BufWriter::new(File::create(path)?);
        for layer in &self.snapshot.layers {
            for &v in layer.weights.iter().chain(&layer.bias) {
                file.write_all(&v.to_le_bytes())?;
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Load parameters written by `save_to_file`. The file size must match the
    /// architecture described by `config` and `extractor`.
    pub fn load_from_file(
        path: impl AsRef<Path>,
        extractor: ObservationExtractor,
        config: ValueEstimatorConfig,
    ) -> Result<Self, EstimatorError> {
        config.validate()?;

        let mut buffer = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut buffer)?;

        let sizes = config.layer_sizes(extractor.observation_size());
        let expected: usize = sizes.iter().map(|(i, o)| (i * o + o) * 4).sum();
        if buffer.len() != expected {
            return Err(EstimatorError::CheckpointSize {
                actual: buffer.len(),
                expected,
            });
        }

        let mut values = buffer
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let params: Vec<(Vec<f32>, Vec<f32>)> = sizes
            .iter()
            .map(|&(fan_in, fan_out)| {
                let weights = values.by_ref().take(fan_in * fan_out).collect();
                let bias = values.by_ref().take(fan_out).collect();
                (weights, bias)
            })
            .collect();

        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self::from_params(extractor, config, &sizes, &params, rng))
    }

    fn batch_tensor<B: Backend>(values: &[f32], rows: usize, cols: usize) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(values, &get_device::<B>()).reshape([rows, cols])
    }
}

impl ValueEstimator for FcValueEstimator {
    fn observation_size(&self) -> usize {
        self.extractor.observation_size()
    }

    fn observe(&self, sim: &dyn RobotState, out: &mut [f32]) {
        self.extractor.observe_into(sim, out);
    }

    fn predict(&self, observation: &[f32]) -> f32 {
        assert_eq!(
            observation.len(),
            self.observation_size(),
            "observation must have {} elements",
            self.observation_size()
        );
        let input = Self::batch_tensor::<InferenceBackend>(observation, 1, observation.len());
        let output = self.inference.forward(input);
        output.into_data().iter::<f32>().next().unwrap_or(0.0)
    }

    fn snapshot(&self) -> Arc<dyn ValueFunction> {
        self.snapshot.clone()
    }

    fn train(&mut self, observations: &[f32], returns: &[f32]) -> Result<TrainReport, EstimatorError> {
        let rows = returns.len();
        let cols = self.observation_size();
        if rows == 0 {
            return Err(EstimatorError::EmptyBatch);
        }
        if observations.len() != rows * cols {
            return Err(EstimatorError::ShapeMismatch {
                observations: observations.len(),
                expected: rows * cols,
                rows,
            });
        }

        let mut model = self.model.clone();
        let mut optim = AdamConfig::new().init();
        let loss_fn = MseLoss::new();
        let mut order: Vec<usize> = (0..rows).collect();
        let mut batches = 0;
        let mut final_loss = 0.0;
        let mut x = Vec::with_capacity(self.config.batch_size * cols);
        let mut y = Vec::with_capacity(self.config.batch_size);

        for _ in 0..self.config.epochs {
            order.shuffle(&mut self.rng);
            for batch in order.chunks(self.config.batch_size) {
                x.clear();
                y.clear();
                for &i in batch {
                    x.extend_from_slice(&observations[i * cols..(i + 1) * cols]);
                    y.push(returns[i]);
                }
                let input = Self::batch_tensor::<TrainBackend>(&x, batch.len(), cols);
                let target = Self::batch_tensor::<TrainBackend>(&y, batch.len(), 1);

                let loss = loss_fn.forward(model.forward(input), target, Reduction::Mean);
                let loss_value: f32 = loss.clone().into_scalar().elem();
                if !loss_value.is_finite() {
                    warn!(loss = loss_value, "value training diverged, keeping previous parameters");
                    return Err(EstimatorError::NonFiniteLoss(loss_value));
                }

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(self.config.learning_rate, model, grads);
                final_loss = loss_value;
                batches += 1;
            }
        }

        let inference = model.valid();
        let snapshot = Self::freeze(self.extractor, &inference);
        if !snapshot.is_finite() {
            warn!("value training produced non-finite weights, keeping previous parameters");
            return Err(EstimatorError::NonFiniteLoss(f32::NAN));
        }

        self.model = model;
        self.inference = inference;
        self.snapshot = Arc::new(snapshot);
        self.train_calls += 1;
        debug!(rows, batches, final_loss, "value estimator trained");

        Ok(TrainReport {
            epochs: self.config.epochs,
            batches,
            final_loss,
        })
    }
}

/// Always estimates zero. Rollouts then carry no terminal bonus.
#[derive(Debug, Clone, Copy)]
pub struct NullValueEstimator {
    extractor: ObservationExtractor,
}

impl NullValueEstimator {
    pub fn new(extractor: ObservationExtractor) -> Self {
        Self { extractor }
    }
}

#[derive(Debug, Clone, Copy)]
struct ZeroValue;

impl ValueFunction for ZeroValue {
    fn value(&self, _observation: &[f32]) -> f32 {
        0.0
    }

    fn estimate(&self, _sim: &dyn RobotState) -> f32 {
        0.0
    }
}

impl ValueEstimator for NullValueEstimator {
    fn observation_size(&self) -> usize {
        self.extractor.observation_size()
    }

    fn observe(&self, sim: &dyn RobotState, out: &mut [f32]) {
        self.extractor.observe_into(sim, out);
    }

    fn predict(&self, _observation: &[f32]) -> f32 {
        0.0
    }

    fn snapshot(&self) -> Arc<dyn ValueFunction> {
        Arc::new(ZeroValue)
    }

    fn train(&mut self, _observations: &[f32], returns: &[f32]) -> Result<TrainReport, EstimatorError> {
        if returns.is_empty() {
            return Err(EstimatorError::EmptyBatch);
        }
        Ok(TrainReport {
            epochs: 0,
            batches: 0,
            final_loss: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::RobotIndex;
    use approx::assert_relative_eq;

    fn estimator(seed: u64) -> FcValueEstimator {
        let config = ValueEstimatorConfig {
            hidden_width: 16,
            depth: 2,
            seed,
            ..ValueEstimatorConfig::default()
        };
        FcValueEstimator::new(ObservationExtractor::new(RobotIndex(0), 2), config).unwrap()
    }

    #[test]
    fn test_weight_count() {
        let est = estimator(0);
        // obs size 10 -> 16 -> 16 -> 1
        assert_eq!(est.weight_count(), 10 * 16 + 16 + 16 * 16 + 16 + 16 + 1);
    }

    #[test]
    fn test_same_seed_same_predictions() {
        let obs: Vec<f32> = (0..10).map(|i| i as f32 * 0.1).collect();
        assert_eq!(estimator(3).predict(&obs), estimator(3).predict(&obs));
        assert_ne!(estimator(3).predict(&obs), estimator(4).predict(&obs));
    }

    #[test]
    fn test_snapshot_matches_network() {
        let est = estimator(1);
        let obs: Vec<f32> = (0..10).map(|i| (i as f32).sin()).collect();
        let snapshot = est.snapshot();
        assert_relative_eq!(snapshot.value(&obs), est.predict(&obs), epsilon = 1e-4);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut est = estimator(2);
        let rows = 32;
        let observations: Vec<f32> = (0..rows * 10).map(|i| ((i % 7) as f32) * 0.1).collect();
        let returns: Vec<f32> = (0..rows).map(|r| observations[r * 10] * 2.0 - 1.0).collect();

        let first = est.train(&observations, &returns).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = est.train(&observations, &returns).unwrap();
        }
        assert!(last.final_loss < first.final_loss);
        assert_eq!(est.train_calls(), 21);
    }

    #[test]
    fn test_shape_mismatch_keeps_parameters() {
        let mut est = estimator(5);
        let obs = vec![0.5; 10];
        let before = est.predict(&obs);
        let err = est.train(&[0.0; 7], &[1.0]).unwrap_err();
        assert!(matches!(err, EstimatorError::ShapeMismatch { .. }));
        assert!(matches!(est.train(&[], &[]), Err(EstimatorError::EmptyBatch)));
        assert_eq!(est.predict(&obs), before);
    }

    #[test]
    fn test_non_finite_returns_are_rejected() {
        let mut est = estimator(6);
        let obs = vec![0.5; 10];
        let before = est.predict(&obs);
        let err = est.train(&obs, &[f32::NAN]).unwrap_err();
        assert!(matches!(err, EstimatorError::NonFiniteLoss(_)));
        assert_eq!(est.predict(&obs), before);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let est = estimator(7);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.bin");
        est.save_to_file(&path).unwrap();

        let loaded =
            FcValueEstimator::load_from_file(&path, est.extractor(), est.config().clone()).unwrap();
        let obs = vec![0.3; 10];
        assert_relative_eq!(est.predict(&obs), loaded.predict(&obs), epsilon = 1e-6);
    }

    #[test]
    fn test_load_rejects_wrong_architecture() {
        let est = estimator(8);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.bin");
        est.save_to_file(&path).unwrap();

        let wider = ValueEstimatorConfig {
            hidden_width: 32,
            ..est.config().clone()
        };
        let err = FcValueEstimator::load_from_file(&path, est.extractor(), wider).unwrap_err();
        assert!(matches!(err, EstimatorError::CheckpointSize { .. }));
    }

    #[test]
    fn test_discounted_returns() {
        let returns = discounted_returns(&[1.0, 1.0, 1.0], 0.5, 8.0);
        assert_eq!(returns, vec![2.75, 3.5, 5.0]);
    }
}
