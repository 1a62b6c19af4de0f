//! One JSON document holding every tunable of an experiment run.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::objective::SumOfSquaresObjective;
use crate::optimizer::OptimizerConfig;
use crate::physics::SimulationConfig;
use crate::value::ValueEstimatorConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub simulation: SimulationConfig,
    pub optimizer: OptimizerConfig,
    pub value: ValueEstimatorConfig,
    pub objective: SumOfSquaresObjective,
    /// Number of links in the snake robot.
    pub link_count: usize,
    /// Decision steps per episode.
    pub episode_len: usize,
    /// Updates run before the first decision.
    pub warmup_updates: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            optimizer: OptimizerConfig::default(),
            value: ValueEstimatorConfig::default(),
            objective: SumOfSquaresObjective::default(),
            link_count: 5,
            episode_len: 250,
            warmup_updates: 10,
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.simulation.validate()?;
        self.optimizer.validate()?;
        self.value.validate()?;
        if self.link_count < 2 {
            return Err(ConfigError::InvalidDofCount(self.link_count.saturating_sub(1)));
        }
        if self.link_count - 1 != self.optimizer.dof_count {
            return Err(ConfigError::InvalidDofCount(self.optimizer.dof_count));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigLoadError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_consistent() {
        let config = ExperimentConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.optimizer.dof_count, config.link_count - 1);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config = ExperimentConfig::from_json(
            r#"{"link_count": 3, "optimizer": {"dof_count": 2, "horizon": 16}}"#,
        )
        .unwrap();
        assert_eq!(config.optimizer.horizon, 16);
        assert_eq!(config.episode_len, 250);
    }

    #[test]
    fn dof_must_match_link_count() {
        let err = ExperimentConfig::from_json(r#"{"link_count": 3}"#).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Invalid(ConfigError::InvalidDofCount(4))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");
        let text = serde_json::to_string_pretty(&ExperimentConfig::default()).unwrap();
        std::fs::write(&path, text).unwrap();
        assert_eq!(ExperimentConfig::load(&path).unwrap(), ExperimentConfig::default());
    }
}
