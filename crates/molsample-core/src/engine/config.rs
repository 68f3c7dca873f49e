use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid value for '{parameter}': {reason}")]
    Invalid {
        parameter: &'static str,
        reason: String,
    },
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

fn invalid(parameter: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        parameter,
        reason: reason.into(),
    }
}

fn default_slack() -> f64 {
    1.0
}

fn default_check_inputs() -> bool {
    cfg!(debug_assertions)
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_move_probability() -> f64 {
    1.0
}

fn default_refinement_step_size() -> f64 {
    0.1
}

fn default_min_step_size() -> f64 {
    1e-8
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScoringConfig {
    /// Margin added to close-pair cutoffs by the proximity indexes.
    #[serde(default = "default_slack")]
    pub slack: f64,
    /// Refuse reads outside a restraint's declared inputs.
    #[serde(default = "default_check_inputs")]
    pub check_inputs: bool,
    /// Compare the incremental total with a full evaluation every this many accepted steps.
    #[serde(default)]
    pub consistency_interval: Option<u64>,
    /// Relative tolerance of the consistency check.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            slack: default_slack(),
            check_inputs: default_check_inputs(),
            consistency_interval: None,
            tolerance: default_tolerance(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.slack.is_finite() || self.slack < 0.0 {
            return Err(invalid("slack", format!("must be finite and non-negative, got {}", self.slack)));
        }
        if !(self.tolerance > 0.0) {
            return Err(invalid("tolerance", format!("must be positive, got {}", self.tolerance)));
        }
        if self.consistency_interval == Some(0) {
            return Err(invalid("consistency-interval", "must be at least 1"));
        }
        Ok(())
    }
}

/// Geometric cooling schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AnnealingConfig {
    pub final_temperature: f64,
    /// Factor applied to the temperature at each cooling step, in `(0, 1)`.
    pub cooling_rate: f64,
    pub steps_per_temperature: u64,
}

impl AnnealingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.final_temperature.is_finite() || self.final_temperature < 0.0 {
            return Err(invalid(
                "final-temperature",
                format!("must be finite and non-negative, got {}", self.final_temperature),
            ));
        }
        if !(self.cooling_rate > 0.0 && self.cooling_rate < 1.0) {
            return Err(invalid(
                "cooling-rate",
                format!("must lie strictly between 0 and 1, got {}", self.cooling_rate),
            ));
        }
        if self.steps_per_temperature == 0 {
            return Err(invalid("steps-per-temperature", "must be at least 1"));
        }
        Ok(())
    }
}

/// Periodic steepest-descent refinement during sampling.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RefinementConfig {
    pub interval: u64,
    pub max_steps: usize,
    #[serde(default = "default_refinement_step_size")]
    pub step_size: f64,
}

impl RefinementConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(invalid("interval", "must be at least 1"));
        }
        if !(self.step_size > 0.0) || !self.step_size.is_finite() {
            return Err(invalid("step-size", format!("must be positive, got {}", self.step_size)));
        }
        Ok(())
    }

    pub fn to_minimizer_config(&self) -> MinimizerConfig {
        MinimizerConfig {
            max_steps: self.max_steps,
            initial_step_size: self.step_size,
            min_step_size: self.step_size * 1e-6,
            score_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MinimizerConfig {
    pub max_steps: usize,
    pub initial_step_size: f64,
    #[serde(default = "default_min_step_size")]
    pub min_step_size: f64,
    #[serde(default)]
    pub score_threshold: Option<f64>,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            initial_step_size: 0.1,
            min_step_size: default_min_step_size(),
            score_threshold: None,
        }
    }
}

impl MinimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.initial_step_size > 0.0) || !self.initial_step_size.is_finite() {
            return Err(invalid(
                "initial-step-size",
                format!("must be positive, got {}", self.initial_step_size),
            ));
        }
        if !(self.min_step_size >= 0.0) {
            return Err(invalid(
                "min-step-size",
                format!("must be non-negative, got {}", self.min_step_size),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SamplerConfig {
    pub max_steps: u64,
    pub temperature: f64,
    /// Per-entity probability that a mover perturbs it.
    #[serde(default = "default_move_probability")]
    pub move_probability: f64,
    /// Stop as soon as the score drops to or below this value.
    #[serde(default)]
    pub score_threshold: Option<f64>,
    /// Seed of the random number generator; drawn from entropy if absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub track_best: bool,
    #[serde(default)]
    pub annealing: Option<AnnealingConfig>,
    #[serde(default)]
    pub refinement: Option<RefinementConfig>,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(invalid(
                "temperature",
                format!("must be finite and non-negative, got {}", self.temperature),
            ));
        }
        if !(self.move_probability > 0.0 && self.move_probability <= 1.0) {
            return Err(invalid(
                "move-probability",
                format!("must lie in (0, 1], got {}", self.move_probability),
            ));
        }
        if let Some(annealing) = &self.annealing {
            annealing.validate()?;
        }
        if let Some(refinement) = &self.refinement {
            refinement.validate()?;
        }
        self.scoring.validate()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading sampler configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

#[derive(Default)]
pub struct SamplerConfigBuilder {
    max_steps: Option<u64>,
    temperature: Option<f64>,
    move_probability: Option<f64>,
    score_threshold: Option<f64>,
    seed: Option<u64>,
    track_best: bool,
    annealing: Option<AnnealingConfig>,
    refinement: Option<RefinementConfig>,
    scoring: Option<ScoringConfig>,
}

impl SamplerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
    pub fn move_probability(mut self, probability: f64) -> Self {
        self.move_probability = Some(probability);
        self
    }
    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
    pub fn track_best(mut self, track: bool) -> Self {
        self.track_best = track;
        self
    }
    pub fn annealing(mut self, annealing: AnnealingConfig) -> Self {
        self.annealing = Some(annealing);
        self
    }
    pub fn refinement(mut self, refinement: RefinementConfig) -> Self {
        self.refinement = Some(refinement);
        self
    }
    pub fn scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn build(self) -> Result<SamplerConfig, ConfigError> {
        let config = SamplerConfig {
            max_steps: self
                .max_steps
                .ok_or(ConfigError::MissingParameter("max_steps"))?,
            temperature: self
                .temperature
                .ok_or(ConfigError::MissingParameter("temperature"))?,
            move_probability: self.move_probability.unwrap_or_else(default_move_probability),
            score_threshold: self.score_threshold,
            seed: self.seed,
            track_best: self.track_best,
            annealing: self.annealing,
            refinement: self.refinement,
            scoring: self.scoring.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}
