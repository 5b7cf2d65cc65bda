//! Pipeline configuration
//!
//! Configuration is plain serde data with defaults for every field, so a JSON
//! file only needs to name what it overrides:
//!
//! ```rust
//! use aa_shrinkage::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json_str(
//!     r#"{ "simulation": { "population_size": 20000, "experiment_count": 20 } }"#,
//! )?;
//! assert_eq!(config.simulation.experiment_count, 20);
//! assert!((config.simulation.correlation - 0.4).abs() < f64::EPSILON);
//! # Ok::<(), aa_shrinkage::Error>(())
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How correlated pairs are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// Sample moments match the target exactly (means 0, SDs 1, correlation ρ)
    #[default]
    Exact,
    /// Ordinary random sampling; moments match only in expectation
    Random,
}

/// Simulation parameters: population, correlation, bucketing and seed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated units
    pub population_size: usize,
    /// Target unit-level correlation between the two metrics
    pub correlation: f64,
    /// Number of independent experiments the population is split into
    pub experiment_count: usize,
    /// Seed for the single pipeline-wide generator
    pub seed: u64,
    /// Confidence level (1 - α) of the per-experiment intervals
    pub confidence_level: f64,
    /// Sampling mode of the simulator
    pub sampling: SamplingMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            population_size: 1_000_000,
            correlation: 0.4,
            experiment_count: 1000,
            seed: 1,
            confidence_level: 0.95,
            sampling: SamplingMode::Exact,
        }
    }
}

impl SimulationConfig {
    /// Two-sided significance level α
    #[must_use]
    pub fn alpha(&self) -> f64 {
        1.0 - self.confidence_level
    }

    /// Validate ranges before any work is done
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        if self.population_size < 2 {
            return Err(Error::invalid(format!(
                "population_size must be at least 2, got {}",
                self.population_size
            )));
        }
        if self.sampling == SamplingMode::Exact && self.population_size < 3 {
            return Err(Error::invalid(format!(
                "exact sampling needs population_size of at least 3, got {}\nUse a larger population or \"sampling\": \"random\"",
                self.population_size
            )));
        }
        validate_correlation(self.correlation)?;
        if self.experiment_count == 0 {
            return Err(Error::invalid("experiment_count must be greater than 0"));
        }
        validate_confidence_level(self.confidence_level)
    }
}

/// Smallest accepted ratio between consecutive grid scales
pub const MIN_GRID_MULTIPLIER: f64 = 1.05;

/// Shrinkage fitting and reporting parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkageConfig {
    /// lfsr below which a posterior effect is called significant
    pub lfsr_threshold: f64,
    /// Magnitude factor for pairwise sharing (0 = same sign only)
    pub sharing_factor: f64,
    /// Rows with every |z| below this are treated as null when estimating correlation
    pub null_z_threshold: f64,
    /// Ratio between consecutive grid scales
    pub grid_multiplier: f64,
    /// Dirichlet prior weight on the null component
    pub null_weight: f64,
    /// EM iteration cap
    pub max_iterations: usize,
    /// EM convergence tolerance on the mixture weights
    pub tolerance: f64,
}

impl Default for ShrinkageConfig {
    fn default() -> Self {
        Self {
            lfsr_threshold: 0.05,
            sharing_factor: 0.5,
            null_z_threshold: 2.0,
            grid_multiplier: std::f64::consts::SQRT_2,
            null_weight: 10.0,
            max_iterations: 1000,
            tolerance: 1e-8,
        }
    }
}

impl ShrinkageConfig {
    /// Validate ranges before fitting
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the offending field
    pub fn validate(&self) -> Result<()> {
        if !(self.lfsr_threshold > 0.0 && self.lfsr_threshold < 1.0) {
            return Err(Error::invalid(format!(
                "lfsr_threshold must be in (0, 1), got {}",
                self.lfsr_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.sharing_factor) {
            return Err(Error::invalid(format!(
                "sharing_factor must be in [0, 1], got {}",
                self.sharing_factor
            )));
        }
        if !(self.null_z_threshold.is_finite() && self.null_z_threshold > 0.0) {
            return Err(Error::invalid("null_z_threshold must be positive"));
        }
        if !(self.grid_multiplier.is_finite() && self.grid_multiplier >= MIN_GRID_MULTIPLIER) {
            return Err(Error::invalid(format!(
                "grid_multiplier must be at least {MIN_GRID_MULTIPLIER}, got {}\nSmaller ratios make the prior grid too dense to fit",
                self.grid_multiplier
            )));
        }
        if !(self.null_weight.is_finite() && self.null_weight >= 1.0) {
            return Err(Error::invalid("null_weight must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(Error::invalid("max_iterations must be greater than 0"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(Error::invalid("tolerance must be positive"));
        }
        Ok(())
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Simulation stage parameters
    pub simulation: SimulationConfig,
    /// Shrinkage stage parameters
    pub shrinkage: ShrinkageConfig,
}

impl PipelineConfig {
    /// Parse a JSON configuration and validate it
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input, [`Error::InvalidParameter`]
    /// when a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`PipelineConfig::from_json_str`]
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Validate both stages
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::InvalidParameter`] found
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.shrinkage.validate()
    }
}

pub(crate) fn validate_correlation(rho: f64) -> Result<()> {
    if !rho.is_finite() || rho.abs() >= 1.0 {
        return Err(Error::invalid(format!(
            "correlation must lie strictly between -1 and 1, got {rho}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_confidence_level(level: f64) -> Result<()> {
    if !(level > 0.0 && level < 1.0) {
        return Err(Error::invalid(format!(
            "confidence_level must be in (0, 1), got {level}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.simulation.sampling, SamplingMode::Exact);
        assert!((config.simulation.alpha() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{"shrinkage": {"sharing_factor": 0.0}}"#).unwrap();
        assert!(config.shrinkage.sharing_factor.abs() < f64::EPSILON);
        assert_eq!(config.simulation.population_size, 1_000_000);
    }

    #[test]
    fn test_sampling_mode_snake_case() {
        let config =
            PipelineConfig::from_json_str(r#"{"simulation": {"sampling": "random"}}"#).unwrap();
        assert_eq!(config.simulation.sampling, SamplingMode::Random);
    }

    #[test]
    fn test_rejects_unit_correlation() {
        let err = PipelineConfig::from_json_str(r#"{"simulation": {"correlation": 1.0}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_rejects_zero_experiments() {
        let config = SimulationConfig {
            experiment_count: 0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exact_sampling_needs_three_units() {
        let config = SimulationConfig {
            population_size: 2,
            ..SimulationConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exact sampling"));

        let random = SimulationConfig {
            sampling: SamplingMode::Random,
            ..config
        };
        assert!(random.validate().is_ok());
    }

    #[test]
    fn test_rejects_dense_grid_multiplier() {
        let config = ShrinkageConfig {
            grid_multiplier: 1.0 + 1e-6,
            ..ShrinkageConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));

        let config = ShrinkageConfig {
            grid_multiplier: MIN_GRID_MULTIPLIER,
            ..ShrinkageConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_grid_multiplier() {
        let config = ShrinkageConfig {
            grid_multiplier: 1.0,
            ..ShrinkageConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("grid_multiplier"));
    }
}
