//! Effect estimator
//!
//! Grouped aggregation over (experiment, condition, metric): each group keeps a
//! Welford accumulator, then every (experiment, metric) pair is turned into a
//! difference-in-means estimate with a normal-approximation interval.
//!
//! ```text
//! estimate = mean(treatment) - mean(control)
//! se       = sqrt(se_t^2 + se_c^2)            se_x = sd_x / sqrt(n_x)
//! ci       = estimate ± z·se                  z = Φ⁻¹(1 - α/2)
//! ```

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::assign::{AssignedPopulation, Condition};
use crate::config::validate_confidence_level;
use crate::simulate::Metric;
use crate::stats::{pearson, OnlineStats};
use crate::{Error, Result};

/// Treatment effect of one experiment on one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectEstimate {
    /// Experiment bucket
    pub experiment: u32,
    /// Outcome metric
    pub metric: Metric,
    /// Mean difference, treatment minus control
    pub estimate: f64,
    /// Combined standard error of the difference
    pub std_error: f64,
    /// Lower confidence bound
    pub ci_lower: f64,
    /// Upper confidence bound
    pub ci_upper: f64,
    /// Interval excludes zero
    pub significant: bool,
    /// Control group size
    pub control_n: usize,
    /// Treatment group size
    pub treatment_n: usize,
}

impl EffectEstimate {
    /// Build an estimate from the two arms' accumulators
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientData`] if either arm has fewer than two
    /// observations
    pub fn from_arms(
        experiment: u32,
        metric: Metric,
        control: &OnlineStats,
        treatment: &OnlineStats,
        critical_value: f64,
    ) -> Result<Self> {
        let se_c = arm_standard_error(experiment, Condition::Control, metric, control)?;
        let se_t = arm_standard_error(experiment, Condition::Treatment, metric, treatment)?;

        let estimate = treatment.mean() - control.mean();
        let std_error = se_t.hypot(se_c);
        let margin = std_error * critical_value;
        let ci_lower = estimate - margin;
        let ci_upper = estimate + margin;

        Ok(Self {
            experiment,
            metric,
            estimate,
            std_error,
            ci_lower,
            ci_upper,
            significant: ci_lower > 0.0 || ci_upper < 0.0,
            control_n: control.count(),
            treatment_n: treatment.count(),
        })
    }

    /// Half-width of the interval
    #[must_use]
    pub fn margin(&self) -> f64 {
        (self.ci_upper - self.ci_lower) / 2.0
    }
}

fn arm_standard_error(
    experiment: u32,
    condition: Condition,
    metric: Metric,
    stats: &OnlineStats,
) -> Result<f64> {
    stats
        .standard_error()
        .ok_or_else(|| Error::InsufficientData {
            experiment,
            condition: condition.name().to_string(),
            metric: metric.name().to_string(),
            observations: stats.count(),
        })
}

/// Two-sided normal critical value for a confidence level
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if the level is outside (0, 1)
pub fn critical_value(confidence_level: f64) -> Result<f64> {
    validate_confidence_level(confidence_level)?;
    let normal = Normal::new(0.0, 1.0).map_err(|e| Error::invalid(e.to_string()))?;
    Ok(normal.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0))
}

/// All effect estimates of a run, ordered by experiment then metric
///
/// Only [`EffectEstimator`] builds tables, which keeps the ordering intact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectTable {
    confidence_level: f64,
    critical_value: f64,
    experiment_count: usize,
    estimates: Vec<EffectEstimate>,
}

impl EffectTable {
    /// Confidence level used for the intervals
    #[must_use]
    pub const fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// z multiplier used for the intervals
    #[must_use]
    pub const fn critical_value(&self) -> f64 {
        self.critical_value
    }

    /// Number of experiments
    #[must_use]
    pub const fn experiment_count(&self) -> usize {
        self.experiment_count
    }

    /// Every estimate, experiment-major
    #[must_use]
    pub fn estimates(&self) -> &[EffectEstimate] {
        &self.estimates
    }

    /// Estimate for one (experiment, metric) pair
    #[must_use]
    pub fn get(&self, experiment: u32, metric: Metric) -> Option<&EffectEstimate> {
        self.estimates
            .get(experiment as usize * Metric::ALL.len() + metric.index())
            .filter(|e| e.experiment == experiment && e.metric == metric)
    }

    /// Estimates of one metric, in experiment order
    pub fn for_metric(&self, metric: Metric) -> impl Iterator<Item = &EffectEstimate> {
        self.estimates.iter().filter(move |e| e.metric == metric)
    }

    /// Share of intervals excluding zero, for one metric or pooled over all
    #[must_use]
    pub fn significance_rate(&self, metric: Option<Metric>) -> f64 {
        let (hits, total) = self
            .estimates
            .iter()
            .filter(|e| metric.map_or(true, |m| e.metric == m))
            .fold((0usize, 0usize), |(h, t), e| (h + usize::from(e.significant), t + 1));
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = hits as f64 / total as f64;
        rate
    }

    /// Correlation across experiments between the two metrics' point estimates
    #[must_use]
    pub fn estimate_correlation(&self) -> Option<f64> {
        let a: Vec<f64> = self.for_metric(Metric::MetricA).map(|e| e.estimate).collect();
        let b: Vec<f64> = self.for_metric(Metric::MetricB).map(|e| e.estimate).collect();
        pearson(&a, &b)
    }
}

/// Difference-in-means estimator at a fixed confidence level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectEstimator {
    confidence_level: f64,
    critical_value: f64,
}

impl EffectEstimator {
    /// Create an estimator for `confidence_level` = 1 - α
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the level is outside (0, 1)
    pub fn new(confidence_level: f64) -> Result<Self> {
        Ok(Self {
            confidence_level,
            critical_value: critical_value(confidence_level)?,
        })
    }

    /// z multiplier for the configured level
    #[must_use]
    pub const fn critical_value(&self) -> f64 {
        self.critical_value
    }

    /// Estimate every (experiment, metric) effect
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientData`] for the first group (in experiment,
    /// metric, control-then-treatment order) with fewer than two observations
    pub fn estimate(&self, data: &AssignedPopulation) -> Result<EffectTable> {
        let k = data.experiment_count();
        // groups[experiment][condition][metric]
        let mut groups = vec![[[OnlineStats::new(); 2]; 2]; k];
        for (unit, assignment) in data.rows() {
            let arms = &mut groups[assignment.experiment as usize][assignment.condition.index()];
            for metric in Metric::ALL {
                arms[metric.index()].update(unit.value(metric));
            }
        }

        let mut estimates = Vec::with_capacity(k * Metric::ALL.len());
        for (experiment, arms) in (0u32..).zip(&groups) {
            for metric in Metric::ALL {
                estimates.push(EffectEstimate::from_arms(
                    experiment,
                    metric,
                    &arms[Condition::Control.index()][metric.index()],
                    &arms[Condition::Treatment.index()][metric.index()],
                    self.critical_value,
                )?);
            }
        }

        Ok(EffectTable {
            confidence_level: self.confidence_level,
            critical_value: self.critical_value,
            experiment_count: k,
            estimates,
        })
    }
}
