//! Result reporter
//!
//! Read-only views over a [`FittedModel`], and the combined raw-versus-posterior
//! report handed to downstream consumers.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::estimate::EffectTable;
use crate::shrinkage::{FittedModel, MixtureComponent};
use crate::simulate::Metric;
use crate::{Error, Result};

/// Accessors over a fitted model; never mutates it
#[derive(Debug, Clone, Copy)]
pub struct ResultReporter<'a> {
    model: &'a FittedModel,
}

impl<'a> ResultReporter<'a> {
    /// Borrow a fitted model
    #[must_use]
    pub const fn new(model: &'a FittedModel) -> Self {
        Self { model }
    }

    /// Posterior means (experiments × metrics)
    #[must_use]
    pub const fn posterior_means(&self) -> &'a DMatrix<f64> {
        self.model.posterior_mean()
    }

    /// Posterior standard deviations (experiments × metrics)
    #[must_use]
    pub const fn posterior_sds(&self) -> &'a DMatrix<f64> {
        self.model.posterior_sd()
    }

    /// Local false sign rates (experiments × metrics)
    #[must_use]
    pub const fn lfsr(&self) -> &'a DMatrix<f64> {
        self.model.lfsr()
    }

    /// Experiments with lfsr below `threshold` in at least one metric
    ///
    /// Ordered by their smallest lfsr, strongest evidence first.
    #[must_use]
    pub fn significant_experiments(&self, threshold: f64) -> Vec<u32> {
        let lfsr = self.model.lfsr();
        let mut hits: Vec<(f64, u32)> = self
            .model
            .experiments()
            .iter()
            .enumerate()
            .filter_map(|(row, &experiment)| {
                let best = lfsr.row(row).min();
                (best < threshold).then_some((best, experiment))
            })
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.into_iter().map(|(_, e)| e).collect()
    }

    /// Pairwise sharing between metrics (R×R)
    ///
    /// Entry (i, j) is the share of experiments significant in i or j whose
    /// posterior means have a ratio in `(factor, 1/factor)`: same sign for
    /// `factor = 0`, within a factor of two for `factor = 0.5`. Pairs with no
    /// significant experiment are `NaN`.
    #[must_use]
    pub fn pairwise_sharing(&self, factor: f64, lfsr_threshold: f64) -> DMatrix<f64> {
        let lfsr = self.model.lfsr();
        let pm = self.model.posterior_mean();
        let r = pm.ncols();
        let upper = 1.0 / factor;

        let mut sharing = DMatrix::identity(r, r);
        for i in 0..r {
            for j in (i + 1)..r {
                let (mut shared, mut total) = (0usize, 0usize);
                for row in 0..pm.nrows() {
                    if lfsr[(row, i)] >= lfsr_threshold && lfsr[(row, j)] >= lfsr_threshold {
                        continue;
                    }
                    total += 1;
                    let ratio = pm[(row, i)] / pm[(row, j)];
                    if ratio > factor && ratio < upper {
                        shared += 1;
                    }
                }
                #[allow(clippy::cast_precision_loss)]
                let value = if total == 0 {
                    f64::NAN
                } else {
                    shared as f64 / total as f64
                };
                sharing[(i, j)] = value;
                sharing[(j, i)] = value;
            }
        }
        sharing
    }

    /// Mixture weight per hypothesis, summed over the grid; `null` first
    #[must_use]
    pub fn estimated_pi(&self) -> Vec<HypothesisWeight> {
        let mut weights: Vec<HypothesisWeight> = Vec::new();
        for component in self.model.components() {
            match weights.iter_mut().find(|w| w.hypothesis == component.hypothesis) {
                Some(w) => w.weight += component.weight,
                None => weights.push(HypothesisWeight {
                    hypothesis: component.hypothesis.clone(),
                    weight: component.weight,
                }),
            }
        }
        weights
    }

    /// Raw per-component weights
    #[must_use]
    pub fn mixture_weights(&self) -> &'a [MixtureComponent] {
        self.model.components()
    }

    /// Join raw estimates with posteriors into a report
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the table and the model do not
    /// cover the same experiments and metrics, matched by label
    pub fn report(&self, effects: &EffectTable, lfsr_threshold: f64) -> Result<ShrinkageReport> {
        let model = self.model;
        let mismatch = || Error::ShapeMismatch {
            estimates: (effects.experiment_count(), Metric::ALL.len()),
            standard_errors: model.posterior_mean().shape(),
        };
        let metrics_match = model
            .metrics()
            .iter()
            .map(String::as_str)
            .eq(Metric::ALL.iter().map(|m| m.name()));
        if !metrics_match || model.experiments().len() != effects.experiment_count() {
            return Err(mismatch());
        }

        let mut experiments = Vec::with_capacity(model.experiments().len());
        for (row, &experiment) in model.experiments().iter().enumerate() {
            let mut metrics = Vec::with_capacity(Metric::ALL.len());
            for metric in Metric::ALL {
                // Joined by label; a label missing from the table is a mismatch
                let raw = effects.get(experiment, metric).ok_or_else(mismatch)?;
                let col = metric.index();
                let lfsr = model.lfsr()[(row, col)];
                metrics.push(MetricReport {
                    metric,
                    estimate: raw.estimate,
                    std_error: raw.std_error,
                    ci_lower: raw.ci_lower,
                    ci_upper: raw.ci_upper,
                    significant: raw.significant,
                    posterior_mean: model.posterior_mean()[(row, col)],
                    posterior_sd: model.posterior_sd()[(row, col)],
                    lfsr,
                    posterior_significant: lfsr < lfsr_threshold,
                });
            }
            experiments.push(ExperimentReport {
                experiment,
                metrics,
            });
        }

        Ok(ShrinkageReport {
            confidence_level: effects.confidence_level(),
            lfsr_threshold,
            log_likelihood: model.log_likelihood(),
            mixture: self.estimated_pi(),
            experiments,
        })
    }
}

/// Mixture weight of one hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisWeight {
    /// Hypothesis name
    pub hypothesis: String,
    /// Total weight over the grid
    pub weight: f64,
}

/// Raw and posterior view of one (experiment, metric)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    /// Metric
    pub metric: Metric,
    /// Raw difference in means
    pub estimate: f64,
    /// Raw standard error
    pub std_error: f64,
    /// Raw lower bound
    pub ci_lower: f64,
    /// Raw upper bound
    pub ci_upper: f64,
    /// Raw interval excludes zero
    pub significant: bool,
    /// Shrunk estimate
    pub posterior_mean: f64,
    /// Posterior standard deviation
    pub posterior_sd: f64,
    /// Local false sign rate
    pub lfsr: f64,
    /// lfsr below the reporting threshold
    pub posterior_significant: bool,
}

/// All metrics of one experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Experiment bucket
    pub experiment: u32,
    /// One entry per metric
    pub metrics: Vec<MetricReport>,
}

/// Tabular report of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShrinkageReport {
    /// Confidence level of the raw intervals
    pub confidence_level: f64,
    /// lfsr threshold of the posterior calls
    pub lfsr_threshold: f64,
    /// Log-likelihood of the fitted model
    pub log_likelihood: f64,
    /// Global mixture proportions over hypotheses
    pub mixture: Vec<HypothesisWeight>,
    /// Per-experiment rows
    pub experiments: Vec<ExperimentReport>,
}

impl ShrinkageReport {
    fn metric_rows(&self) -> impl Iterator<Item = (u32, &MetricReport)> {
        self.experiments
            .iter()
            .flat_map(|e| e.metrics.iter().map(move |m| (e.experiment, m)))
    }

    /// Experiments whose raw interval excludes zero on any metric
    #[must_use]
    pub fn raw_significant_count(&self) -> usize {
        self.experiments
            .iter()
            .filter(|e| e.metrics.iter().any(|m| m.significant))
            .count()
    }

    /// Experiments with a posterior call on any metric
    #[must_use]
    pub fn posterior_significant_count(&self) -> usize {
        self.experiments
            .iter()
            .filter(|e| e.metrics.iter().any(|m| m.posterior_significant))
            .count()
    }

    /// Pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Long-format Arrow batch, one row per (experiment, metric)
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the columns
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("experiment", DataType::UInt32, false),
            Field::new("metric", DataType::Utf8, false),
            Field::new("estimate", DataType::Float64, false),
            Field::new("std_error", DataType::Float64, false),
            Field::new("ci_lower", DataType::Float64, false),
            Field::new("ci_upper", DataType::Float64, false),
            Field::new("significant", DataType::Boolean, false),
            Field::new("posterior_mean", DataType::Float64, false),
            Field::new("posterior_sd", DataType::Float64, false),
            Field::new("lfsr", DataType::Float64, false),
            Field::new("posterior_significant", DataType::Boolean, false),
        ]));

        let rows: Vec<(u32, &MetricReport)> = self.metric_rows().collect();
        let f64_col = |f: fn(&MetricReport) -> f64| -> ArrayRef {
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|(_, m)| f(m))))
        };
        let bool_col = |f: fn(&MetricReport) -> bool| -> ArrayRef {
            Arc::new(BooleanArray::from(
                rows.iter().map(|(_, m)| f(m)).collect::<Vec<_>>(),
            ))
        };
        let metric_names: Vec<&str> = rows.iter().map(|(_, m)| m.metric.name()).collect();

        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|(e, _)| *e))),
            Arc::new(StringArray::from(metric_names)),
            f64_col(|m| m.estimate),
            f64_col(|m| m.std_error),
            f64_col(|m| m.ci_lower),
            f64_col(|m| m.ci_upper),
            bool_col(|m| m.significant),
            f64_col(|m| m.posterior_mean),
            f64_col(|m| m.posterior_sd),
            f64_col(|m| m.lfsr),
            bool_col(|m| m.posterior_significant),
        ];
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}
