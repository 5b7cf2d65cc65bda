//! Shrinkage model adapter
//!
//! The adaptive-shrinkage procedure is a collaborator behind the
//! [`ShrinkageProcedure`] trait. This module only shapes data for it:
//!
//! ```text
//! EffectTable ──reshape──> ShrinkageInput (J experiments × R metrics)
//!                               │
//!             estimate_null_correlation ──> C (R×R)
//!             build_candidate_covariances ──> [U_1 .. U_H]
//!             fit(input, C, U) ──> FittedModel
//! ```
//!
//! [`MashProcedure`] is the bundled implementation; any other type implementing
//! the trait can be dropped into [`ShrinkageAdapter`] unchanged.

mod mash;

pub use mash::MashProcedure;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::estimate::EffectTable;
use crate::simulate::Metric;
use crate::{Error, Result};

/// Aligned estimate and standard-error matrices (rows = experiments, columns = metrics)
#[derive(Debug, Clone, PartialEq)]
pub struct ShrinkageInput {
    estimates: DMatrix<f64>,
    standard_errors: DMatrix<f64>,
    experiments: Vec<u32>,
    metrics: Vec<String>,
}

impl ShrinkageInput {
    /// Pair estimate and standard-error matrices with their row/column labels
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the matrices differ in shape, and
    /// [`Error::InvalidParameter`] if the labels do not match the shape
    pub fn new(
        estimates: DMatrix<f64>,
        standard_errors: DMatrix<f64>,
        experiments: Vec<u32>,
        metrics: Vec<String>,
    ) -> Result<Self> {
        check_shape(&estimates, &standard_errors)?;
        if experiments.len() != estimates.nrows() || metrics.len() != estimates.ncols() {
            return Err(Error::invalid(format!(
                "labels are {}x{} but matrices are {}x{}",
                experiments.len(),
                metrics.len(),
                estimates.nrows(),
                estimates.ncols()
            )));
        }
        Ok(Self {
            estimates,
            standard_errors,
            experiments,
            metrics,
        })
    }

    /// Reshape an effect table: experiments ascending, metrics in [`Metric::ALL`] order
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the table has no experiments
    pub fn from_effects(table: &EffectTable) -> Result<Self> {
        let j = table.experiment_count();
        if j == 0 {
            return Err(Error::invalid("effect table is empty"));
        }
        let r = Metric::ALL.len();
        let mut estimates = DMatrix::zeros(j, r);
        let mut standard_errors = DMatrix::zeros(j, r);
        for e in table.estimates() {
            let row = e.experiment as usize;
            estimates[(row, e.metric.index())] = e.estimate;
            standard_errors[(row, e.metric.index())] = e.std_error;
        }
        Self::new(
            estimates,
            standard_errors,
            (0u32..).take(j).collect(),
            Metric::ALL.iter().map(|m| m.name().to_string()).collect(),
        )
    }

    /// Point estimates
    #[must_use]
    pub const fn estimates(&self) -> &DMatrix<f64> {
        &self.estimates
    }

    /// Standard errors
    #[must_use]
    pub const fn standard_errors(&self) -> &DMatrix<f64> {
        &self.standard_errors
    }

    /// Row labels
    #[must_use]
    pub fn experiments(&self) -> &[u32] {
        &self.experiments
    }

    /// Column labels
    #[must_use]
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    /// Number of rows
    #[must_use]
    pub fn n_experiments(&self) -> usize {
        self.estimates.nrows()
    }

    /// Number of columns
    #[must_use]
    pub fn n_metrics(&self) -> usize {
        self.estimates.ncols()
    }

    /// Elementwise `estimate / standard_error`
    #[must_use]
    pub fn z_scores(&self) -> DMatrix<f64> {
        self.estimates.component_div(&self.standard_errors)
    }
}

fn check_shape(estimates: &DMatrix<f64>, standard_errors: &DMatrix<f64>) -> Result<()> {
    if estimates.shape() != standard_errors.shape() {
        return Err(Error::ShapeMismatch {
            estimates: estimates.shape(),
            standard_errors: standard_errors.shape(),
        });
    }
    Ok(())
}

/// Named prior covariance for the effects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceHypothesis {
    /// Hypothesis name (`identity`, `equal_effects`, a metric name, ...)
    pub name: String,
    /// R×R covariance matrix
    pub matrix: DMatrix<f64>,
}

impl CovarianceHypothesis {
    /// Independent effects of equal size
    #[must_use]
    pub fn identity(r: usize) -> Self {
        Self {
            name: "identity".to_string(),
            matrix: DMatrix::identity(r, r),
        }
    }

    /// Effect present on a single metric only
    #[must_use]
    pub fn singleton(r: usize, index: usize, name: impl Into<String>) -> Self {
        let mut matrix = DMatrix::zeros(r, r);
        matrix[(index, index)] = 1.0;
        Self {
            name: name.into(),
            matrix,
        }
    }

    /// Identical effect on every metric
    #[must_use]
    pub fn equal_effects(r: usize) -> Self {
        Self {
            name: "equal_effects".to_string(),
            matrix: DMatrix::from_element(r, r, 1.0),
        }
    }

    /// Unit variances with a common off-diagonal correlation
    #[must_use]
    pub fn correlated(r: usize, correlation: f64, name: impl Into<String>) -> Self {
        let mut matrix = DMatrix::from_element(r, r, correlation);
        matrix.fill_diagonal(1.0);
        Self {
            name: name.into(),
            matrix,
        }
    }
}

/// One component of the fitted prior mixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureComponent {
    /// Hypothesis the component scales (`null` for the point mass)
    pub hypothesis: String,
    /// Grid scale ω; the component covariance is ω²·U
    pub scale: f64,
    /// Estimated mixture proportion
    pub weight: f64,
}

/// Everything a procedure must hand back from `fit`
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModelParts {
    /// Row labels, same order as the input
    pub experiments: Vec<u32>,
    /// Column labels, same order as the input
    pub metrics: Vec<String>,
    /// Posterior means (J×R)
    pub posterior_mean: DMatrix<f64>,
    /// Posterior standard deviations (J×R)
    pub posterior_sd: DMatrix<f64>,
    /// Local false sign rates (J×R)
    pub lfsr: DMatrix<f64>,
    /// Posterior probability of a negative effect (J×R)
    pub negative_prob: DMatrix<f64>,
    /// Mixture components with their weights
    pub components: Vec<MixtureComponent>,
    /// Log-likelihood at the fitted weights
    pub log_likelihood: f64,
    /// Null correlation the model was fitted with
    pub null_correlation: DMatrix<f64>,
}

/// Fitted shrinkage model; read-only once built
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    parts: FittedModelParts,
}

impl FittedModel {
    /// Assemble a model, checking every matrix is J×R
    ///
    /// # Errors
    ///
    /// Fails if any posterior matrix disagrees with the labels
    pub fn from_parts(parts: FittedModelParts) -> anyhow::Result<Self> {
        let shape = (parts.experiments.len(), parts.metrics.len());
        for (name, m) in [
            ("posterior_mean", &parts.posterior_mean),
            ("posterior_sd", &parts.posterior_sd),
            ("lfsr", &parts.lfsr),
            ("negative_prob", &parts.negative_prob),
        ] {
            anyhow::ensure!(
                m.shape() == shape,
                "{name} is {:?}, expected {shape:?}",
                m.shape()
            );
        }
        anyhow::ensure!(
            parts.null_correlation.shape() == (shape.1, shape.1),
            "null correlation is {:?}, expected {}x{}",
            parts.null_correlation.shape(),
            shape.1,
            shape.1
        );
        Ok(Self { parts })
    }

    /// Row labels
    #[must_use]
    pub fn experiments(&self) -> &[u32] {
        &self.parts.experiments
    }

    /// Column labels
    #[must_use]
    pub fn metrics(&self) -> &[String] {
        &self.parts.metrics
    }

    /// Posterior means (J×R)
    #[must_use]
    pub const fn posterior_mean(&self) -> &DMatrix<f64> {
        &self.parts.posterior_mean
    }

    /// Posterior standard deviations (J×R)
    #[must_use]
    pub const fn posterior_sd(&self) -> &DMatrix<f64> {
        &self.parts.posterior_sd
    }

    /// Local false sign rates (J×R)
    #[must_use]
    pub const fn lfsr(&self) -> &DMatrix<f64> {
        &self.parts.lfsr
    }

    /// Posterior probability of a negative effect (J×R)
    #[must_use]
    pub const fn negative_prob(&self) -> &DMatrix<f64> {
        &self.parts.negative_prob
    }

    /// Mixture components
    #[must_use]
    pub fn components(&self) -> &[MixtureComponent] {
        &self.parts.components
    }

    /// Log-likelihood at the fitted weights
    #[must_use]
    pub const fn log_likelihood(&self) -> f64 {
        self.parts.log_likelihood
    }

    /// Null correlation used for the fit
    #[must_use]
    pub const fn null_correlation(&self) -> &DMatrix<f64> {
        &self.parts.null_correlation
    }
}

/// Contract of an adaptive-shrinkage procedure
///
/// Errors are opaque to the caller; the adapter reports them as
/// [`Error::ExternalProcedureFailure`] without retrying.
pub trait ShrinkageProcedure {
    /// Correlation of sampling errors across metrics under the null (R×R)
    ///
    /// # Errors
    ///
    /// Procedure-specific
    fn estimate_null_correlation(&self, data: &ShrinkageInput) -> anyhow::Result<DMatrix<f64>>;

    /// Candidate prior covariances for the effects
    ///
    /// # Errors
    ///
    /// Procedure-specific
    fn build_candidate_covariances(
        &self,
        data: &ShrinkageInput,
    ) -> anyhow::Result<Vec<CovarianceHypothesis>>;

    /// Fit the mixture prior and compute posteriors
    ///
    /// # Errors
    ///
    /// Procedure-specific
    fn fit(
        &self,
        data: &ShrinkageInput,
        null_correlation: &DMatrix<f64>,
        hypotheses: &[CovarianceHypothesis],
    ) -> anyhow::Result<FittedModel>;
}

/// Shapes inputs for a [`ShrinkageProcedure`] and validates what comes back
#[derive(Debug, Clone, Default)]
pub struct ShrinkageAdapter<P> {
    procedure: P,
}

impl<P: ShrinkageProcedure> ShrinkageAdapter<P> {
    /// Wrap a procedure
    #[must_use]
    pub const fn new(procedure: P) -> Self {
        Self { procedure }
    }

    /// Wrapped procedure
    #[must_use]
    pub const fn procedure(&self) -> &P {
        &self.procedure
    }

    /// Reshape an effect table and fit
    ///
    /// # Errors
    ///
    /// See [`ShrinkageAdapter::fit_input`]
    pub fn fit_effects(&self, table: &EffectTable) -> Result<FittedModel> {
        self.fit_input(&ShrinkageInput::from_effects(table)?)
    }

    /// Fit raw matrices with their labels
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] before invoking the procedure if the
    /// matrices are misaligned; otherwise see [`ShrinkageAdapter::fit_input`]
    pub fn fit_matrices(
        &self,
        estimates: DMatrix<f64>,
        standard_errors: DMatrix<f64>,
        experiments: Vec<u32>,
        metrics: Vec<String>,
    ) -> Result<FittedModel> {
        let input = ShrinkageInput::new(estimates, standard_errors, experiments, metrics)?;
        self.fit_input(&input)
    }

    /// Run the three procedure calls in order
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] for misaligned input and
    /// [`Error::ExternalProcedureFailure`] when a call fails or returns
    /// something of the wrong shape
    pub fn fit_input(&self, input: &ShrinkageInput) -> Result<FittedModel> {
        check_shape(input.estimates(), input.standard_errors())?;
        let r = input.n_metrics();

        let null_correlation = self
            .procedure
            .estimate_null_correlation(input)
            .map_err(|e| Error::procedure("estimate_null_correlation", &e))?;
        if null_correlation.shape() != (r, r) {
            return Err(Error::procedure(
                "estimate_null_correlation",
                &anyhow::anyhow!("returned {:?}, expected {r}x{r}", null_correlation.shape()),
            ));
        }
        tracing::info!(
            correlation = ?null_correlation.as_slice(),
            "null correlation estimated"
        );

        let hypotheses = self
            .procedure
            .build_candidate_covariances(input)
            .map_err(|e| Error::procedure("build_candidate_covariances", &e))?;
        if hypotheses.is_empty() {
            return Err(Error::procedure(
                "build_candidate_covariances",
                &anyhow::anyhow!("no candidate covariances"),
            ));
        }
        if let Some(bad) = hypotheses.iter().find(|h| h.matrix.shape() != (r, r)) {
            return Err(Error::procedure(
                "build_candidate_covariances",
                &anyhow::anyhow!("{} is {:?}, expected {r}x{r}", bad.name, bad.matrix.shape()),
            ));
        }
        tracing::info!(hypotheses = hypotheses.len(), "candidate covariances built");

        let model = self
            .procedure
            .fit(input, &null_correlation, &hypotheses)
            .map_err(|e| Error::procedure("fit", &e))?;
        if model.experiments() != input.experiments() || model.metrics() != input.metrics() {
            return Err(Error::procedure(
                "fit",
                &anyhow::anyhow!("fitted model labels do not match the input"),
            ));
        }
        tracing::info!(
            log_likelihood = model.log_likelihood(),
            components = model.components().len(),
            "shrinkage model fitted"
        );
        Ok(model)
    }
}
