//! Multivariate adaptive shrinkage (mash-style) procedure
//!
//! Prior on the effect vector `β_j` of experiment `j`:
//!
//! ```text
//! β_j ~ π_0·δ_0 + Σ_{h,l} π_{hl}·N(0, ω_l²·U_h)
//! b_j | β_j ~ N(β_j, V_j),   V_j = diag(s_j)·C·diag(s_j)
//! ```
//!
//! `C` is the null correlation of sampling errors, `U_h` the candidate
//! covariances and `ω_l` a geometric grid chosen from the data. Mixture weights
//! are fitted by EM with a Dirichlet prior that favours the null component;
//! each component then has a closed-form normal posterior.

use anyhow::{bail, ensure, Context};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use statrs::distribution::{ContinuousCDF, Normal};

use super::{
    CovarianceHypothesis, FittedModel, FittedModelParts, MixtureComponent, ShrinkageInput,
    ShrinkageProcedure,
};
use crate::config::ShrinkageConfig;

/// Correlations of the `simple_het_*` hypotheses
const SIMPLE_HET_CORRELATIONS: [f64; 3] = [0.25, 0.5, 0.75];

/// Upper bound on the number of grid scales
const MAX_GRID_POINTS: f64 = 512.0;

/// Largest |ρ| kept in an estimated null correlation
const MAX_NULL_CORRELATION: f64 = 1.0 - 1e-6;

/// Name of the point-mass component
pub(crate) const NULL_COMPONENT: &str = "null";

/// Bundled [`ShrinkageProcedure`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MashProcedure {
    config: ShrinkageConfig,
}

/// One prior component: `scale² · matrix`, or the point mass when `matrix` is `None`
struct Component {
    hypothesis: String,
    scale: f64,
    covariance: Option<DMatrix<f64>>,
}

impl MashProcedure {
    /// Procedure with explicit tuning
    #[must_use]
    pub const fn new(config: ShrinkageConfig) -> Self {
        Self { config }
    }

    /// Tuning in use
    #[must_use]
    pub const fn config(&self) -> &ShrinkageConfig {
        &self.config
    }

    /// Geometric grid of prior scales, ascending, ending at the largest
    fn grid(&self, data: &ShrinkageInput) -> anyhow::Result<Vec<f64>> {
        let b = data.estimates();
        let s = data.standard_errors();
        let min_se = s.iter().copied().fold(f64::INFINITY, f64::min);
        let grid_min = min_se / 10.0;

        let excess = b
            .iter()
            .zip(s.iter())
            .map(|(b, s)| b.mul_add(*b, -s * s))
            .fold(f64::NEG_INFINITY, f64::max);
        let grid_max = if excess > 0.0 {
            2.0 * excess.sqrt()
        } else {
            8.0 * grid_min
        };
        if grid_max <= grid_min {
            return Ok(vec![grid_max]);
        }

        let mult = self.config.grid_multiplier;
        ensure!(
            mult.is_finite() && mult > 1.0,
            "grid multiplier must be greater than 1, got {mult}"
        );
        let steps = ((grid_max / grid_min).log2() / mult.log2()).ceil();
        ensure!(
            steps < MAX_GRID_POINTS,
            "grid multiplier {mult} needs {steps} scales between {grid_min:.3e} and {grid_max:.3e}, at most {MAX_GRID_POINTS} allowed"
        );
        #[allow(clippy::cast_possible_truncation)]
        let npoint = steps as i32;
        Ok((-npoint..=0).map(|p| mult.powi(p) * grid_max).collect())
    }

    fn components(&self, grid: &[f64], hypotheses: &[CovarianceHypothesis]) -> Vec<Component> {
        let mut components = vec![Component {
            hypothesis: NULL_COMPONENT.to_string(),
            scale: 0.0,
            covariance: None,
        }];
        for &scale in grid {
            for h in hypotheses {
                components.push(Component {
                    hypothesis: h.name.clone(),
                    scale,
                    covariance: Some(&h.matrix * (scale * scale)),
                });
            }
        }
        components
    }

    /// EM for the mixture weights under a Dirichlet(null_weight, 1, ..., 1) prior
    fn fit_weights(&self, relative_lik: &DMatrix<f64>) -> Vec<f64> {
        let (j, k) = relative_lik.shape();
        #[allow(clippy::cast_precision_loss)]
        let mut pi = vec![1.0 / k as f64; k];
        let mut counts = vec![0.0; k];

        for iteration in 0..self.config.max_iterations {
            counts.iter_mut().for_each(|c| *c = 0.0);
            for row in 0..j {
                let total: f64 = (0..k).map(|c| pi[c] * relative_lik[(row, c)]).sum();
                if total <= 0.0 {
                    continue;
                }
                for c in 0..k {
                    counts[c] += pi[c] * relative_lik[(row, c)] / total;
                }
            }
            // Dirichlet pseudo-counts: null_weight - 1 on the null, 0 elsewhere
            counts[0] += self.config.null_weight - 1.0;
            let norm: f64 = counts.iter().sum();

            let mut delta = 0.0f64;
            for (p, c) in pi.iter_mut().zip(&counts) {
                let next = c / norm;
                delta = delta.max((next - *p).abs());
                *p = next;
            }
            if delta < self.config.tolerance {
                tracing::debug!(iterations = iteration + 1, delta, "EM converged");
                return pi;
            }
        }
        tracing::warn!(
            max_iterations = self.config.max_iterations,
            "EM stopped at the iteration cap"
        );
        pi
    }
}

impl ShrinkageProcedure for MashProcedure {
    /// Correlation of z-scores over rows with every |z| below the null threshold
    fn estimate_null_correlation(&self, data: &ShrinkageInput) -> anyhow::Result<DMatrix<f64>> {
        check_finite(data)?;
        let z = data.z_scores();
        let r = data.n_metrics();
        let threshold = self.config.null_z_threshold;

        let null_rows: Vec<usize> = (0..z.nrows())
            .filter(|&row| z.row(row).iter().all(|v| v.abs() < threshold))
            .collect();
        ensure!(
            null_rows.len() >= r.max(2),
            "not enough null data points: {} rows with all |z| < {threshold}, need {}",
            null_rows.len(),
            r.max(2)
        );

        let columns: Vec<Vec<f64>> = (0..r)
            .map(|c| null_rows.iter().map(|&row| z[(row, c)]).collect())
            .collect();
        let mut corr = DMatrix::identity(r, r);
        for a in 0..r {
            for b in (a + 1)..r {
                let rho = crate::stats::pearson(&columns[a], &columns[b]).with_context(|| {
                    format!("null z-scores of {} or {} have no spread", data.metrics()[a], data.metrics()[b])
                })?;
                let rho = rho.clamp(-MAX_NULL_CORRELATION, MAX_NULL_CORRELATION);
                corr[(a, b)] = rho;
                corr[(b, a)] = rho;
            }
        }
        tracing::debug!(null_rows = null_rows.len(), "null rows selected");
        Ok(corr)
    }

    /// identity, one singleton per metric, equal effects, three intermediate correlations
    fn build_candidate_covariances(
        &self,
        data: &ShrinkageInput,
    ) -> anyhow::Result<Vec<CovarianceHypothesis>> {
        let r = data.n_metrics();
        ensure!(r > 0, "input has no metrics");

        let mut hypotheses = vec![CovarianceHypothesis::identity(r)];
        hypotheses.extend(
            data.metrics()
                .iter()
                .enumerate()
                .map(|(i, name)| CovarianceHypothesis::singleton(r, i, name.clone())),
        );
        hypotheses.push(CovarianceHypothesis::equal_effects(r));
        hypotheses.extend(
            SIMPLE_HET_CORRELATIONS
                .iter()
                .enumerate()
                .map(|(i, &c)| CovarianceHypothesis::correlated(r, c, format!("simple_het_{}", i + 1))),
        );
        Ok(hypotheses)
    }

    fn fit(
        &self,
        data: &ShrinkageInput,
        null_correlation: &DMatrix<f64>,
        hypotheses: &[CovarianceHypothesis],
    ) -> anyhow::Result<FittedModel> {
        check_finite(data)?;
        let (j, r) = data.estimates().shape();
        ensure!(j > 0, "input has no experiments");
        ensure!(
            null_correlation.shape() == (r, r),
            "null correlation must be {r}x{r}"
        );

        let null_factorizable = Cholesky::new(null_correlation.clone())
            .is_some_and(|c| c.l_dirty().diagonal().iter().all(|d| *d > 1e-8));
        ensure!(
            null_factorizable,
            "null correlation is not positive definite (perfectly correlated metrics?): {:?}",
            null_correlation.as_slice()
        );

        let grid = self.grid(data)?;
        let components = self.components(&grid, hypotheses);
        let k = components.len();
        tracing::debug!(grid_points = grid.len(), components = k, "prior grid built");

        let sampling_cov: Vec<DMatrix<f64>> = (0..j)
            .map(|row| {
                let s = DMatrix::from_diagonal(&data.standard_errors().row(row).transpose());
                &s * null_correlation * &s
            })
            .collect();
        let observations: Vec<DVector<f64>> = (0..j)
            .map(|row| data.estimates().row(row).transpose())
            .collect();

        // Log-likelihoods, shifted by each row's maximum
        let mut relative_lik = DMatrix::zeros(j, k);
        let mut row_max = vec![f64::NEG_INFINITY; j];
        for row in 0..j {
            for (c, comp) in components.iter().enumerate() {
                let total = match &comp.covariance {
                    Some(u) => u + &sampling_cov[row],
                    None => sampling_cov[row].clone(),
                };
                let ll = mvn_log_density(&observations[row], total).with_context(|| {
                    format!(
                        "covariance of component {}[{}] for experiment {} is not positive definite",
                        comp.hypothesis,
                        comp.scale,
                        data.experiments()[row]
                    )
                })?;
                relative_lik[(row, c)] = ll;
                row_max[row] = row_max[row].max(ll);
            }
            for c in 0..k {
                relative_lik[(row, c)] = (relative_lik[(row, c)] - row_max[row]).exp();
            }
        }

        let pi = self.fit_weights(&relative_lik);
        let log_likelihood: f64 = (0..j)
            .map(|row| {
                let mix: f64 = (0..k).map(|c| pi[c] * relative_lik[(row, c)]).sum();
                row_max[row] + mix.ln()
            })
            .sum();

        let normal = Normal::new(0.0, 1.0)?;
        let mut posterior_mean = DMatrix::zeros(j, r);
        let mut posterior_sd = DMatrix::zeros(j, r);
        let mut lfsr = DMatrix::zeros(j, r);
        let mut negative_prob = DMatrix::zeros(j, r);

        for row in 0..j {
            let weights: Vec<f64> = (0..k).map(|c| pi[c] * relative_lik[(row, c)]).collect();
            let total: f64 = weights.iter().sum();
            ensure!(
                total > 0.0,
                "experiment {} has zero likelihood under every component",
                data.experiments()[row]
            );

            let mut mean = vec![0.0; r];
            let mut second = vec![0.0; r];
            let mut negative = vec![0.0; r];
            let mut zero = vec![0.0; r];

            for (comp, w) in components.iter().zip(&weights) {
                let w = w / total;
                if w == 0.0 {
                    continue;
                }
                let Some(u) = &comp.covariance else {
                    zero.iter_mut().for_each(|z| *z += w);
                    continue;
                };
                let (mu, var) =
                    component_posterior(u, &sampling_cov[row], &observations[row])
                        .context("posterior covariance is singular")?;
                for m in 0..r {
                    mean[m] += w * mu[m];
                    second[m] += w * mu[m].mul_add(mu[m], var[m]);
                    if var[m] > 0.0 {
                        negative[m] += w * normal.cdf(-mu[m] / var[m].sqrt());
                    } else if mu[m] == 0.0 {
                        zero[m] += w;
                    } else if mu[m] < 0.0 {
                        negative[m] += w;
                    }
                }
            }

            for m in 0..r {
                posterior_mean[(row, m)] = mean[m];
                posterior_sd[(row, m)] = mean[m].mul_add(-mean[m], second[m]).max(0.0).sqrt();
                negative_prob[(row, m)] = negative[m];
                lfsr[(row, m)] = local_false_sign_rate(negative[m], zero[m]);
            }
        }

        let mixture = components
            .into_iter()
            .zip(pi)
            .map(|(c, weight)| MixtureComponent {
                hypothesis: c.hypothesis,
                scale: c.scale,
                weight,
            })
            .collect();

        FittedModel::from_parts(FittedModelParts {
            experiments: data.experiments().to_vec(),
            metrics: data.metrics().to_vec(),
            posterior_mean,
            posterior_sd,
            lfsr,
            negative_prob,
            components: mixture,
            log_likelihood,
            null_correlation: null_correlation.clone(),
        })
    }
}

fn check_finite(data: &ShrinkageInput) -> anyhow::Result<()> {
    if let Some(s) = data
        .standard_errors()
        .iter()
        .find(|s| !(s.is_finite() && **s > 0.0))
    {
        bail!("standard errors must be positive and finite, found {s}");
    }
    if data.estimates().iter().any(|b| !b.is_finite()) {
        bail!("estimates must be finite");
    }
    Ok(())
}

/// log N(x; 0, cov)
fn mvn_log_density(x: &DVector<f64>, cov: DMatrix<f64>) -> Option<f64> {
    let chol: Cholesky<f64, Dyn> = Cholesky::new(cov)?;
    let log_det = 2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let quad = x.dot(&chol.solve(x));
    #[allow(clippy::cast_precision_loss)]
    let dim = x.len() as f64;
    Some(-0.5 * (dim * (2.0 * std::f64::consts::PI).ln() + log_det + quad))
}

/// Posterior mean and marginal variances of `β | b` for prior N(0, U), noise N(0, V)
///
/// ```text
/// μ = U (U + V)⁻¹ b
/// Σ = U − U (U + V)⁻¹ U
/// ```
fn component_posterior(
    u: &DMatrix<f64>,
    v: &DMatrix<f64>,
    b: &DVector<f64>,
) -> Option<(DVector<f64>, Vec<f64>)> {
    let chol = Cholesky::new(u + v)?;
    let mu = u * chol.solve(b);
    let sigma = u - u * chol.solve(u);
    let var = sigma.diagonal().iter().map(|d| d.max(0.0)).collect();
    Some((mu, var))
}

/// Probability of calling the wrong sign, counting a zero effect as wrong either way
fn local_false_sign_rate(negative: f64, zero: f64) -> f64 {
    let rate = if negative > 0.5 * (1.0 - zero) {
        1.0 - negative
    } else {
        negative + zero
    };
    rate.clamp(0.0, 1.0)
}
