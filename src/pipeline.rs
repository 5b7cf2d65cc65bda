//! End-to-end A/A pipeline
//!
//! Simulate → assign → estimate → shrink → report. One generator is seeded
//! from the configuration and threaded through the simulator and the assigner;
//! the first failing stage aborts the run.

use chrono::Utc;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::assign::{AssignedPopulation, ExperimentAssigner};
use crate::config::PipelineConfig;
use crate::estimate::{EffectEstimator, EffectTable};
use crate::ledger::{RunLedger, RunRecord, RunStatus};
use crate::report::{ResultReporter, ShrinkageReport};
use crate::shrinkage::{FittedModel, MashProcedure, ShrinkageAdapter, ShrinkageProcedure};
use crate::simulate::{CorrelatedSimulator, Metric};
use crate::Result;

/// Everything a successful run produces
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Population with assignments
    pub assigned: AssignedPopulation,
    /// Raw per-experiment estimates
    pub effects: EffectTable,
    /// Fitted shrinkage model
    pub model: FittedModel,
    /// Joined raw and posterior report
    pub report: ShrinkageReport,
    /// Ledger entry of this run
    pub run: RunRecord,
}

impl PipelineOutput {
    /// Accessors over the fitted model
    #[must_use]
    pub const fn reporter(&self) -> ResultReporter<'_> {
        ResultReporter::new(&self.model)
    }
}

/// Configured pipeline over a shrinkage procedure
#[derive(Debug, Clone)]
pub struct Pipeline<P = MashProcedure> {
    config: PipelineConfig,
    adapter: ShrinkageAdapter<P>,
}

impl Pipeline<MashProcedure> {
    /// Pipeline with the built-in procedure
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidParameter`] if the configuration is out of range
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let procedure = MashProcedure::new(config.shrinkage.clone());
        Self::with_procedure(config, procedure)
    }
}

impl<P: ShrinkageProcedure> Pipeline<P> {
    /// Pipeline with a caller-supplied procedure
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidParameter`] if the configuration is out of range
    pub fn with_procedure(config: PipelineConfig, procedure: P) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            adapter: ShrinkageAdapter::new(procedure),
        })
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Simulate, assign and estimate, stopping before shrinkage
    ///
    /// # Errors
    ///
    /// Returns the first stage error, e.g. [`crate::Error::InsufficientData`]
    /// when a bucket arm has fewer than two units
    pub fn run_estimation(&self) -> Result<(AssignedPopulation, EffectTable)> {
        let sim = &self.config.simulation;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(sim.seed);

        let population = CorrelatedSimulator::new(sim.population_size, sim.correlation, sim.sampling)?
            .simulate(&mut rng)?;
        tracing::info!(
            population_size = population.len(),
            target_correlation = sim.correlation,
            observed_correlation = population.correlation(),
            "population simulated"
        );

        let assigned = ExperimentAssigner::new(sim.experiment_count)?.assign(population, &mut rng);
        let (control, treatment) = assigned.arm_counts();
        tracing::info!(
            experiments = assigned.experiment_count(),
            control,
            treatment,
            "units assigned"
        );

        let effects = EffectEstimator::new(sim.confidence_level)?.estimate(&assigned)?;
        tracing::info!(
            metric_a_rate = effects.significance_rate(Some(Metric::MetricA)),
            metric_b_rate = effects.significance_rate(Some(Metric::MetricB)),
            pooled_rate = effects.significance_rate(None),
            estimate_correlation = effects.estimate_correlation(),
            "effects estimated"
        );

        Ok((assigned, effects))
    }

    /// Run every stage
    ///
    /// # Errors
    ///
    /// Returns the first stage error; nothing partial is returned
    pub fn run(&self) -> Result<PipelineOutput> {
        self.run_recorded(&mut RunLedger::new())
    }

    /// Run every stage and record the outcome in `ledger`
    ///
    /// Failed runs are recorded too, with their error and no metrics.
    ///
    /// # Errors
    ///
    /// Returns the first stage error
    pub fn run_recorded(&self, ledger: &mut RunLedger) -> Result<PipelineOutput> {
        let run_id = format!(
            "run-{}-{}",
            self.config.simulation.seed,
            Utc::now().format("%Y%m%dT%H%M%S%.6f")
        );
        let mut run = RunRecord::new(run_id, serde_json::to_value(&self.config)?);
        run.start();

        match self.stages(&mut run) {
            Ok((assigned, effects, model, report)) => {
                run.complete(RunStatus::Success);
                tracing::info!(run_id = run.run_id(), "run succeeded");
                ledger.add_run(run.clone());
                Ok(PipelineOutput {
                    assigned,
                    effects,
                    model,
                    report,
                    run,
                })
            }
            Err(err) => {
                run.fail(&err);
                tracing::error!(run_id = run.run_id(), error = %err, "run failed");
                ledger.add_run(run);
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity, clippy::cast_precision_loss)]
    fn stages(
        &self,
        run: &mut RunRecord,
    ) -> Result<(AssignedPopulation, EffectTable, FittedModel, ShrinkageReport)> {
        let (assigned, effects) = self.run_estimation()?;
        if let Some(rho) = assigned.population().correlation() {
            run.log_metric("population_correlation", rho);
        }
        if let Some(rho) = effects.estimate_correlation() {
            run.log_metric("estimate_correlation", rho);
        }
        run.log_metric("raw_significance_rate", effects.significance_rate(None));

        let model = self.adapter.fit_effects(&effects)?;
        let reporter = ResultReporter::new(&model);
        let shrinkage = &self.config.shrinkage;
        let report = reporter.report(&effects, shrinkage.lfsr_threshold)?;

        let sharing = reporter.pairwise_sharing(shrinkage.sharing_factor, shrinkage.lfsr_threshold);
        run.log_metric(
            "raw_significant_experiments",
            report.raw_significant_count() as f64,
        );
        run.log_metric(
            "posterior_significant_experiments",
            report.posterior_significant_count() as f64,
        );
        run.log_metric("log_likelihood", model.log_likelihood());
        tracing::info!(
            raw_significant = report.raw_significant_count(),
            posterior_significant = report.posterior_significant_count(),
            sharing = sharing[(0, 1)],
            mixture = ?report.mixture,
            "shrinkage report built"
        );

        Ok((assigned, effects, model, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::shrinkage::{CovarianceHypothesis, ShrinkageInput};
    use crate::Error;
    use nalgebra::DMatrix;

    fn small_config(population_size: usize, experiment_count: usize) -> PipelineConfig {
        PipelineConfig {
            simulation: SimulationConfig {
                population_size,
                experiment_count,
                ..SimulationConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    struct Unreachable;

    impl ShrinkageProcedure for Unreachable {
        fn estimate_null_correlation(&self, _: &ShrinkageInput) -> anyhow::Result<DMatrix<f64>> {
            anyhow::bail!("backend unavailable")
        }

        fn build_candidate_covariances(
            &self,
            _: &ShrinkageInput,
        ) -> anyhow::Result<Vec<CovarianceHypothesis>> {
            unreachable!()
        }

        fn fit(
            &self,
            _: &ShrinkageInput,
            _: &DMatrix<f64>,
            _: &[CovarianceHypothesis],
        ) -> anyhow::Result<FittedModel> {
            unreachable!()
        }
    }

    #[test]
    fn test_small_run_succeeds_and_is_recorded() {
        let pipeline = Pipeline::new(small_config(20_000, 20)).unwrap();
        let mut ledger = RunLedger::new();
        let output = pipeline.run_recorded(&mut ledger).unwrap();

        assert_eq!(output.effects.experiment_count(), 20);
        assert_eq!(output.report.experiments.len(), 20);
        assert_eq!(output.run.status(), RunStatus::Success);
        assert!(output.run.metric("log_likelihood").is_some());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.runs()[0], output.run);
        let rho = output.run.metric("population_correlation").unwrap();
        assert!((rho - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_estimation_is_deterministic_under_seed() {
        let pipeline = Pipeline::new(small_config(5_000, 10)).unwrap();
        let (a1, e1) = pipeline.run_estimation().unwrap();
        let (a2, e2) = pipeline.run_estimation().unwrap();
        assert_eq!(a1, a2);
        assert_eq!(e1.estimates(), e2.estimates());
    }

    #[test]
    fn test_tiny_buckets_fail_atomically() {
        let pipeline = Pipeline::new(small_config(30, 20)).unwrap();
        let mut ledger = RunLedger::new();
        let err = pipeline.run_recorded(&mut ledger).unwrap_err();

        assert!(matches!(err, Error::InsufficientData { .. }));
        let run = &ledger.runs()[0];
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.metrics().is_empty());
        assert!(run.error().unwrap().contains("Insufficient data"));
    }

    #[test]
    fn test_procedure_failure_names_stage() {
        let pipeline = Pipeline::with_procedure(small_config(2_000, 4), Unreachable).unwrap();
        let err = pipeline.run().unwrap_err();
        match err {
            Error::ExternalProcedureFailure { stage, message } => {
                assert_eq!(stage, "estimate_null_correlation");
                assert!(message.contains("backend unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let mut config = small_config(1_000, 10);
        config.simulation.correlation = 1.0;
        assert!(matches!(
            Pipeline::new(config),
            Err(Error::InvalidParameter(_))
        ));

        // Exact sampling cannot place two units at an arbitrary correlation
        assert!(matches!(
            Pipeline::new(small_config(2, 1)),
            Err(Error::InvalidParameter(_))
        ));
    }
}
