//! # aa-shrinkage: correlated A/A simulation with adaptive shrinkage
//!
//! Simulates a population with two correlated outcome metrics, splits it into
//! many independent A/A experiments, estimates per-experiment treatment effects
//! and feeds them to a multivariate adaptive-shrinkage procedure. Since every
//! true effect is zero, the raw intervals show the nominal false-positive rate
//! and the shrunk posteriors show how much of it the prior absorbs.
//!
//! ## Stages
//!
//! - [`simulate`]: correlated unit-level metrics (exact or random moments)
//! - [`assign`]: `id mod K` bucketing plus a fair coin per unit
//! - [`estimate`]: difference in means with normal-approximation intervals
//! - [`shrinkage`]: matrix shaping around a [`ShrinkageProcedure`]
//! - [`report`]: posterior accessors, sharing and mixture proportions
//!
//! ## Example
//!
//! ```rust
//! use aa_shrinkage::{Pipeline, PipelineConfig};
//!
//! let mut config = PipelineConfig::default();
//! config.simulation.population_size = 20_000;
//! config.simulation.experiment_count = 20;
//!
//! let output = Pipeline::new(config)?.run()?;
//! println!(
//!     "raw significant: {}, after shrinkage: {}",
//!     output.report.raw_significant_count(),
//!     output.report.posterior_significant_count()
//! );
//! # Ok::<(), aa_shrinkage::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod assign;
pub mod config;
pub mod error;
pub mod estimate;
pub mod ledger;
pub mod pipeline;
pub mod report;
pub mod shrinkage;
pub mod simulate;
pub mod stats;
pub mod storage;

pub use assign::{AssignedPopulation, Assignment, Condition, ExperimentAssigner};
pub use config::{PipelineConfig, SamplingMode, ShrinkageConfig, SimulationConfig};
pub use error::{Error, Result};
pub use estimate::{EffectEstimate, EffectEstimator, EffectTable};
pub use ledger::{RunLedger, RunRecord, RunStatus};
pub use pipeline::{Pipeline, PipelineOutput};
pub use report::{ResultReporter, ShrinkageReport};
pub use shrinkage::{
    CovarianceHypothesis, FittedModel, MashProcedure, ShrinkageAdapter, ShrinkageInput,
    ShrinkageProcedure,
};
pub use simulate::{CorrelatedSimulator, Metric, Population, Unit};
pub use storage::TableStore;
