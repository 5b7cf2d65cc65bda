//! Experiment assigner
//!
//! Buckets are a pure function of the unit id (`id mod K`), so reruns over the
//! same population reproduce the same experiments. The arm of each unit is an
//! independent fair coin drawn from the shared generator; arms are balanced
//! only in expectation.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StringArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::simulate::{Metric, Population, Unit};
use crate::{Error, Result};

/// Arm of a two-arm experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Control arm
    Control,
    /// Treatment arm
    Treatment,
}

impl Condition {
    /// Both arms, control first
    pub const ALL: [Self; 2] = [Self::Control, Self::Treatment];

    /// Lowercase label
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Treatment => "treatment",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Control => 0,
            Self::Treatment => 1,
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Experiment bucket and arm of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Experiment bucket, `0..experiment_count`
    pub experiment: u32,
    /// Arm within the experiment
    pub condition: Condition,
}

/// Population augmented with one assignment per unit
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedPopulation {
    population: Population,
    assignments: Vec<Assignment>,
    experiment_count: usize,
}

impl AssignedPopulation {
    /// Pair externally produced assignments with a population
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the lengths differ, the count is
    /// zero, or an assignment points outside `0..experiment_count`
    pub fn from_parts(
        population: Population,
        assignments: Vec<Assignment>,
        experiment_count: usize,
    ) -> Result<Self> {
        if experiment_count == 0 {
            return Err(Error::invalid("experiment_count must be greater than 0"));
        }
        if assignments.len() != population.len() {
            return Err(Error::invalid(format!(
                "{} assignments for {} units",
                assignments.len(),
                population.len()
            )));
        }
        if let Some(bad) = assignments
            .iter()
            .find(|a| a.experiment as usize >= experiment_count)
        {
            return Err(Error::invalid(format!(
                "experiment {} out of range 0..{experiment_count}",
                bad.experiment
            )));
        }
        Ok(Self {
            population,
            assignments,
            experiment_count,
        })
    }

    /// Underlying population
    #[must_use]
    pub const fn population(&self) -> &Population {
        &self.population
    }

    /// Assignments, aligned with [`Population::units`]
    #[must_use]
    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Number of experiment buckets
    #[must_use]
    pub const fn experiment_count(&self) -> usize {
        self.experiment_count
    }

    /// Iterate `(unit, assignment)` pairs
    pub fn rows(&self) -> impl Iterator<Item = (&Unit, &Assignment)> {
        self.population.units().iter().zip(&self.assignments)
    }

    /// Units per experiment bucket
    #[must_use]
    pub fn bucket_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.experiment_count];
        for a in &self.assignments {
            sizes[a.experiment as usize] += 1;
        }
        sizes
    }

    /// Units per arm across all experiments: `(control, treatment)`
    #[must_use]
    pub fn arm_counts(&self) -> (usize, usize) {
        let treatment = self
            .assignments
            .iter()
            .filter(|a| a.condition == Condition::Treatment)
            .count();
        (self.assignments.len() - treatment, treatment)
    }

    /// Export as an Arrow batch: `id`, metrics, `experiment`, `condition`
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the columns
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let units = self.population.units();
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new(Metric::MetricA.name(), DataType::Float64, false),
            Field::new(Metric::MetricB.name(), DataType::Float64, false),
            Field::new("experiment", DataType::UInt32, false),
            Field::new("condition", DataType::Utf8, false),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from_iter_values(units.iter().map(|u| u.id))),
            Arc::new(Float64Array::from_iter_values(
                units.iter().map(|u| u.metric_a),
            )),
            Arc::new(Float64Array::from_iter_values(
                units.iter().map(|u| u.metric_b),
            )),
            Arc::new(UInt32Array::from_iter_values(
                self.assignments.iter().map(|a| a.experiment),
            )),
            Arc::new(StringArray::from_iter_values(
                self.assignments.iter().map(|a| a.condition.name()),
            )),
        ];
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

/// Splits a population into `K` independent two-arm experiments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentAssigner {
    experiment_count: usize,
}

impl ExperimentAssigner {
    /// Create an assigner for `experiment_count` buckets
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the count is 0 or exceeds `u32::MAX`
    pub fn new(experiment_count: usize) -> Result<Self> {
        if experiment_count == 0 {
            return Err(Error::invalid("experiment_count must be greater than 0"));
        }
        if u32::try_from(experiment_count).is_err() {
            return Err(Error::invalid(format!(
                "experiment_count {experiment_count} exceeds {}",
                u32::MAX
            )));
        }
        Ok(Self { experiment_count })
    }

    /// Bucket of a unit id
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn bucket(&self, id: u64) -> u32 {
        // experiment_count fits in u32, so the remainder does too
        (id % self.experiment_count as u64) as u32
    }

    /// Assign every unit a bucket and an arm
    pub fn assign<R: Rng>(&self, population: Population, rng: &mut R) -> AssignedPopulation {
        let assignments = population
            .units()
            .iter()
            .map(|unit| Assignment {
                experiment: self.bucket(unit.id),
                condition: if rng.gen_bool(0.5) {
                    Condition::Treatment
                } else {
                    Condition::Control
                },
            })
            .collect();

        AssignedPopulation {
            population,
            assignments,
            experiment_count: self.experiment_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingMode;
    use crate::simulate::CorrelatedSimulator;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn population(n: usize, seed: u64) -> Population {
        CorrelatedSimulator::new(n, 0.3, SamplingMode::Random)
            .unwrap()
            .simulate(&mut Xoshiro256PlusPlus::seed_from_u64(seed))
            .unwrap()
    }

    #[test]
    fn test_bucket_is_id_mod_k() {
        let assigner = ExperimentAssigner::new(7).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let assigned = assigner.assign(population(100, 1), &mut rng);
        for (unit, a) in assigned.rows() {
            assert_eq!(u64::from(a.experiment), unit.id % 7);
        }
    }

    #[test]
    fn test_bucket_sizes_cover_population() {
        let assigner = ExperimentAssigner::new(10).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let assigned = assigner.assign(population(1_005, 2), &mut rng);
        let sizes = assigned.bucket_sizes();
        assert_eq!(sizes.iter().sum::<usize>(), 1_005);
        assert_eq!(sizes[0], 101);
        assert_eq!(sizes[9], 100);
    }

    #[test]
    fn test_coin_flip_roughly_balanced() {
        let assigner = ExperimentAssigner::new(3).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let assigned = assigner.assign(population(100_000, 3), &mut rng);
        let (control, treatment) = assigned.arm_counts();
        assert_eq!(control + treatment, 100_000);
        assert!((treatment as f64 / 100_000.0 - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_reproducible_under_seed() {
        let assigner = ExperimentAssigner::new(5).unwrap();
        let a1 = assigner.assign(population(500, 4), &mut Xoshiro256PlusPlus::seed_from_u64(9));
        let a2 = assigner.assign(population(500, 4), &mut Xoshiro256PlusPlus::seed_from_u64(9));
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_rejects_zero_experiments() {
        assert!(matches!(
            ExperimentAssigner::new(0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_record_batch_has_assignment_columns() {
        let assigner = ExperimentAssigner::new(4).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let batch = assigner
            .assign(population(40, 5), &mut rng)
            .to_record_batch()
            .unwrap();
        assert_eq!(batch.num_columns(), 5);
        assert_eq!(batch.schema().field(4).name(), "condition");
    }
}
