//! Property-based tests for the simulation and estimation stages
//!
//! - Exact sampling hits the target moments for any valid correlation
//! - Assignment partitions the population
//! - Interval arithmetic is consistent for every estimate

use aa_shrinkage::{
    CorrelatedSimulator, EffectEstimator, ExperimentAssigner, Metric, SamplingMode,
};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn population_sd(xs: &[f64]) -> f64 {
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: exact sampling reproduces ρ, zero means and unit spread
    #[test]
    fn prop_exact_sampling_matches_moments(
        rho in -0.99f64..0.99,
        n in 1_000usize..5_000,
        seed in any::<u64>(),
    ) {
        let simulator = CorrelatedSimulator::new(n, rho, SamplingMode::Exact).unwrap();
        let population = simulator
            .simulate(&mut Xoshiro256PlusPlus::seed_from_u64(seed))
            .unwrap();

        prop_assert_eq!(population.len(), n);
        let observed = population.correlation().unwrap();
        prop_assert!((observed - rho).abs() < 1e-9, "observed {} target {}", observed, rho);

        for metric in Metric::ALL {
            let values = population.values(metric);
            prop_assert!(mean(&values).abs() < 1e-9);
            // Standardization is to the sample SD, so population SD is sqrt((n-1)/n)
            let expected = ((n as f64 - 1.0) / n as f64).sqrt();
            prop_assert!((population_sd(&values) - expected).abs() < 1e-9);
        }
    }

    /// Property: every unit lands in exactly one bucket, `id mod K`
    #[test]
    fn prop_assignment_partitions_population(
        n in 100usize..3_000,
        k in 1usize..50,
        seed in any::<u64>(),
    ) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let population = CorrelatedSimulator::new(n, 0.2, SamplingMode::Random)
            .unwrap()
            .simulate(&mut rng)
            .unwrap();
        let assigned = ExperimentAssigner::new(k).unwrap().assign(population, &mut rng);

        prop_assert_eq!(assigned.assignments().len(), n);
        prop_assert_eq!(assigned.bucket_sizes().iter().sum::<usize>(), n);
        for (unit, assignment) in assigned.rows() {
            prop_assert_eq!(u64::from(assignment.experiment), unit.id % k as u64);
        }
        let (control, treatment) = assigned.arm_counts();
        prop_assert_eq!(control + treatment, n);
    }

    /// Property: intervals are centred on the estimate and flags match them
    #[test]
    fn prop_estimates_are_consistent(
        rho in -0.9f64..0.9,
        k in 1usize..8,
        seed in any::<u64>(),
    ) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let population = CorrelatedSimulator::new(4_000, rho, SamplingMode::Exact)
            .unwrap()
            .simulate(&mut rng)
            .unwrap();
        let assigned = ExperimentAssigner::new(k).unwrap().assign(population, &mut rng);
        let table = EffectEstimator::new(0.95).unwrap().estimate(&assigned).unwrap();

        prop_assert_eq!(table.estimates().len(), 2 * k);
        for e in table.estimates() {
            prop_assert!(e.std_error > 0.0);
            prop_assert!(e.ci_lower < e.estimate && e.estimate < e.ci_upper);
            let centre = (e.ci_lower + e.ci_upper) / 2.0;
            prop_assert!((centre - e.estimate).abs() < 1e-12);
            prop_assert_eq!(e.significant, e.ci_lower > 0.0 || e.ci_upper < 0.0);
            prop_assert!(e.control_n + e.treatment_n >= 4_000 / k);
        }
    }
}
