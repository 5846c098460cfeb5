//! Darcy friction factor for laminar, transitional and turbulent pipe flow.
//!
//! The transitional band has no single accepted correlation. Its factor is
//! drawn from a normal distribution centred on a linear blend of the laminar
//! and Colebrook values, so results in that band depend on the sampler seed.

use log::trace;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{NetworkError, Result};
use crate::solver::find_positive_root;

/// Upper Reynolds number of the laminar regime (inclusive)
pub const LAMINAR_LIMIT: f64 = 2000.0;
/// Lower Reynolds number of the turbulent regime (inclusive)
pub const TURBULENT_LIMIT: f64 = 4000.0;
/// Starting point for the Colebrook root search
pub const COLEBROOK_GUESS: f64 = 0.01;
/// Relative standard deviation of the transitional friction factor
pub const TRANSITION_SPREAD: f64 = 0.2;

const COLEBROOK_TOLERANCE: f64 = 1e-12;
const COLEBROOK_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRegime {
    Laminar,
    Transitional,
    Turbulent,
}

impl FlowRegime {
    pub fn classify(reynolds: f64) -> Self {
        if reynolds >= TURBULENT_LIMIT {
            FlowRegime::Turbulent
        } else if reynolds <= LAMINAR_LIMIT {
            FlowRegime::Laminar
        } else {
            FlowRegime::Transitional
        }
    }
}

/// Hagen-Poiseuille friction factor, `64 / Re`
pub fn laminar(reynolds: f64) -> f64 {
    64.0 / reynolds
}

/// Left-hand side of the Colebrook equation; zero at the turbulent friction factor.
pub fn colebrook_residual(f: f64, reynolds: f64, relative_roughness: f64) -> f64 {
    let root_f = f.sqrt();
    1.0 / root_f + 2.0 * (relative_roughness / 3.7 + 2.51 / (reynolds * root_f)).log10()
}

/// Solve the implicit Colebrook equation for the turbulent friction factor.
pub fn colebrook(reynolds: f64, relative_roughness: f64) -> Result<f64> {
    if reynolds <= 0.0 || !reynolds.is_finite() {
        return Err(NetworkError::invalid_parameter(
            "colebrook",
            "reynolds",
            format!("must be positive, got {}", reynolds),
        ));
    }
    find_positive_root(
        |f| colebrook_residual(f, reynolds, relative_roughness),
        COLEBROOK_GUESS,
        COLEBROOK_TOLERANCE,
        COLEBROOK_MAX_ITERATIONS,
    )
}

/// Centre of the transitional distribution: laminar at `Re = 2000`, Colebrook at `Re = 4000`.
pub fn transitional_mean(reynolds: f64, relative_roughness: f64) -> Result<f64> {
    let lam = laminar(reynolds);
    let turb = colebrook(reynolds, relative_roughness)?;
    let weight = (reynolds - LAMINAR_LIMIT) / (TURBULENT_LIMIT - LAMINAR_LIMIT);
    Ok(lam + weight * (turb - lam))
}

/// Random source for transitional friction factors.
#[derive(Debug, Clone)]
pub struct FrictionSampler {
    rng: StdRng,
}

impl FrictionSampler {
    /// Reproducible sampler; equal seeds give identical factor sequences.
    pub fn seeded(seed: u64) -> Self {
        FrictionSampler {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        FrictionSampler {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn from_seed_option(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    /// Draw from `Normal(mean, 0.2 * mean)`
    pub fn sample(&mut self, mean: f64) -> Result<f64> {
        let normal = Normal::new(mean, TRANSITION_SPREAD * mean.abs()).map_err(|e| {
            NetworkError::invalid_parameter("friction sampler", "mean", format!("{} ({})", mean, e))
        })?;
        Ok(normal.sample(&mut self.rng))
    }
}

/// Darcy friction factor for a pipe at the given Reynolds number.
pub fn friction_factor(
    reynolds: f64,
    relative_roughness: f64,
    sampler: &mut FrictionSampler,
) -> Result<f64> {
    match FlowRegime::classify(reynolds) {
        FlowRegime::Turbulent => colebrook(reynolds, relative_roughness),
        FlowRegime::Laminar => Ok(laminar(reynolds)),
        FlowRegime::Transitional => {
            let mean = transitional_mean(reynolds, relative_roughness)?;
            let f = sampler.sample(mean)?;
            trace!("transitional Re = {:.0}: mean f = {:.5}, sampled f = {:.5}", reynolds, mean, f);
            Ok(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_regime_boundaries() {
        assert_eq!(FlowRegime::classify(1500.0), FlowRegime::Laminar);
        assert_eq!(FlowRegime::classify(2000.0), FlowRegime::Laminar);
        assert_eq!(FlowRegime::classify(2000.1), FlowRegime::Transitional);
        assert_eq!(FlowRegime::classify(3999.9), FlowRegime::Transitional);
        assert_eq!(FlowRegime::classify(4000.0), FlowRegime::Turbulent);
    }

    #[test]
    fn test_laminar_at_boundary() {
        let mut sampler = FrictionSampler::seeded(1);
        let f = friction_factor(2000.0, 0.001, &mut sampler).unwrap();
        assert_relative_eq!(f, 0.032, epsilon = 1e-15);
    }

    #[test]
    fn test_colebrook_smooth_pipe() {
        let f = colebrook(1e5, 0.0).unwrap();
        assert_relative_eq!(f, 0.01799, epsilon = 1e-4);
        assert!(colebrook_residual(f, 1e5, 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_colebrook_rough_pipe() {
        let rr = 0.00025 / 0.2;
        let f = colebrook(2.0e5, rr).unwrap();
        assert!(colebrook_residual(f, 2.0e5, rr).abs() < 1e-9);
        // rougher pipes lose more head
        assert!(f > colebrook(2.0e5, 0.0).unwrap());
    }

    #[test]
    fn test_transitional_mean_approaches_neighbouring_regimes() {
        let rr = 0.00125;
        let low = transitional_mean(2000.0 + 1e-6, rr).unwrap();
        assert_relative_eq!(low, laminar(2000.0), epsilon = 1e-6);

        let high = transitional_mean(4000.0 - 1e-6, rr).unwrap();
        assert_relative_eq!(high, colebrook(4000.0, rr).unwrap(), epsilon = 1e-6);
    }

    #[test]
    fn test_transitional_sampling_is_reproducible_with_seed() {
        let mut a = FrictionSampler::seeded(42);
        let mut b = FrictionSampler::seeded(42);
        for re in [2500.0, 3000.0, 3500.0] {
            let fa = friction_factor(re, 0.001, &mut a).unwrap();
            let fb = friction_factor(re, 0.001, &mut b).unwrap();
            assert_eq!(fa, fb);
        }
    }

    #[test]
    fn test_transitional_samples_scatter_around_mean() {
        let mut sampler = FrictionSampler::seeded(7);
        let mean = transitional_mean(3000.0, 0.001).unwrap();
        let n = 4000;
        let total: f64 = (0..n)
            .map(|_| friction_factor(3000.0, 0.001, &mut sampler).unwrap())
            .sum();
        let sample_mean = total / n as f64;
        // standard error is 0.2 * mean / sqrt(n), about 0.3% of the mean
        assert_relative_eq!(sample_mean, mean, max_relative = 0.02);
    }
}
