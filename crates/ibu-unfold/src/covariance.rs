//! Covariance propagation schemes for the Bayes update.
//!
//! Three independent sources enter every scheme: the observed counts, the
//! response matrix entries and the cause efficiencies. Both schemes return the
//! covariance of the efficiency-corrected cause counts.

use ibu_core::errors::UnfoldError;
use ibu_core::RngHandle;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::ErrorPropagation;
use crate::mixer::{bayes_step, safe_div, BayesStep, MixInputs};

/// Common contract of the ACM and DCM schemes.
pub trait CovariancePropagator: Send {
    /// Short scheme name used in logs.
    fn name(&self) -> &'static str;

    /// Covariance of `step.unfolded`. Called once per iteration, in order.
    fn propagate(
        &mut self,
        step: &BayesStep,
        inputs: &MixInputs<'_>,
    ) -> Result<DMatrix<f64>, UnfoldError>;
}

/// Instantiates the configured scheme for a new run.
pub fn build_propagator(config: &ErrorPropagation) -> Box<dyn CovariancePropagator> {
    match config {
        ErrorPropagation::Acm => Box::new(AnalyticPropagator::default()),
        ErrorPropagation::Dcm { samples, seed } => {
            Box::new(ResampledPropagator::new(*samples, *seed))
        }
    }
}

/// Derivatives of the unfolded counts with respect to every input.
#[derive(Debug, Clone)]
struct Jacobians {
    /// `d n_hat / d n`, causes x effects.
    counts: DMatrix<f64>,
    /// `d n_hat / d P`, causes x (causes * effects), column `k * effects + j` for `P_kj`.
    response: DMatrix<f64>,
    /// `d n_hat / d eps`, causes x causes.
    efficiency: DMatrix<f64>,
    /// Total of the unfolded counts the derivatives refer to.
    total: f64,
}

/// Analytic covariance matrix (ACM).
///
/// Carries the Jacobians of the previous iteration so that the dependence of
/// each prior on earlier updates is folded in: `J_t = D_t + G_t J_{t-1}`.
#[derive(Debug, Clone, Default)]
pub struct AnalyticPropagator {
    previous: Option<Jacobians>,
}

impl AnalyticPropagator {
    fn direct_terms(step: &BayesStep, inputs: &MixInputs<'_>) -> Jacobians {
        let (causes, effects) = step.unfolding.shape();
        let eps = inputs.efficiencies.values();
        let n = inputs.observed;
        let m = &step.unfolding;
        let n0 = &step.prior_counts;

        let efficiency = DMatrix::from_fn(causes, causes, |i, l| {
            if i == l {
                -safe_div(step.unfolded[i], eps[i])
            } else {
                0.0
            }
        });

        let mut response = DMatrix::zeros(causes, causes * effects);
        for k in 0..causes {
            for j in 0..effects {
                let f = step.folded[j];
                if f == 0.0 {
                    continue;
                }
                let col = k * effects + j;
                let shared = n[j] * n0[k] / f;
                for i in 0..causes {
                    response[(i, col)] = -m[(i, j)] * shared;
                }
                response[(k, col)] += safe_div(n0[k] * n[j], eps[k] * f);
            }
        }

        Jacobians {
            counts: m.clone(),
            response,
            efficiency,
            total: step.unfolded.sum(),
        }
    }

    /// `G_il = d n_hat_i / d n0_l` at fixed data.
    fn prior_feedback(step: &BayesStep, inputs: &MixInputs<'_>) -> DMatrix<f64> {
        let causes = step.prior_counts.len();
        let eps = inputs.efficiencies.values();
        let n = DVector::from_column_slice(inputs.observed);
        let m = &step.unfolding;
        let smeared = m * DMatrix::from_diagonal(&n) * m.transpose();
        DMatrix::from_fn(causes, causes, |i, l| {
            let diagonal = if i == l {
                safe_div(step.unfolded[i], step.prior_counts[i])
            } else {
                0.0
            };
            diagonal - safe_div(eps[l], step.prior_counts[l]) * smeared[(i, l)]
        })
    }
}

fn sandwich(jacobian: &DMatrix<f64>, sigmas: &[f64]) -> DMatrix<f64> {
    let mut scaled = jacobian.clone();
    for (col, sigma) in sigmas.iter().enumerate() {
        scaled.column_mut(col).scale_mut(*sigma);
    }
    &scaled * scaled.transpose()
}

impl CovariancePropagator for AnalyticPropagator {
    fn name(&self) -> &'static str {
        "acm"
    }

    fn propagate(
        &mut self,
        step: &BayesStep,
        inputs: &MixInputs<'_>,
    ) -> Result<DMatrix<f64>, UnfoldError> {
        let mut jac = Self::direct_terms(step, inputs);
        if let Some(previous) = &self.previous {
            let feedback = Self::prior_feedback(step, inputs);
            let scale = safe_div(step.prior_counts.sum(), previous.total);
            jac.counts += &feedback * &previous.counts * scale;
            jac.response += &feedback * &previous.response * scale;
            jac.efficiency += &feedback * &previous.efficiency * scale;
        }

        let response_sigmas: Vec<f64> = inputs
            .response
            .errors()
            .row_iter()
            .flat_map(|row| row.iter().copied().collect::<Vec<_>>())
            .collect();
        let covariance = sandwich(&jac.counts, inputs.observed_errors)
            + sandwich(&jac.response, &response_sigmas)
            + sandwich(&jac.efficiency, inputs.efficiencies.errors());
        self.previous = Some(jac);
        Ok(covariance)
    }
}

/// Data covariance matrix (DCM) estimated by resampling the inputs.
///
/// Each replica draws counts, response entries and efficiencies from
/// Gaussians around their nominal values and repeats the Bayes update with
/// the same prior. Iteration `t` uses substream `t` of the master seed.
#[derive(Debug, Clone)]
pub struct ResampledPropagator {
    samples: usize,
    seed: u64,
    iteration: u64,
}

impl ResampledPropagator {
    /// Scheme drawing `samples` replicas per iteration.
    pub fn new(samples: usize, seed: u64) -> Self {
        Self {
            samples: samples.max(2),
            seed,
            iteration: 0,
        }
    }
}

impl CovariancePropagator for ResampledPropagator {
    fn name(&self) -> &'static str {
        "dcm"
    }

    fn propagate(
        &mut self,
        step: &BayesStep,
        inputs: &MixInputs<'_>,
    ) -> Result<DMatrix<f64>, UnfoldError> {
        let mut rng = RngHandle::substream(self.seed, self.iteration);
        self.iteration += 1;

        let nominal = inputs.response.values();
        let response_errors = inputs.response.errors();
        let eps = inputs.efficiencies.values();
        let eps_errors = inputs.efficiencies.errors();
        let prior: Vec<f64> = step.prior_counts.iter().copied().collect();
        let causes = prior.len();

        let mut draws = Vec::with_capacity(self.samples);
        for _ in 0..self.samples {
            let observed: Vec<f64> = inputs
                .observed
                .iter()
                .zip(inputs.observed_errors.iter())
                .map(|(n, sigma)| (n + sigma * rng.sample::<f64, _>(StandardNormal)).max(0.0))
                .collect();
            let response = DMatrix::from_fn(nominal.nrows(), nominal.ncols(), |i, j| {
                let z: f64 = rng.sample(StandardNormal);
                (nominal[(i, j)] + response_errors[(i, j)] * z).max(0.0)
            });
            let efficiencies: Vec<f64> = eps
                .iter()
                .zip(eps_errors.iter())
                .map(|(e, sigma)| {
                    let z: f64 = rng.sample(StandardNormal);
                    (e + sigma * z).clamp(f64::MIN_POSITIVE, 1.0)
                })
                .collect();
            let replica = bayes_step(&prior, &observed, &response, &efficiencies)?;
            draws.push(replica.unfolded);
        }

        let count = draws.len() as f64;
        let mean = draws
            .iter()
            .fold(DVector::zeros(causes), |acc, draw| acc + draw)
            / count;
        let mut covariance = DMatrix::zeros(causes, causes);
        for draw in &draws {
            let delta = draw - &mean;
            covariance += &delta * delta.transpose();
        }
        Ok(covariance / (count - 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Efficiencies, ResponseMatrix};

    fn inputs_for<'a>(
        observed: &'a [f64],
        errors: &'a [f64],
        response: &'a ResponseMatrix,
        efficiencies: &'a Efficiencies,
    ) -> MixInputs<'a> {
        MixInputs {
            observed,
            observed_errors: errors,
            response,
            efficiencies,
        }
    }

    #[test]
    fn identity_response_gives_poisson_diagonal() {
        let response = ResponseMatrix::exact(DMatrix::identity(3, 3)).unwrap();
        let efficiencies = Efficiencies::perfect(3);
        let observed = [100.0, 50.0, 25.0];
        let errors = [10.0, 50f64.sqrt(), 5.0];
        let step = bayes_step(&[1.0, 1.0, 1.0], &observed, response.values(), efficiencies.values())
            .unwrap();
        let inputs = inputs_for(&observed, &errors, &response, &efficiencies);
        let cov = AnalyticPropagator::default().propagate(&step, &inputs).unwrap();
        for i in 0..3 {
            assert!((cov[(i, i)] - observed[i]).abs() < 1e-9);
        }
        assert!(cov[(0, 1)].abs() < 1e-12);
    }

    /// Cause counts after `iterations` plain updates from a uniform prior.
    fn unfold_counts(
        observed: &[f64],
        response: &DMatrix<f64>,
        efficiencies: &[f64],
        iterations: usize,
    ) -> DVector<f64> {
        let total: f64 = observed.iter().sum();
        let mut prior = vec![1.0; response.nrows()];
        let mut unfolded = DVector::zeros(response.nrows());
        for _ in 0..iterations {
            let sum: f64 = prior.iter().sum();
            let counts: Vec<f64> = prior.iter().map(|p| p / sum * total).collect();
            unfolded = bayes_step(&counts, observed, response, efficiencies)
                .unwrap()
                .unfolded;
            prior = unfolded.iter().copied().collect();
        }
        unfolded
    }

    fn central_difference(value: f64, eval: impl Fn(f64) -> DVector<f64>) -> DVector<f64> {
        let h = 1e-6 * (1.0 + value.abs());
        (eval(value + h) - eval(value - h)) / (2.0 * h)
    }

    #[test]
    fn analytic_covariance_matches_numeric_jacobians_across_iterations() {
        let response = ResponseMatrix::from_rows(
            &[
                vec![0.6, 0.3, 0.05],
                vec![0.2, 0.5, 0.2],
                vec![0.05, 0.25, 0.6],
            ],
            &[vec![0.01; 3], vec![0.01; 3], vec![0.01; 3]],
        )
        .unwrap();
        let efficiencies = Efficiencies::new(vec![0.95, 0.9, 0.9], vec![0.02; 3]).unwrap();
        let observed = [500.0, 300.0, 200.0];
        let errors: Vec<f64> = observed.iter().map(|n: &f64| n.sqrt()).collect();
        let p = response.values().clone();
        let eps = efficiencies.values().to_vec();
        let total: f64 = observed.iter().sum();

        let mut propagator = AnalyticPropagator::default();
        let mut prior = vec![1.0; 3];
        for iterations in 1..=3 {
            let sum: f64 = prior.iter().sum();
            let counts: Vec<f64> = prior.iter().map(|v| v / sum * total).collect();
            let step = bayes_step(&counts, &observed, &p, &eps).unwrap();
            let inputs = inputs_for(&observed, &errors, &response, &efficiencies);
            let analytic = propagator.propagate(&step, &inputs).unwrap();
            prior = step.unfolded.iter().copied().collect();

            let mut numeric: DMatrix<f64> = DMatrix::zeros(3, 3);
            let mut add = |column: DVector<f64>, sigma: f64| {
                numeric += &column * column.transpose() * (sigma * sigma);
            };
            for j in 0..3 {
                let column = central_difference(observed[j], |v| {
                    let mut shifted = observed;
                    shifted[j] = v;
                    unfold_counts(&shifted, &p, &eps, iterations)
                });
                add(column, errors[j]);
            }
            for k in 0..3 {
                for j in 0..3 {
                    let column = central_difference(p[(k, j)], |v| {
                        let mut shifted = p.clone();
                        shifted[(k, j)] = v;
                        unfold_counts(&observed, &shifted, &eps, iterations)
                    });
                    add(column, response.errors()[(k, j)]);
                }
            }
            for k in 0..3 {
                let column = central_difference(eps[k], |v| {
                    let mut shifted = eps.clone();
                    shifted[k] = v;
                    unfold_counts(&observed, &p, &shifted, iterations)
                });
                add(column, efficiencies.errors()[k]);
            }

            let scale = numeric.amax();
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                assert!(
                    (a - n).abs() <= 1e-6 * scale,
                    "iteration {iterations}: {a} vs {n}"
                );
            }
        }
    }

    #[test]
    fn resampling_is_reproducible_for_a_seed() {
        let response = ResponseMatrix::from_rows(
            &[vec![0.8, 0.2], vec![0.3, 0.7]],
            &[vec![0.01, 0.01], vec![0.01, 0.01]],
        )
        .unwrap();
        let efficiencies = Efficiencies::new(vec![1.0, 1.0], vec![0.0, 0.0]).unwrap();
        let observed = [60.0, 40.0];
        let errors = [60f64.sqrt(), 40f64.sqrt()];
        let step =
            bayes_step(&[50.0, 50.0], &observed, response.values(), efficiencies.values()).unwrap();
        let inputs = inputs_for(&observed, &errors, &response, &efficiencies);
        let a = ResampledPropagator::new(200, 7).propagate(&step, &inputs).unwrap();
        let b = ResampledPropagator::new(200, 7).propagate(&step, &inputs).unwrap();
        assert_eq!(a, b);
        assert!(a[(0, 0)] > 0.0 && a[(1, 1)] > 0.0);
    }
}
