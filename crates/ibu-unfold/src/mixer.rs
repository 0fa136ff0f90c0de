use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::Distribution;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::MixerConfig;
use crate::covariance::{build_propagator, CovariancePropagator};
use crate::model::{CauseEffectModel, Efficiencies, ResponseMatrix};

fn mixing_error(code: &str, message: impl Into<String>) -> UnfoldError {
    UnfoldError::Mixing(ErrorInfo::new(code, message.into()))
}

/// Divides, mapping a zero denominator to zero.
pub(crate) fn safe_div(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Intermediate quantities of one discretized Bayes update.
#[derive(Debug, Clone, PartialEq)]
pub struct BayesStep {
    /// Prior expressed as counts, `n0 = n_obs * p0`.
    pub prior_counts: DVector<f64>,
    /// Expected effect counts under the prior, `f_j = sum_l P_lj n0_l`.
    pub folded: DVector<f64>,
    /// Unfolding matrix `M_ij = P_ij n0_i / (eps_i f_j)`.
    pub unfolding: DMatrix<f64>,
    /// Efficiency-corrected cause counts `M n`.
    pub unfolded: DVector<f64>,
}

/// Inputs shared by every covariance scheme.
#[derive(Debug, Clone, Copy)]
pub struct MixInputs<'a> {
    /// Observed effect counts.
    pub observed: &'a [f64],
    /// Uncertainties of the observed counts.
    pub observed_errors: &'a [f64],
    /// Response matrix with uncertainties.
    pub response: &'a ResponseMatrix,
    /// Cause efficiencies with uncertainties.
    pub efficiencies: &'a Efficiencies,
}

/// Posterior of one Bayes update plus propagated covariance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixOutcome {
    /// Posterior probabilities with uncertainties from `probability_covariance`.
    pub posterior: Distribution,
    /// Efficiency-corrected cause counts with uncertainties from `count_covariance`.
    pub counts: Distribution,
    /// Covariance of the cause counts.
    pub count_covariance: DMatrix<f64>,
    /// Covariance of the normalized posterior.
    pub probability_covariance: DMatrix<f64>,
}

/// Applies `M_ij` to the observed counts using the given prior counts.
pub fn bayes_step(
    prior_counts: &[f64],
    observed: &[f64],
    response: &DMatrix<f64>,
    efficiencies: &[f64],
) -> Result<BayesStep, UnfoldError> {
    let (causes, effects) = response.shape();
    if prior_counts.len() != causes {
        return Err(mixing_shape("mix-prior", "prior", causes, prior_counts.len()));
    }
    if observed.len() != effects {
        return Err(mixing_shape("mix-observed", "observed counts", effects, observed.len()));
    }
    if efficiencies.len() != causes {
        return Err(mixing_shape(
            "mix-efficiencies",
            "efficiency vector",
            causes,
            efficiencies.len(),
        ));
    }
    if let Some(cause) = efficiencies.iter().position(|eff| *eff == 0.0) {
        return Err(UnfoldError::Mixing(
            ErrorInfo::new("mix-zero-efficiency", "cause bin has zero efficiency")
                .with_context("cause", cause)
                .with_hint("drop the bin from the cause axis or supply a non-zero efficiency"),
        ));
    }

    let prior = DVector::from_column_slice(prior_counts);
    let folded = response.transpose() * &prior;
    let unfolding = DMatrix::from_fn(causes, effects, |i, j| {
        safe_div(response[(i, j)] * prior[i], efficiencies[i] * folded[j])
    });
    let unfolded = &unfolding * DVector::from_column_slice(observed);
    Ok(BayesStep {
        prior_counts: prior,
        folded,
        unfolding,
        unfolded,
    })
}

fn mixing_shape(code: &str, what: &str, expected: usize, found: usize) -> UnfoldError {
    UnfoldError::Mixing(
        ErrorInfo::new(code, format!("{what} does not match the response matrix"))
            .with_context("expected", expected)
            .with_context("found", found),
    )
}

/// Covariance of `n / sum(n)` given the covariance of `n`.
pub fn normalization_covariance(counts: &DVector<f64>, covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let total = counts.sum();
    let n = counts.len();
    let jac = DMatrix::from_fn(n, n, |i, k| {
        let delta = if i == k { 1.0 } else { 0.0 };
        safe_div(delta - safe_div(counts[i], total), total)
    });
    &jac * covariance * jac.transpose()
}

fn diagonal_errors(covariance: &DMatrix<f64>) -> Vec<f64> {
    covariance.diagonal().iter().map(|v| v.max(0.0).sqrt()).collect()
}

/// Stateful Bayes updater owning the covariance scheme of one run.
pub struct Mixer {
    propagator: Box<dyn CovariancePropagator>,
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("propagator", &self.propagator.name())
            .finish()
    }
}

impl Mixer {
    /// Creates a mixer for a fresh run.
    pub fn new(config: &MixerConfig) -> Self {
        Self {
            propagator: build_propagator(&config.error_propagation),
        }
    }

    /// Name of the covariance scheme in use.
    pub fn scheme(&self) -> &'static str {
        self.propagator.name()
    }

    /// One Bayes update of `prior` against `observed` through `model`.
    pub fn mix(
        &mut self,
        prior: &Distribution,
        observed: &Distribution,
        model: &CauseEffectModel,
    ) -> Result<MixOutcome, UnfoldError> {
        self.mix_with(prior, observed, model.response(), model.efficiencies())
    }

    /// Same as [`Mixer::mix`] with the response and efficiencies passed directly.
    pub fn mix_with(
        &mut self,
        prior: &Distribution,
        observed: &Distribution,
        response: &ResponseMatrix,
        efficiencies: &Efficiencies,
    ) -> Result<MixOutcome, UnfoldError> {
        let n_observed = observed.total();
        let prior_total = prior.total();
        if !(prior_total > 0.0 && prior_total.is_finite()) {
            return Err(mixing_error("mix-prior-total", "prior must have a positive total"));
        }
        let prior_counts: Vec<f64> = prior
            .values()
            .iter()
            .map(|p| p / prior_total * n_observed)
            .collect();
        let step = bayes_step(
            &prior_counts,
            observed.values(),
            response.values(),
            efficiencies.values(),
        )?;
        let total = step.unfolded.sum();
        if !(total > 0.0) {
            return Err(UnfoldError::Mixing(
                ErrorInfo::new("mix-empty-posterior", "posterior has no weight in any cause bin")
                    .with_context("total", total),
            ));
        }
        let inputs = MixInputs {
            observed: observed.values(),
            observed_errors: observed.errors(),
            response,
            efficiencies,
        };
        let count_covariance = self.propagator.propagate(&step, &inputs)?;
        let probability_covariance = normalization_covariance(&step.unfolded, &count_covariance);

        let counts_vec: Vec<f64> = step.unfolded.iter().copied().collect();
        let probabilities: Vec<f64> = counts_vec.iter().map(|c| c / total).collect();
        Ok(MixOutcome {
            posterior: Distribution::new(
                "posterior",
                probabilities,
                diagonal_errors(&probability_covariance),
            )?,
            counts: Distribution::new("unfolded", counts_vec, diagonal_errors(&count_covariance))?,
            count_covariance,
            probability_covariance,
        })
    }
}

/// One Bayes update with a fresh mixer.
///
/// Returns the normalized posterior and its covariance. Iteration-dependent
/// covariance terms start from zero, which is exact for a first iteration.
pub fn mix(
    prior: &Distribution,
    observed: &Distribution,
    response: &ResponseMatrix,
    efficiencies: &Efficiencies,
    config: &MixerConfig,
) -> Result<(Distribution, DMatrix<f64>), UnfoldError> {
    let outcome = Mixer::new(config).mix_with(prior, observed, response, efficiencies)?;
    Ok((outcome.posterior, outcome.probability_covariance))
}
