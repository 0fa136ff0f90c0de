use std::collections::BTreeMap;

use ibu_core::errors::{ErrorInfo, UnfoldError};
use ibu_core::{BinLayout, Distribution, RunProvenance, SchemaVersion};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ErrorPropagation, RegularizationFailurePolicy, UnfoldConfig};
use crate::hash::{round_all, stable_hash_string};
use crate::mixer::{MixOutcome, Mixer};
use crate::model::CauseEffectModel;
use crate::prior::Prior;
use crate::regularize::Regularizer;
use crate::teststat::{StatisticReport, TestStatistic};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// The test statistic fell below tolerance.
    Converged,
    /// The iteration budget ran out first.
    MaxIterReached,
    /// A distribution, covariance or statistic became non-finite.
    Diverged,
}

/// What the regularizer did in one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegularizationOutcome {
    /// No smoothing configured.
    Disabled,
    /// The smoothed fit became the next prior.
    Applied,
    /// The fit failed and the raw posterior was used instead.
    FellBack {
        /// Why the fit failed.
        reason: ErrorInfo,
    },
}

/// Snapshot of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfoldingResult {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Normalized posterior straight from the Bayes update.
    pub posterior: Distribution,
    /// Distribution handed to the next iteration as prior.
    pub smoothed: Distribution,
    /// Efficiency-corrected cause counts.
    pub counts: Distribution,
    /// Covariance of `posterior`.
    pub probability_covariance: DMatrix<f64>,
    /// Covariance of `counts`.
    pub count_covariance: DMatrix<f64>,
    /// Convergence test of `smoothed` against this iteration's prior.
    pub statistic: StatisticReport,
    /// Regularization step outcome.
    pub regularization: RegularizationOutcome,
    /// Set on the last snapshot of a completed run.
    pub terminal: bool,
}

/// Completed run, converged or out of iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfoldingRun {
    /// Every iteration in order.
    pub history: Vec<UnfoldingResult>,
    /// Terminal status, never `Diverged`.
    pub status: TerminalStatus,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Total observed events.
    pub n_observed: f64,
    /// Layout of the cause vector.
    pub cause_layout: BinLayout,
    /// Hashes of the inputs that produced the run.
    pub provenance: RunProvenance,
    /// Hash of the rounded iteration trajectory, final uncertainties, status and provenance.
    pub digest: String,
    probabilities: Distribution,
    probability_covariance: DMatrix<f64>,
}

impl UnfoldingRun {
    /// Final cause probabilities with uncertainties.
    pub fn final_probabilities(&self) -> &Distribution {
        &self.probabilities
    }

    /// Covariance of [`UnfoldingRun::final_probabilities`].
    pub fn final_probability_covariance(&self) -> &DMatrix<f64> {
        &self.probability_covariance
    }

    /// Final probabilities scaled to the total observed events.
    pub fn final_counts(&self) -> Distribution {
        let mut counts = self.probabilities.scaled(self.n_observed);
        counts.name = "final_counts".into();
        counts
    }

    /// Covariance of [`UnfoldingRun::final_counts`].
    pub fn final_count_covariance(&self) -> DMatrix<f64> {
        &self.probability_covariance * (self.n_observed * self.n_observed)
    }

    /// Final probabilities of one stacked group, still summing to its fraction.
    pub fn group_probabilities(&self, group: usize) -> Result<Distribution, UnfoldError> {
        self.probabilities.group(&self.cause_layout, group)
    }
}

/// Error of a run together with the iterations completed before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    /// What stopped the run.
    pub error: UnfoldError,
    /// Snapshots of every completed iteration.
    pub history: Vec<UnfoldingResult>,
}

impl RunFailure {
    /// `Diverged` for divergence, `None` for any other failure.
    pub fn status(&self) -> Option<TerminalStatus> {
        matches!(self.error, UnfoldError::Divergence(_)).then_some(TerminalStatus::Diverged)
    }
}

impl From<UnfoldError> for RunFailure {
    fn from(error: UnfoldError) -> Self {
        Self {
            error,
            history: Vec::new(),
        }
    }
}

fn divergence(iteration: usize, quantity: &str) -> UnfoldError {
    UnfoldError::Divergence(
        ErrorInfo::new("diverged", format!("{quantity} is not finite"))
            .with_context("iteration", iteration)
            .with_hint("inspect the response matrix for empty effect bins or lower the iteration budget"),
    )
}

/// Iterative Bayesian unfolding over a fixed cause/effect model.
///
/// All configuration is checked against the model at construction; a run
/// only fails on its observed input or on numerical breakdown.
#[derive(Debug, Clone)]
pub struct IterativeUnfolder {
    model: CauseEffectModel,
    config: UnfoldConfig,
    prior: Prior,
    regularizer: Regularizer,
    statistic: TestStatistic,
    config_hash: String,
    model_hash: String,
}

impl IterativeUnfolder {
    /// Validates `config` against `model`.
    pub fn new(model: CauseEffectModel, config: UnfoldConfig) -> Result<Self, UnfoldError> {
        config.validate()?;
        let layout = model.cause_layout();
        let prior = Prior::new(config.prior.clone());
        prior.check(layout)?;
        let regularizer = Regularizer::new(&config.regularization, layout)?;
        let statistic = TestStatistic::new(&config.test_statistic, layout)?;
        let config_hash = stable_hash_string(&config)?;
        let model_hash = stable_hash_string(&model)?;
        Ok(Self {
            model,
            config,
            prior,
            regularizer,
            statistic,
            config_hash,
            model_hash,
        })
    }

    /// Cause/effect model in use.
    pub fn model(&self) -> &CauseEffectModel {
        &self.model
    }

    /// Validated configuration.
    pub fn config(&self) -> &UnfoldConfig {
        &self.config
    }

    fn check_observed(&self, observed: &Distribution) -> Result<f64, UnfoldError> {
        if observed.len() != self.model.num_effects() {
            return Err(UnfoldError::shape(
                "observed-length",
                "observed distribution",
                self.model.num_effects(),
                observed.len(),
            ));
        }
        observed.validate_non_negative()?;
        if observed.errors().iter().any(|e| !e.is_finite() || *e < 0.0) {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("observed-errors", "observed uncertainties must be finite and non-negative")
                    .with_context("name", &observed.name),
            ));
        }
        let total = observed.total();
        if !(total > 0.0) {
            return Err(UnfoldError::Validation(
                ErrorInfo::new("observed-total", "observed distribution has no events")
                    .with_context("name", &observed.name),
            ));
        }
        Ok(total)
    }

    fn provenance(&self, observed: &Distribution) -> Result<RunProvenance, UnfoldError> {
        let seed = match self.config.mixer.error_propagation {
            ErrorPropagation::Dcm { seed, .. } => Some(seed),
            ErrorPropagation::Acm => None,
        };
        let mut tool_versions = BTreeMap::new();
        tool_versions.insert("ibu-unfold".to_string(), env!("CARGO_PKG_VERSION").to_string());
        Ok(RunProvenance {
            schema_version: SchemaVersion::default(),
            config_hash: self.config_hash.clone(),
            model_hash: self.model_hash.clone(),
            observed_hash: stable_hash_string(&(
                round_all(observed.values()),
                round_all(observed.errors()),
            ))?,
            seed,
            tool_versions,
        })
    }

    fn regularize(
        &self,
        iteration: usize,
        posterior: &Distribution,
    ) -> Result<(Distribution, RegularizationOutcome), UnfoldError> {
        let policy = match &self.regularizer {
            Regularizer::PassThrough => {
                return Ok((posterior.clone(), RegularizationOutcome::Disabled))
            }
            Regularizer::Fit(fit) => fit.on_failure,
        };
        let smoothed = self
            .regularizer
            .smooth_layout(posterior, self.model.cause_layout())
            .and_then(|dist| dist.normalized());
        match (smoothed, policy) {
            (Ok(dist), _) => Ok((dist, RegularizationOutcome::Applied)),
            (Err(err), RegularizationFailurePolicy::Abort) => Err(err),
            (Err(err), RegularizationFailurePolicy::FallBackToPosterior) => {
                tracing::warn!(
                    iteration,
                    code = %err.info().code,
                    "regularization failed, continuing with the raw posterior"
                );
                Ok((
                    posterior.clone(),
                    RegularizationOutcome::FellBack {
                        reason: err.info().clone(),
                    },
                ))
            }
        }
    }

    fn check_finite(iteration: usize, outcome: &MixOutcome) -> Result<(), UnfoldError> {
        if !outcome.posterior.is_finite() || !outcome.counts.is_finite() {
            return Err(divergence(iteration, "posterior"));
        }
        if outcome.count_covariance.iter().any(|v| !v.is_finite())
            || outcome.probability_covariance.iter().any(|v| !v.is_finite())
        {
            return Err(divergence(iteration, "covariance"));
        }
        Ok(())
    }

    fn iterate(
        &self,
        mixer: &mut Mixer,
        prior: &Distribution,
        observed: &Distribution,
        iteration: usize,
    ) -> Result<UnfoldingResult, UnfoldError> {
        let layout = self.model.cause_layout();
        let outcome = mixer.mix(prior, observed, &self.model)?;
        // The fit must never see a non-finite posterior.
        Self::check_finite(iteration, &outcome)?;
        let (mut smoothed, regularization) = self.regularize(iteration, &outcome.posterior)?;
        if !smoothed.is_finite() {
            return Err(divergence(iteration, "regularized posterior"));
        }
        let statistic =
            self.statistic
                .evaluate(prior, &smoothed, self.config.stopping.rule, layout)?;
        if statistic.value.is_nan() {
            return Err(divergence(iteration, "test statistic"));
        }
        smoothed.name = format!("iteration_{iteration}");
        Ok(UnfoldingResult {
            iteration,
            posterior: outcome.posterior,
            smoothed,
            counts: outcome.counts,
            probability_covariance: outcome.probability_covariance,
            count_covariance: outcome.count_covariance,
            statistic,
            regularization,
            terminal: false,
        })
    }

    /// Unfolds `observed` until convergence or the iteration budget runs out.
    pub fn run(&self, observed: &Distribution) -> Result<UnfoldingRun, RunFailure> {
        let n_observed = self.check_observed(observed)?;
        let layout = self.model.cause_layout();
        let provenance = self.provenance(observed)?;
        let mut prior = self.prior.initial_distribution(n_observed, layout)?;
        let mut mixer = Mixer::new(&self.config.mixer);
        let max_iter = self.config.stopping.max_iter;
        let mut history: Vec<UnfoldingResult> = Vec::new();

        tracing::debug!(
            n_observed,
            causes = layout.len(),
            scheme = mixer.scheme(),
            "unfolding initialized"
        );

        let status = loop {
            let iteration = history.len() + 1;
            let step = self.iterate(&mut mixer, &prior, observed, iteration);
            let result = match step {
                Ok(result) => result,
                Err(error) => {
                    if matches!(error, UnfoldError::Divergence(_)) {
                        tracing::warn!(iteration, "unfolding diverged");
                    }
                    return Err(RunFailure { error, history });
                }
            };

            tracing::debug!(
                iteration,
                statistic = result.statistic.value,
                converged = result.statistic.converged,
                "unfolding iteration"
            );
            let converged = result.statistic.converged;
            prior = result.smoothed.clone();
            history.push(result);
            if converged {
                break TerminalStatus::Converged;
            }
            if iteration >= max_iter {
                break TerminalStatus::MaxIterReached;
            }
        };

        let Some(last) = history.last_mut() else {
            return Err(RunFailure::from(UnfoldError::Configuration(ErrorInfo::new(
                "no-iterations",
                "run finished without iterations",
            ))));
        };
        last.terminal = true;
        let mut probabilities = last.smoothed.clone();
        probabilities.name = "final_probabilities".into();
        let probability_covariance = last.probability_covariance.clone();
        let iterations = history.len();
        let trajectory: Vec<Vec<f64>> = history
            .iter()
            .map(|result| round_all(result.smoothed.values()))
            .collect();
        let digest = stable_hash_string(&(
            status,
            iterations,
            trajectory,
            round_all(probabilities.errors()),
            &provenance,
        ))
        .map_err(|error| RunFailure {
            error,
            history: history.clone(),
        })?;

        tracing::info!(?status, iterations, "unfolding finished");
        Ok(UnfoldingRun {
            history,
            status,
            iterations,
            n_observed,
            cause_layout: layout.clone(),
            provenance,
            digest,
            probabilities,
            probability_covariance,
        })
    }
}
