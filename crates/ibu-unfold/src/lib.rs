#![deny(missing_docs)]
#![doc = "Iterative Bayesian unfolding of cosmic-ray energy and composition spectra."]

/// Configuration schema and loaders.
pub mod config;
/// ACM and DCM covariance propagation.
pub mod covariance;
/// Parallel execution of independent unfoldings.
pub mod ensemble;
/// Canonical hashing helpers.
pub mod hash;
/// Discretized Bayes update.
pub mod mixer;
/// Response matrix, efficiencies and cause/effect binning.
pub mod model;
/// Initial cause distributions.
pub mod prior;
/// Parametric smoothing of intermediate posteriors.
pub mod regularize;
/// Canonical JSON and YAML serde helpers.
pub mod serde;
/// Convergence statistics.
pub mod teststat;
/// Iteration state machine.
pub mod unfolder;

pub use config::{
    ErrorPropagation, FitConfig, FitFunction, MixerConfig, PriorConfig, PriorSpec, Regularization,
    RegularizationFailurePolicy, StoppingConfig, StoppingRule, TestStatConfig, TestStatKind,
    UnfoldConfig,
};
pub use covariance::{build_propagator, AnalyticPropagator, CovariancePropagator, ResampledPropagator};
pub use ensemble::{
    run_ensemble, EnsembleJob, EnsembleOpts, EnsembleReport, EnsembleSummary, JobOutcome, JobReport,
};
pub use hash::{round_all, round_f64, stable_hash_string};
pub use mixer::{bayes_step, mix, normalization_covariance, BayesStep, MixOutcome, Mixer};
pub use model::{
    ratio_error, CauseEffectModel, Efficiencies, GroupSpec, ResponseMatrix, StackedModelSpec,
};
pub use prior::Prior;
pub use regularize::{fit_distribution, FitSummary, Regularizer};
pub use teststat::{statistic, StatisticReport, TestStatistic};
pub use unfolder::{
    IterativeUnfolder, RegularizationOutcome, RunFailure, TerminalStatus, UnfoldingResult,
    UnfoldingRun,
};

pub use ibu_core::{Axis, BinLayout, Distribution, ErrorInfo, StackedBinGroup, UnfoldError};
