use std::path::Path;

use ibu_core::errors::{ErrorInfo, UnfoldError};
use serde::{Deserialize, Serialize};

use crate::serde::{from_json_slice, from_yaml_slice};

fn config_error(code: &str, message: impl Into<String>) -> UnfoldError {
    UnfoldError::Configuration(ErrorInfo::new(code, message.into()))
}

/// Complete, immutable configuration of one unfolding run.
///
/// The regularization section and the stopping rule have no defaults: both
/// change what a run returns, so callers must spell them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfoldConfig {
    /// Initial cause distribution.
    #[serde(default)]
    pub prior: PriorConfig,
    /// Bayes step and covariance propagation.
    #[serde(default)]
    pub mixer: MixerConfig,
    /// Per-iteration smoothing.
    pub regularization: Regularization,
    /// Convergence test between successive iterates.
    #[serde(default)]
    pub test_statistic: TestStatConfig,
    /// Iteration budget and stacked stopping semantics.
    pub stopping: StoppingConfig,
}

impl UnfoldConfig {
    /// Configuration with every optional section at its default.
    pub fn new(regularization: Regularization, stopping: StoppingConfig) -> Self {
        Self {
            prior: PriorConfig::default(),
            mixer: MixerConfig::default(),
            regularization,
            test_statistic: TestStatConfig::default(),
            stopping,
        }
    }

    /// Parses a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, UnfoldError> {
        let config: Self = from_yaml_slice(text.as_bytes())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, UnfoldError> {
        let config: Self = from_json_slice(text.as_bytes())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.yaml`/`.yml` or `.json` file.
    pub fn from_path(path: &Path) -> Result<Self, UnfoldError> {
        let bytes = std::fs::read(path).map_err(|err| {
            UnfoldError::Serde(
                ErrorInfo::new("config_read", err.to_string())
                    .with_context("path", path.display()),
            )
        })?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => from_json_slice(&bytes)?,
            Some("yaml") | Some("yml") => from_yaml_slice(&bytes)?,
            other => {
                return Err(config_error(
                    "config-extension",
                    format!("unsupported configuration extension {other:?}"),
                ))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that do not depend on the cause-effect model.
    pub fn validate(&self) -> Result<(), UnfoldError> {
        if self.stopping.max_iter == 0 {
            return Err(config_error("max-iter-zero", "max_iter must be at least 1"));
        }
        let tolerance = self.test_statistic.tolerance;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(UnfoldError::Configuration(
                ErrorInfo::new("tolerance-invalid", "tolerance must be finite and non-negative")
                    .with_context("tolerance", tolerance),
            ));
        }
        if let Some([lo, hi]) = self.test_statistic.range {
            if !(lo < hi) {
                return Err(config_error(
                    "ts-range-invalid",
                    "test statistic range must satisfy lo < hi",
                ));
            }
        }
        if let ErrorPropagation::Dcm { samples, .. } = self.mixer.error_propagation {
            if samples < 2 {
                return Err(config_error(
                    "dcm-samples",
                    "resampled covariance needs at least two samples",
                ));
            }
        }
        if let Regularization::Fit(fit) = &self.regularization {
            fit.validate()?;
        }
        Ok(())
    }
}

/// Prior selection: one model broadcast to every group, or one per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PriorConfig {
    /// Model used for every group when `per_group` is empty.
    #[serde(default)]
    pub model: PriorSpec,
    /// Optional per-group models in interleave order.
    #[serde(default)]
    pub per_group: Vec<PriorSpec>,
}

impl PriorConfig {
    /// Broadcasts a single model.
    pub fn single(model: PriorSpec) -> Self {
        Self {
            model,
            per_group: Vec::new(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// Named prior models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PriorSpec {
    /// Equal probability per bin.
    #[default]
    Uniform,
    /// Non-informative `1 / x` prior over bin centers.
    Jeffreys,
    /// Flux `weight * x^index`.
    PowerLaw {
        /// Spectral index.
        index: f64,
        /// Relative abundance of the group.
        #[serde(default = "default_weight")]
        weight: f64,
    },
    /// Power law whose index changes at `break_at`, continuous at the break.
    BrokenPowerLaw {
        /// Index below the break.
        index_below: f64,
        /// Index above the break.
        index_above: f64,
        /// Break position on the axis.
        break_at: f64,
        /// Relative abundance of the group.
        #[serde(default = "default_weight")]
        weight: f64,
    },
    /// Caller-provided weights; normalized before use.
    UserSupplied {
        /// Non-negative weights, one per bin.
        values: Vec<f64>,
    },
}

/// Covariance propagation scheme used by the mixer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorPropagation {
    /// Analytic covariance matrix including iteration dependencies.
    #[default]
    Acm,
    /// Covariance estimated from resampled inputs.
    Dcm {
        /// Number of replicas per iteration.
        #[serde(default = "default_dcm_samples")]
        samples: usize,
        /// Master seed for the replica streams.
        #[serde(default = "default_dcm_seed")]
        seed: u64,
    },
}

fn default_dcm_samples() -> usize {
    500
}

fn default_dcm_seed() -> u64 {
    0x1B0F_u64
}

/// Mixer options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MixerConfig {
    /// Covariance scheme.
    #[serde(default)]
    pub error_propagation: ErrorPropagation,
}

/// Regularization toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Regularization {
    /// Pass-through.
    Disabled,
    /// Parametric fit of every intermediate posterior.
    Fit(FitConfig),
}

/// What the unfolder does when a regularization fit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegularizationFailurePolicy {
    /// Stop the run with the regularization error.
    Abort,
    /// Continue with the unregularized posterior for that iteration.
    FallBackToPosterior,
}

/// Parametric families available to the regularizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FitFunction {
    /// `sum_m p_m x^m`.
    Polynomial {
        /// Highest power.
        degree: usize,
    },
    /// `p_0 x^p_1`.
    PowerLaw,
    /// `exp(sum_m p_m (ln x)^m)`.
    LogPolynomial {
        /// Highest power of `ln x`.
        degree: usize,
    },
}

impl FitFunction {
    /// Number of free parameters.
    pub fn num_params(&self) -> usize {
        match self {
            FitFunction::Polynomial { degree } | FitFunction::LogPolynomial { degree } => {
                degree + 1
            }
            FitFunction::PowerLaw => 2,
        }
    }

    /// Whether the family is only defined for positive abscissae.
    pub fn needs_positive_x(&self) -> bool {
        !matches!(self, FitFunction::Polynomial { .. })
    }
}

fn default_fit_max_iter() -> usize {
    200
}

fn default_fit_tolerance() -> f64 {
    1e-10
}

/// Regularization fit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Fit family.
    pub function: FitFunction,
    /// Starting parameters.
    pub initial: Vec<f64>,
    /// Lower parameter limits.
    pub lower: Vec<f64>,
    /// Upper parameter limits.
    pub upper: Vec<f64>,
    /// Bins whose center lies in `[lo, hi]` enter the fit; all bins when absent.
    #[serde(default)]
    pub range: Option<[f64; 2]>,
    /// Levenberg-Marquardt iteration cap.
    #[serde(default = "default_fit_max_iter")]
    pub max_iter: usize,
    /// Relative chi-square change that ends the fit.
    #[serde(default = "default_fit_tolerance")]
    pub tolerance: f64,
    /// Failure handling; deliberately without a default.
    pub on_failure: RegularizationFailurePolicy,
}

impl FitConfig {
    /// Checks parameter vectors and limits.
    pub fn validate(&self) -> Result<(), UnfoldError> {
        let expected = self.function.num_params();
        for (name, values) in [
            ("initial", &self.initial),
            ("lower", &self.lower),
            ("upper", &self.upper),
        ] {
            if values.len() != expected {
                return Err(UnfoldError::Configuration(
                    ErrorInfo::new("fit-param-count", "wrong number of fit parameters")
                        .with_context("field", name)
                        .with_context("expected", expected)
                        .with_context("found", values.len()),
                ));
            }
        }
        for idx in 0..expected {
            let (lo, hi, init) = (self.lower[idx], self.upper[idx], self.initial[idx]);
            if !(lo.is_finite() && hi.is_finite() && init.is_finite()) || lo > hi {
                return Err(UnfoldError::Configuration(
                    ErrorInfo::new("fit-limits", "parameter limits must be finite with lo <= hi")
                        .with_context("param", idx),
                ));
            }
            if init < lo || init > hi {
                return Err(UnfoldError::Configuration(
                    ErrorInfo::new("fit-initial-outside", "initial parameter outside its limits")
                        .with_context("param", idx)
                        .with_context("initial", init),
                ));
            }
        }
        if let Some([lo, hi]) = self.range {
            if !(lo < hi) {
                return Err(config_error("fit-range", "fit range must satisfy lo < hi"));
            }
        }
        if self.max_iter == 0 || !(self.tolerance > 0.0) {
            return Err(config_error(
                "fit-solver",
                "fit max_iter must be positive and tolerance strictly positive",
            ));
        }
        Ok(())
    }
}

/// Supported convergence statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestStatKind {
    /// Two-sample chi-square per contributing bin.
    Chi2,
    /// Kolmogorov-Smirnov distance.
    #[default]
    Ks,
    /// Relative mean difference.
    Rmd,
    /// Power fraction of the difference.
    Pf,
}

fn default_tolerance() -> f64 {
    0.01
}

/// Convergence test settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatConfig {
    /// Statistic kind.
    #[serde(default)]
    pub kind: TestStatKind,
    /// Converged when the statistic is strictly below this value.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Optional `[lo, hi]` window on bin centers.
    #[serde(default)]
    pub range: Option<[f64; 2]>,
}

impl Default for TestStatConfig {
    fn default() -> Self {
        Self {
            kind: TestStatKind::default(),
            tolerance: default_tolerance(),
            range: None,
        }
    }
}

/// How convergence is decided for stacked layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingRule {
    /// One statistic over the full interleaved vector.
    Combined,
    /// Every group must converge on its own sub-slice.
    PerGroup,
}

fn default_max_iter() -> usize {
    100
}

/// Iteration budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppingConfig {
    /// Maximum number of iterations.
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Stacked stopping semantics; deliberately without a default.
    pub rule: StoppingRule,
}

impl StoppingConfig {
    /// Budget with the given rule.
    pub fn new(max_iter: usize, rule: StoppingRule) -> Self {
        Self { max_iter, rule }
    }
}
